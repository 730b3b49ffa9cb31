use std::net::IpAddr;
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::header::{COOKIE, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::{Client, Proxy, Response};
use trawl_core::error::AppError;
use trawl_core::job::{ScrapingConfig, Target};
use trawl_core::models::Payload;
use trawl_core::strategy::{Capabilities, Strategy};
use url::Url;

use crate::extract::{Extractor, detect_anti_bot};

const DEFAULT_USER_AGENT: &str = "Trawl/0.1 (+https://github.com/trawl-rs/trawl)";

/// Static HTTP fetch plus CSS extraction. Cheapest strategy, no JavaScript.
///
/// By default, SSRF protection is **enabled**: requests to private/reserved
/// IP ranges are rejected before any connection is made. Use
/// [`allow_private_urls`](Self::allow_private_urls) to disable this (e.g.
/// for CLI usage where the user controls the machine).
#[derive(Clone)]
pub struct HttpStrategy {
    client: Client,
    proxy_client: Option<Client>,
    ssrf_protection: bool,
    extractor: Extractor,
}

impl HttpStrategy {
    pub fn new() -> Result<Self, AppError> {
        Ok(Self {
            client: build_client(None)?,
            proxy_client: None,
            ssrf_protection: true,
            extractor: Extractor::new(),
        })
    }

    /// Route targets with `use_proxy` through `proxy_url`.
    pub fn with_proxy(mut self, proxy_url: &str) -> Result<Self, AppError> {
        let proxy = Proxy::all(proxy_url)
            .map_err(|e| AppError::ConfigError(format!("Invalid proxy URL '{proxy_url}': {e}")))?;
        self.proxy_client = Some(build_client(Some(proxy))?);
        Ok(self)
    }

    /// Disable SSRF protection, allowing requests to private/reserved IPs.
    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }

    async fn scrape(&self, target: &Target, config: &ScrapingConfig) -> Result<Payload, AppError> {
        let client = if config.use_proxy {
            self.proxy_client.as_ref().ok_or_else(|| {
                AppError::ValidationError(
                    "use_proxy is set but no proxy is configured for the http strategy".into(),
                )
            })?
        } else {
            &self.client
        };

        if self.ssrf_protection {
            validate_url(&target.url).await?;
        }

        let response = client
            .get(&target.url)
            .timeout(config.timeout)
            .headers(request_headers(target, config)?)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, config.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            if matches!(code, 403 | 503) {
                let body = read_body(response, config.timeout).await.unwrap_or_default();
                if let Some(wall) = detect_anti_bot(&body, true) {
                    return Err(AppError::AntiBotDetected(format!(
                        "{wall} (HTTP {code}) at {}",
                        target.url
                    )));
                }
            }
            return Err(AppError::HttpStatus {
                status: code,
                url: target.url.clone(),
            });
        }

        let html = read_body(response, config.timeout).await?;
        if let Some(wall) = detect_anti_bot(&html, false) {
            return Err(AppError::AntiBotDetected(format!("{wall} at {}", target.url)));
        }

        self.extractor.extract(&html, &target.extraction)
    }
}

impl Strategy for HttpStrategy {
    fn name(&self) -> &str {
        "http"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            handles_javascript: false,
            stealth_level: 1,
            cost: 1,
        }
    }

    fn try_scrape<'a>(
        &'a self,
        target: &'a Target,
        config: &'a ScrapingConfig,
    ) -> BoxFuture<'a, Result<Payload, AppError>> {
        Box::pin(self.scrape(target, config))
    }
}

fn build_client(proxy: Option<Proxy>) -> Result<Client, AppError> {
    let mut builder = Client::builder()
        .user_agent(DEFAULT_USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(10));
    // System proxy settings are ignored; only `use_proxy` routes through one.
    builder = match proxy {
        Some(proxy) => builder.proxy(proxy),
        None => builder.no_proxy(),
    };
    builder
        .build()
        .map_err(|e| AppError::ConfigError(format!("Failed to build HTTP client: {e}")))
}

fn request_headers(target: &Target, config: &ScrapingConfig) -> Result<HeaderMap, AppError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        reqwest::header::ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    );

    for (name, value) in &config.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| AppError::ValidationError(format!("Invalid header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| AppError::ValidationError(format!("Invalid header value: {e}")))?;
        headers.insert(name, value);
    }

    if let Some(agent) = &config.user_agent {
        let value = HeaderValue::from_str(agent)
            .map_err(|e| AppError::ValidationError(format!("Invalid user agent: {e}")))?;
        headers.insert(USER_AGENT, value);
    }

    if !target.cookies.is_empty() {
        let cookie = target
            .cookies
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("; ");
        let value = HeaderValue::from_str(&cookie)
            .map_err(|e| AppError::ValidationError(format!("Invalid cookie: {e}")))?;
        headers.insert(COOKIE, value);
    }

    Ok(headers)
}

async fn read_body(response: Response, timeout: Duration) -> Result<String, AppError> {
    response
        .text()
        .await
        .map_err(|e| map_reqwest_error(e, timeout))
}

fn map_reqwest_error(e: reqwest::Error, timeout: Duration) -> AppError {
    if e.is_timeout() {
        AppError::Timeout(timeout.as_millis() as u64)
    } else if e.is_builder() {
        AppError::ValidationError(format!("Invalid request: {e}"))
    } else if e.is_connect() {
        AppError::NetworkError(format!("Connection failed: {e}"))
    } else {
        AppError::NetworkError(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Validate a URL to prevent server-side request forgery (SSRF).
///
/// 1. Only allow `http` and `https` schemes.
/// 2. Resolve the hostname via DNS.
/// 3. Reject if any resolved IP is private/reserved.
async fn validate_url(url: &str) -> Result<(), AppError> {
    let parsed =
        Url::parse(url).map_err(|e| AppError::ValidationError(format!("Invalid URL: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::ValidationError(format!(
                "URL scheme '{scheme}' is not allowed (only http/https)"
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::ValidationError("URL has no host".to_string()))?;

    // IPv6 literals come back bracketed from host_str.
    let literal = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = literal.parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Err(AppError::ValidationError(format!(
                "SSRF blocked: {host} is a private/reserved IP"
            )));
        }
        return Ok(());
    }

    let port = parsed.port_or_known_default().unwrap_or(80);
    let addrs: Vec<_> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| AppError::NetworkError(format!("DNS resolution failed for {host}: {e}")))?
        .collect();

    if addrs.is_empty() {
        return Err(AppError::NetworkError(format!(
            "DNS resolution returned no addresses for {host}"
        )));
    }

    if let Some(blocked) = addrs.iter().find(|addr| is_private_ip(addr.ip())) {
        return Err(AppError::ValidationError(format!(
            "SSRF blocked: {host} resolves to private/reserved IP {}",
            blocked.ip()
        )));
    }

    Ok(())
}

/// Check if an IP address is in a private/reserved/link-local range.
fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local() // 169.254.0.0/16, cloud metadata
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64 // 100.64.0.0/10 (CGN)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xFFC0) == 0xFE80 // fe80::/10
                || (v6.segments()[0] & 0xFE00) == 0xFC00 // fc00::/7
                || v6
                    .to_ipv4_mapped()
                    .is_some_and(|v4| is_private_ip(IpAddr::V4(v4)))
        }
    }
}
