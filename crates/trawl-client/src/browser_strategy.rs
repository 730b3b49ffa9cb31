use std::path::PathBuf;
use std::sync::Arc;

use chromiumoxide::cdp::browser_protocol::emulation::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::CookieParam;
use chromiumoxide::{Browser, BrowserConfig};
use futures::StreamExt;
use futures::future::BoxFuture;
use trawl_core::error::AppError;
use trawl_core::job::{ScrapingConfig, Target};
use trawl_core::models::Payload;
use trawl_core::strategy::{Capabilities, Strategy};

use crate::extract::{Extractor, detect_anti_bot};

/// Flags that hide the most obvious automation fingerprints.
const STEALTH_ARGS: &[&str] = &[
    "--disable-blink-features=AutomationControlled",
    "--window-size=1920,1080",
    "--lang=en-US,en",
];

/// Headless Chromium strategy driven over the Chrome DevTools Protocol.
///
/// Renders JavaScript before extraction, so it handles SPAs and lazy-loaded
/// content. A single Chromium process is shared across clones; each attempt
/// opens a tab, reads the rendered DOM and closes the tab.
///
/// Two flavors are registered under different names: `"browser"` and
/// `"stealth-browser"`, the latter launched with [`STEALTH_ARGS`].
///
/// ```rust,no_run
/// use trawl_client::BrowserStrategy;
///
/// # async fn run() -> Result<(), trawl_core::AppError> {
/// let browser = BrowserStrategy::launch().await?;
/// let stealth = BrowserStrategy::launch_stealth().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct BrowserStrategy {
    browser: Arc<Browser>,
    stealth: bool,
    extractor: Extractor,
}

impl BrowserStrategy {
    /// Launch a plain headless Chromium.
    ///
    /// Requires a Chromium / Chrome binary reachable via `$PATH`, `CHROME_BIN`
    /// or the default locations checked by `chromiumoxide`.
    pub async fn launch() -> Result<Self, AppError> {
        Self::launch_with(false).await
    }

    /// Launch a headless Chromium with automation-hiding flags.
    pub async fn launch_stealth() -> Result<Self, AppError> {
        Self::launch_with(true).await
    }

    async fn launch_with(stealth: bool) -> Result<Self, AppError> {
        let mut builder = BrowserConfig::builder().no_sandbox().disable_default_args();

        if let Some(bin) = find_chrome_binary() {
            tracing::info!(binary = %bin.display(), "Using Chrome binary");
            builder = builder.chrome_executable(bin);
        }

        builder = builder
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--no-first-run");
        if stealth {
            for arg in STEALTH_ARGS {
                builder = builder.arg(*arg);
            }
        }

        let config = builder
            .build()
            .map_err(|e| AppError::ConfigError(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AppError::ConfigError(format!("Failed to launch browser: {e}")))?;

        // The CDP handler must be polled continuously for the connection to work.
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::warn!(error = %e, "Browser CDP handler error");
                    break;
                }
            }
        });

        Ok(Self {
            browser: Arc::new(browser),
            stealth,
            extractor: Extractor::new(),
        })
    }

    async fn render(&self, target: &Target, config: &ScrapingConfig) -> Result<String, AppError> {
        let url = &target.url;
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| AppError::StrategyTransient(format!("Failed to open tab: {e}")))?;

        let rendered = async {
            if let Some(agent) = &config.user_agent {
                page.set_user_agent(SetUserAgentOverrideParams::new(agent.clone()))
                    .await
                    .map_err(|e| AppError::StrategyTransient(format!("Failed to set user agent: {e}")))?;
            }

            if !target.cookies.is_empty() {
                let cookies = target
                    .cookies
                    .iter()
                    .map(|(name, value)| {
                        let mut cookie = CookieParam::new(name.clone(), value.clone());
                        cookie.url = Some(url.clone());
                        cookie
                    })
                    .collect::<Vec<_>>();
                page.set_cookies(cookies)
                    .await
                    .map_err(|e| AppError::StrategyTransient(format!("Failed to set cookies: {e}")))?;
            }

            page.goto(url.as_str())
                .await
                .map_err(|e| AppError::NetworkError(format!("Failed to navigate to {url}: {e}")))?;

            // <body> present is the minimal signal that the page rendered.
            page.find_element("body")
                .await
                .map_err(|e| AppError::StrategyTransient(format!("Page did not render body: {e}")))?;

            page.content()
                .await
                .map_err(|e| AppError::StrategyTransient(format!("Failed to read page content: {e}")))
        };

        let result = tokio::time::timeout(config.timeout, rendered)
            .await
            .unwrap_or_else(|_| Err(AppError::Timeout(config.timeout.as_millis() as u64)));

        if let Err(e) = page.close().await {
            tracing::debug!(error = %e, "Failed to close browser tab");
        }
        result
    }

    async fn scrape(&self, target: &Target, config: &ScrapingConfig) -> Result<Payload, AppError> {
        if config.use_proxy {
            return Err(AppError::ValidationError(
                "use_proxy is not supported by browser strategies".into(),
            ));
        }

        let html = self.render(target, config).await?;
        if let Some(wall) = detect_anti_bot(&html, false) {
            return Err(AppError::AntiBotDetected(format!(
                "{wall} in rendered page at {}",
                target.url
            )));
        }
        self.extractor.extract(&html, &target.extraction)
    }
}

impl Strategy for BrowserStrategy {
    fn name(&self) -> &str {
        if self.stealth { "stealth-browser" } else { "browser" }
    }

    fn capabilities(&self) -> Capabilities {
        if self.stealth {
            Capabilities {
                handles_javascript: true,
                stealth_level: 3,
                cost: 8,
            }
        } else {
            Capabilities {
                handles_javascript: true,
                stealth_level: 2,
                cost: 5,
            }
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

/// Locate a usable Chrome/Chromium binary.
///
/// The snap wrapper at `/snap/bin/chromium` strips unknown CLI flags and
/// breaks headless mode, so the real binary inside the snap is preferred.
/// Returns `None` to let `chromiumoxide` do its own lookup.
fn find_chrome_binary() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("CHROME_BIN") {
        let path = PathBuf::from(p);
        if path.exists() {
            return Some(path);
        }
    }

    [
        "/snap/chromium/current/usr/lib/chromium-browser/chrome",
        "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
    ]
    .iter()
    .map(PathBuf::from)
    .find(|p| p.exists())
}
