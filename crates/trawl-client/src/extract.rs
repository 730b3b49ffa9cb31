use std::sync::Arc;

use htmd::HtmlToMarkdown;
use scraper::{Html, Selector};
use serde_json::Value;
use trawl_core::error::AppError;
use trawl_core::job::ExtractionSpec;
use trawl_core::models::Payload;

/// Characters of page text kept when no selector matched.
const CONTENT_PREVIEW_CHARS: usize = 1000;

/// Applies an [`ExtractionSpec`] to a rendered HTML document.
///
/// Each named selector yields one whitespace-normalized string, or an array
/// when several nodes match. Fields with no match are left out. When nothing
/// was extracted the payload falls back to the page `title` and the first
/// 1000 characters of its markdown text as `content`.
#[derive(Clone)]
pub struct Extractor {
    converter: Arc<HtmlToMarkdown>,
}

impl Extractor {
    pub fn new() -> Self {
        let converter = HtmlToMarkdown::builder()
            .skip_tags(vec![
                "script", "style", "nav", "footer", "header", "aside", "noscript", "iframe", "svg",
            ])
            .build();

        Self {
            converter: Arc::new(converter),
        }
    }

    pub fn extract(&self, html: &str, spec: &ExtractionSpec) -> Result<Payload, AppError> {
        // Parse every selector up front so a bad descriptor fails the same way
        // regardless of page content.
        let selectors = spec
            .selectors
            .iter()
            .map(|(field, css)| {
                Selector::parse(css)
                    .map(|selector| (field, selector))
                    .map_err(|e| {
                        AppError::ExtractionError(format!(
                            "invalid selector '{css}' for field '{field}': {e:?}"
                        ))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let document = Html::parse_document(html);
        let mut payload = Payload::new();

        for (field, selector) in &selectors {
            let mut values: Vec<String> = document
                .select(selector)
                .map(|el| clean_text(&el.text().collect::<String>()))
                .collect();
            match values.len() {
                0 => {}
                1 => {
                    payload.insert(field.to_string(), Value::String(values.remove(0)));
                }
                _ => {
                    payload.insert(
                        field.to_string(),
                        Value::Array(values.into_iter().map(Value::String).collect()),
                    );
                }
            }
        }

        if payload.is_empty() {
            payload.insert("title".into(), Value::String(page_title(&document)));
            payload.insert("content".into(), Value::String(self.preview(html)));
        }
        Ok(payload)
    }

    fn preview(&self, html: &str) -> String {
        let text = match self.converter.convert(html) {
            Ok(markdown) => markdown,
            Err(e) => {
                tracing::debug!(error = %e, "Markdown conversion failed, using raw text");
                Html::parse_document(html).root_element().text().collect()
            }
        };
        clean_text(&text).chars().take(CONTENT_PREVIEW_CHARS).collect()
    }
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new()
    }
}

fn page_title(document: &Html) -> String {
    Selector::parse("title")
        .ok()
        .and_then(|selector| document.select(&selector).next())
        .map(|el| clean_text(&el.text().collect::<String>()))
        .unwrap_or_default()
}

/// Collapse runs of whitespace and trim.
fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ---------------------------------------------------------------------------
// Anti-bot detection
// ---------------------------------------------------------------------------

/// Markers that only appear on challenge interstitials.
const CHALLENGE_MARKERS: &[(&str, &str)] = &[
    ("cf-chl", "Cloudflare challenge"),
    ("/cdn-cgi/challenge-platform/", "Cloudflare challenge"),
    ("<title>just a moment...</title>", "Cloudflare interstitial"),
    ("attention required! | cloudflare", "Cloudflare block page"),
    ("cf-turnstile", "Cloudflare Turnstile"),
    ("captcha-delivery.com", "DataDome captcha"),
    ("px-captcha", "PerimeterX captcha"),
    ("_incapsula_resource", "Imperva challenge"),
];

/// Captcha widgets also show up on ordinary forms, so they only count on
/// pages served with a blocking status.
const CAPTCHA_MARKERS: &[(&str, &str)] = &[
    ("g-recaptcha", "reCAPTCHA"),
    ("h-captcha", "hCaptcha"),
    ("hcaptcha.com", "hCaptcha"),
];

/// Return a description of the anti-bot wall `html` shows, if any.
///
/// `blocked_status` should be true when the page came with 403 or 503.
pub fn detect_anti_bot(html: &str, blocked_status: bool) -> Option<&'static str> {
    let lower = html.to_ascii_lowercase();

    if let Some((_, name)) = CHALLENGE_MARKERS.iter().find(|(m, _)| lower.contains(m)) {
        return Some(name);
    }
    if !blocked_status {
        return None;
    }
    if let Some((_, name)) = CAPTCHA_MARKERS.iter().find(|(m, _)| lower.contains(m)) {
        return Some(name);
    }
    if lower.contains("access denied") && (lower.contains("bot") || lower.contains("automated")) {
        return Some("access denied page");
    }
    None
}
