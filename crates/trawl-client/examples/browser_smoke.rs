/// Smoke-test for the browser strategies.
///
/// Launches both headless Chromium flavors, scrapes <https://example.com>
/// with a heading selector and checks the extracted payload.
///
/// Run with:
///   cargo run --example browser_smoke --features browser
use trawl_client::BrowserStrategy;
use trawl_core::job::{DataType, ScrapingConfig, Target};
use trawl_core::strategy::Strategy;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let target = Target::new("https://example.com", DataType::GeneralData).with_selector("heading", "h1");
    let config = ScrapingConfig::default().with_javascript(true);

    for strategy in [
        BrowserStrategy::launch().await?,
        BrowserStrategy::launch_stealth().await?,
    ] {
        println!("Scraping {} with {}", target.url, strategy.name());
        let payload = strategy.try_scrape(&target, &config).await?;
        anyhow::ensure!(
            payload.get("heading").and_then(|v| v.as_str()) == Some("Example Domain"),
            "unexpected payload from {}: {payload:?}",
            strategy.name()
        );
        println!("OK: {}", serde_json::Value::Object(payload));
    }
    Ok(())
}
