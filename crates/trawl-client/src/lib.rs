#[cfg(feature = "browser")]
pub mod browser_strategy;
pub mod extract;
pub mod http_strategy;

#[cfg(feature = "browser")]
pub use browser_strategy::BrowserStrategy;
pub use extract::{Extractor, detect_anti_bot};
pub use http_strategy::HttpStrategy;
