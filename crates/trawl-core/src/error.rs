use std::time::Duration;

use thiserror::Error;

/// Application-wide error types for Trawl.
#[derive(Error, Debug)]
pub enum AppError {
    /// The target answered with a non-success HTTP status.
    #[error("HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    /// Network/connection error (reset, refused, DNS).
    #[error("Network error: {0}")]
    NetworkError(String),

    /// A single attempt exceeded its timeout.
    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    /// The page is an anti-bot challenge rather than content.
    #[error("Anti-bot challenge detected: {0}")]
    AntiBotDetected(String),

    /// A strategy reported a failure it considers transient.
    #[error("Transient strategy failure: {0}")]
    StrategyTransient(String),

    /// No rate-limit token became available in time.
    #[error("Rate limit exceeded for {domain} (waited {waited_ms} ms)")]
    RateLimitExceeded { domain: String, waited_ms: u64 },

    /// The domain's circuit breaker rejected the call.
    #[error("Circuit open for {domain}, retry after {}s", retry_after.as_secs())]
    CircuitOpen { domain: String, retry_after: Duration },

    /// The extraction descriptor could not be applied (e.g. bad selector).
    #[error("Extraction error: {0}")]
    ExtractionError(String),

    /// The job or target is invalid and was rejected before execution.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Configuration error (missing or invalid env vars, etc.).
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// The job pool queue is saturated.
    #[error("Job queue is full ({0} jobs waiting)")]
    QueueFull(usize),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::AntiBotDetected(_)
            | AppError::StrategyTransient(_)
            | AppError::RateLimitExceeded { .. } => true,
            AppError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Returns true if this error should count as a failure for the
    /// domain's circuit breaker.
    ///
    /// Client errors and extraction problems mean the domain answered, so
    /// they do not count against it.
    pub fn trips_circuit(&self) -> bool {
        match self {
            AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::AntiBotDetected(_)
            | AppError::StrategyTransient(_) => true,
            AppError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// The strategy cannot get past this target (anti-bot wall); another
    /// strategy in the chain might.
    pub fn is_strategy_incapable(&self) -> bool {
        matches!(self, AppError::AntiBotDetected(_))
    }

    /// Stable machine-readable name of the error kind, used in persisted
    /// failure descriptors.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::HttpStatus { .. } => "http_status",
            AppError::NetworkError(_) => "network",
            AppError::Timeout(_) => "timeout",
            AppError::AntiBotDetected(_) => "anti_bot",
            AppError::StrategyTransient(_) => "strategy_transient",
            AppError::RateLimitExceeded { .. } => "rate_limited",
            AppError::CircuitOpen { .. } => "circuit_open",
            AppError::ExtractionError(_) => "extraction",
            AppError::ValidationError(_) => "validation",
            AppError::ConfigError(_) => "config",
            AppError::DatabaseError(_) => "database",
            AppError::SerializationError(_) => "serialization",
            AppError::QueueFull(_) => "queue_full",
            AppError::Generic(_) => "generic",
        }
    }
}
