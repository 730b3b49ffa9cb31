pub mod circuit_breaker;
pub mod config;
pub mod definition;
pub mod domain;
pub mod engine;
pub mod error;
pub mod executor;
pub mod job;
pub mod models;
pub mod pool;
pub mod rate_limiter;
pub mod retry;
pub mod strategy;
pub mod traits;

#[cfg(test)]
pub mod testutil;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use config::EngineConfig;
pub use definition::JobDefinition;
pub use domain::{DomainRegistry, DomainState, RateLease, domain_of};
pub use engine::{EngineEvent, EngineReporter, JobCanceller, JobEngine, TracingEngineReporter};
pub use error::AppError;
pub use job::{
    DataType, ExtractionSpec, Job, JobStatus, RateLimit, ScrapingConfig, Target, TargetOverrides,
};
pub use models::{
    FailureCause, JobOutcome, JobRecord, Payload, StrategyAttempts, TargetOutcome, TargetResult,
    compute_hash,
};
pub use pool::{JobPool, PoolConfig};
pub use rate_limiter::RateLimiter;
pub use retry::RetryConfig;
pub use strategy::{Capabilities, Strategy, StrategyChain};
pub use traits::{MemorySink, ResultSink};
