//! Retry classification and backoff.
//!
//! Attempts produce explicit [`AttemptOutcome`] values; the caller's loop
//! asks [`RetryPolicy::decide`] what to do next.

use std::time::Duration;

use crate::error::AppError;
use crate::models::Payload;

/// Backoff parameters shared by every retry loop of an engine.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// Delay before retry `n` (1-indexed):
    /// `base * 2^(n-1)` plus jitter in `[0, base)`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(31);
        let backoff = self.base_delay.saturating_mul(1u32 << exp);
        let base_ms = self.base_delay.as_millis() as u64;
        let jitter = if base_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::random_range(0..base_ms))
        };
        backoff.saturating_add(jitter).min(self.max_delay)
    }
}

/// How a failure should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Fatal,
}

pub fn classify(err: &AppError) -> ErrorClass {
    if err.is_retryable() {
        ErrorClass::Retryable
    } else {
        ErrorClass::Fatal
    }
}

/// Result of a single strategy attempt.
#[derive(Debug)]
pub enum AttemptOutcome {
    Success(Payload),
    Retryable(AppError),
    Fatal(AppError),
}

impl From<Result<Payload, AppError>> for AttemptOutcome {
    fn from(result: Result<Payload, AppError>) -> Self {
        match result {
            Ok(payload) => AttemptOutcome::Success(payload),
            Err(err) => match classify(&err) {
                ErrorClass::Retryable => AttemptOutcome::Retryable(err),
                ErrorClass::Fatal => AttemptOutcome::Fatal(err),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    Stop,
}

/// Bounded retry policy for one strategy run.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, config: RetryConfig) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            config,
        }
    }

    /// Decide what follows attempt number `attempt` (1-indexed).
    pub fn decide(&self, attempt: u32, outcome: &AttemptOutcome) -> RetryDecision {
        match outcome {
            AttemptOutcome::Retryable(_) if attempt < self.max_attempts => {
                RetryDecision::Retry(self.config.delay_for_attempt(attempt))
            }
            _ => RetryDecision::Stop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base_ms: u64, max_ms: u64) -> RetryConfig {
        RetryConfig {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
        }
    }

    #[test]
    fn test_delay_schedule_is_exponential_with_bounded_jitter() {
        let config = config(100, 10_000);
        for _ in 0..50 {
            let d1 = config.delay_for_attempt(1);
            assert!(d1 >= Duration::from_millis(100) && d1 < Duration::from_millis(200));
            let d3 = config.delay_for_attempt(3);
            assert!(d3 >= Duration::from_millis(400) && d3 < Duration::from_millis(500));
        }
    }

    #[test]
    fn test_delay_capped_at_max() {
        let config = config(1000, 10_000);
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(10));
        assert_eq!(config.delay_for_attempt(200), Duration::from_secs(10));
    }

    #[test]
    fn test_zero_base_delay_has_no_jitter() {
        assert_eq!(config(0, 100).delay_for_attempt(3), Duration::ZERO);
    }

    #[test]
    fn test_classification() {
        assert_eq!(
            classify(&AppError::Timeout(30_000)),
            ErrorClass::Retryable
        );
        assert_eq!(
            classify(&AppError::HttpStatus {
                status: 404,
                url: "https://example.com".into()
            }),
            ErrorClass::Fatal
        );
        assert_eq!(
            classify(&AppError::ExtractionError("bad selector".into())),
            ErrorClass::Fatal
        );
        assert!(matches!(
            AttemptOutcome::from(Err(AppError::AntiBotDetected("captcha".into()))),
            AttemptOutcome::Retryable(_)
        ));
        assert!(matches!(
            AttemptOutcome::from(Ok(Payload::new())),
            AttemptOutcome::Success(_)
        ));
    }

    #[test]
    fn test_never_exceeds_max_attempts() {
        let policy = RetryPolicy::new(3, config(0, 0));
        let retryable = AttemptOutcome::Retryable(AppError::NetworkError("reset".into()));

        let mut attempts = 1;
        while let RetryDecision::Retry(_) = policy.decide(attempts, &retryable) {
            attempts += 1;
        }
        assert_eq!(attempts, 3);
    }

    #[test]
    fn test_fatal_stops_immediately() {
        let policy = RetryPolicy::new(5, config(0, 0));
        let fatal = AttemptOutcome::Fatal(AppError::ValidationError("unknown strategy".into()));
        assert_eq!(policy.decide(1, &fatal), RetryDecision::Stop);
        assert_eq!(
            policy.decide(1, &AttemptOutcome::Success(Payload::new())),
            RetryDecision::Stop
        );
    }

    #[test]
    fn test_zero_max_attempts_still_allows_one() {
        assert_eq!(RetryPolicy::new(0, RetryConfig::default()).max_attempts, 1);
    }
}
