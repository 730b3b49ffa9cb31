use std::str::FromStr;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::AppError;
use crate::retry::RetryConfig;

/// Process-level engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Global number of targets in flight, shared by all jobs.
    pub max_concurrency: usize,
    pub breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    /// Upper bound on waiting for a rate-limit token in one attempt.
    pub acquire_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            acquire_timeout: Duration::from_secs(60),
        }
    }
}

impl EngineConfig {
    /// Read configuration from environment variables. Unset variables keep
    /// their defaults.
    ///
    /// - `TRAWL_MAX_CONCURRENCY`
    /// - `TRAWL_FAILURE_THRESHOLD`
    /// - `TRAWL_BREAKER_COOLDOWN_SECS`
    /// - `TRAWL_BREAKER_MAX_COOLDOWN_SECS`
    /// - `TRAWL_RETRY_BASE_DELAY_MS`
    /// - `TRAWL_RETRY_MAX_DELAY_MS`
    /// - `TRAWL_ACQUIRE_TIMEOUT_SECS`
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let defaults = Self::default();

        let max_concurrency: usize =
            parse_var(&lookup, "TRAWL_MAX_CONCURRENCY", defaults.max_concurrency)?;
        if max_concurrency == 0 {
            return Err(AppError::ConfigError(
                "TRAWL_MAX_CONCURRENCY must be at least 1".into(),
            ));
        }

        let failure_threshold: u32 = parse_var(
            &lookup,
            "TRAWL_FAILURE_THRESHOLD",
            defaults.breaker.failure_threshold,
        )?;
        if failure_threshold == 0 {
            return Err(AppError::ConfigError(
                "TRAWL_FAILURE_THRESHOLD must be at least 1".into(),
            ));
        }

        let cooldown = Duration::from_secs(parse_var(
            &lookup,
            "TRAWL_BREAKER_COOLDOWN_SECS",
            defaults.breaker.cooldown.as_secs(),
        )?);
        let max_cooldown = Duration::from_secs(parse_var(
            &lookup,
            "TRAWL_BREAKER_MAX_COOLDOWN_SECS",
            defaults.breaker.max_cooldown.as_secs(),
        )?);
        if max_cooldown < cooldown {
            return Err(AppError::ConfigError(format!(
                "TRAWL_BREAKER_MAX_COOLDOWN_SECS ({}) is below TRAWL_BREAKER_COOLDOWN_SECS ({})",
                max_cooldown.as_secs(),
                cooldown.as_secs()
            )));
        }

        let base_delay = Duration::from_millis(parse_var(
            &lookup,
            "TRAWL_RETRY_BASE_DELAY_MS",
            defaults.retry.base_delay.as_millis() as u64,
        )?);
        let max_delay = Duration::from_millis(parse_var(
            &lookup,
            "TRAWL_RETRY_MAX_DELAY_MS",
            defaults.retry.max_delay.as_millis() as u64,
        )?);

        let acquire_timeout = Duration::from_secs(parse_var(
            &lookup,
            "TRAWL_ACQUIRE_TIMEOUT_SECS",
            defaults.acquire_timeout.as_secs(),
        )?);

        Ok(Self {
            max_concurrency,
            breaker: CircuitBreakerConfig {
                failure_threshold,
                cooldown,
                max_cooldown,
                ..defaults.breaker
            },
            retry: RetryConfig {
                base_delay,
                max_delay,
            },
            acquire_timeout,
        })
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.breaker.failure_threshold = threshold;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, AppError> {
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| {
            AppError::ConfigError(format!("Invalid {name} '{raw}': must be a non-negative integer"))
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn unset_variables_keep_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.cooldown, Duration::from_secs(30));
        assert_eq!(config.breaker.max_cooldown, Duration::from_secs(300));
        assert_eq!(config.retry.base_delay, Duration::from_secs(1));
        assert_eq!(config.retry.max_delay, Duration::from_secs(10));
    }

    #[test]
    fn variables_override_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("TRAWL_MAX_CONCURRENCY", "2"),
            ("TRAWL_FAILURE_THRESHOLD", "3"),
            ("TRAWL_RETRY_BASE_DELAY_MS", "250"),
        ]))
        .unwrap();
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));
    }

    #[test]
    fn malformed_values_are_config_errors() {
        let err = EngineConfig::from_lookup(lookup(&[("TRAWL_MAX_CONCURRENCY", "lots")]))
            .unwrap_err();
        assert!(matches!(err, AppError::ConfigError(ref msg) if msg.contains("TRAWL_MAX_CONCURRENCY")));

        assert!(EngineConfig::from_lookup(lookup(&[("TRAWL_FAILURE_THRESHOLD", "0")])).is_err());
        assert!(
            EngineConfig::from_lookup(lookup(&[
                ("TRAWL_BREAKER_COOLDOWN_SECS", "60"),
                ("TRAWL_BREAKER_MAX_COOLDOWN_SECS", "30"),
            ]))
            .is_err()
        );
    }
}
