//! Process-wide per-domain state.
//!
//! Every job that touches a host shares that host's rate limiter and
//! circuit breaker. Entries are created lazily on first access and live for
//! as long as the registry does; the engine owns the registry and hands it
//! out by `Arc`.

use std::sync::Arc;

use dashmap::DashMap;
use url::Url;
use uuid::Uuid;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};
use crate::job::RateLimit;
use crate::rate_limiter::RateLimiter;

/// Host component of a URL, lowercased.
pub fn domain_of(url: &str) -> Option<String> {
    let url = Url::parse(url).ok()?;
    url.host_str().map(|h| h.to_ascii_lowercase())
}

/// Rate limiter and circuit breaker for one host.
#[derive(Debug)]
pub struct DomainState {
    pub limiter: RateLimiter,
    pub breaker: CircuitBreaker,
}

impl DomainState {
    fn new(domain: &str, rate: &RateLimit, breaker: CircuitBreakerConfig) -> Self {
        Self {
            limiter: RateLimiter::new(domain, rate),
            breaker: CircuitBreaker::new(domain, breaker),
        }
    }
}

/// A job's hold on the rate limits of the domains it targets.
#[derive(Debug)]
#[must_use = "the lease is released when dropped"]
pub struct RateLease {
    job_id: Uuid,
    states: Vec<Arc<DomainState>>,
}

impl Drop for RateLease {
    fn drop(&mut self) {
        for state in &self.states {
            state.limiter.release(self.job_id);
        }
    }
}

/// Shared registry of [`DomainState`], keyed by host.
#[derive(Debug, Default)]
pub struct DomainRegistry {
    domains: DashMap<String, Arc<DomainState>>,
    breaker_config: CircuitBreakerConfig,
}

impl DomainRegistry {
    pub fn new(breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            domains: DashMap::new(),
            breaker_config,
        }
    }

    /// Get the state for `domain`, creating it on first access with `rate`.
    pub fn get_or_create(&self, domain: &str, rate: &RateLimit) -> Arc<DomainState> {
        let key = domain.to_ascii_lowercase();
        self.domains
            .entry(key.clone())
            .or_insert_with(|| {
                tracing::debug!(domain = %key, "Registering domain state");
                Arc::new(DomainState::new(&key, rate, self.breaker_config.clone()))
            })
            .value()
            .clone()
    }

    /// Lease `rate` on every domain in `domains` for the duration of job
    /// `job_id`. The leases are released when the returned guard drops.
    pub fn lease<'d>(
        &self,
        job_id: Uuid,
        domains: impl IntoIterator<Item = &'d str>,
        rate: &RateLimit,
    ) -> RateLease {
        let mut states: Vec<Arc<DomainState>> = Vec::new();
        for domain in domains {
            let state = self.get_or_create(domain, rate);
            if states.iter().any(|s| Arc::ptr_eq(s, &state)) {
                continue;
            }
            state.limiter.lease(job_id, rate);
            states.push(state);
        }
        RateLease { job_id, states }
    }

    pub fn get(&self, domain: &str) -> Option<Arc<DomainState>> {
        self.domains
            .get(&domain.to_ascii_lowercase())
            .map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Breaker stats for every known domain, sorted by domain name.
    pub fn snapshot(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<_> = self
            .domains
            .iter()
            .map(|e| e.value().breaker.stats())
            .collect();
        stats.sort_by(|a, b| a.domain.cmp(&b.domain));
        stats
    }
}
