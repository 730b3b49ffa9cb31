//! Per-domain token bucket.
//!
//! Each domain gets one bucket whose capacity is the burst size and whose
//! refill rate is the configured requests per second. Refill happens lazily
//! on every acquisition attempt; there is no background timer. Acquisitions
//! can additionally demand a minimum spacing since the previous issuance to
//! the same domain.
//!
//! Jobs running against a domain hold a lease on its bucket; the bucket
//! runs at the strictest leased limit and relaxes once that job releases.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::error::AppError;
use crate::job::RateLimit;

/// Lowest refill rate we accept, so waits stay finite.
const MIN_RATE: f64 = 1e-6;

#[derive(Debug, Clone, Copy)]
struct Limits {
    rate: f64,
    capacity: f64,
}

impl From<&RateLimit> for Limits {
    fn from(limit: &RateLimit) -> Self {
        Self {
            rate: limit.per_second().max(MIN_RATE),
            capacity: limit.capacity(),
        }
    }
}

#[derive(Debug)]
struct Bucket {
    capacity: f64,
    rate: f64,
    tokens: f64,
    last_refill: Instant,
    last_issued: Option<Instant>,
    leases: HashMap<Uuid, Limits>,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Run at the strictest leased limits. Without leases the current
    /// limits stay until the next lease.
    fn apply_leases(&mut self) {
        let Some(strictest) = self.leases.values().copied().reduce(|a, b| Limits {
            rate: a.rate.min(b.rate),
            capacity: a.capacity.min(b.capacity),
        }) else {
            return;
        };
        self.refill(Instant::now());
        self.rate = strictest.rate;
        self.capacity = strictest.capacity;
        self.tokens = self.tokens.min(self.capacity);
    }
}

/// Token bucket gating request issuance to one domain.
///
/// The mutex is only held for the arithmetic, never across an await.
#[derive(Debug)]
pub struct RateLimiter {
    domain: String,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a full bucket for `domain`.
    pub fn new(domain: impl Into<String>, limit: &RateLimit) -> Self {
        let limits = Limits::from(limit);
        Self {
            domain: domain.into(),
            bucket: Mutex::new(Bucket {
                capacity: limits.capacity,
                rate: limits.rate,
                tokens: limits.capacity,
                last_refill: Instant::now(),
                last_issued: None,
                leases: HashMap::new(),
            }),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    fn lock(&self) -> MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(domain = %self.domain, "Recovered from poisoned rate limiter mutex");
            poisoned.into_inner()
        })
    }

    /// Register `job_id`'s limit for this domain. While several jobs hold
    /// leases the strictest one applies.
    pub fn lease(&self, job_id: Uuid, limit: &RateLimit) {
        let mut bucket = self.lock();
        let old_rate = bucket.rate;
        bucket.leases.insert(job_id, Limits::from(limit));
        bucket.apply_leases();
        if bucket.rate != old_rate {
            tracing::debug!(domain = %self.domain, old_rate, new_rate = bucket.rate, "Domain rate limit changed");
        }
    }

    /// Drop `job_id`'s lease, relaxing to the strictest remaining one.
    pub fn release(&self, job_id: Uuid) {
        let mut bucket = self.lock();
        if bucket.leases.remove(&job_id).is_some() {
            bucket.apply_leases();
        }
    }

    /// Current refill rate in tokens per second.
    pub fn rate(&self) -> f64 {
        self.lock().rate
    }

    /// Tokens available right now.
    pub fn available(&self) -> f64 {
        let mut bucket = self.lock();
        bucket.refill(Instant::now());
        bucket.tokens
    }

    /// Take a token if one is available and the spacing is satisfied,
    /// otherwise report how long to wait before trying again.
    fn try_acquire(&self, min_spacing: Duration) -> Result<(), Duration> {
        let now = Instant::now();
        let mut bucket = self.lock();
        bucket.refill(now);

        let spacing_wait = bucket
            .last_issued
            .map(|t| min_spacing.saturating_sub(now.saturating_duration_since(t)))
            .unwrap_or(Duration::ZERO);

        if bucket.tokens >= 1.0 && spacing_wait.is_zero() {
            bucket.tokens -= 1.0;
            bucket.last_issued = Some(now);
            return Ok(());
        }

        let token_wait = if bucket.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64((1.0 - bucket.tokens) / bucket.rate)
                .unwrap_or(Duration::MAX)
        };
        Err(token_wait.max(spacing_wait))
    }

    /// Wait for a token, giving up once `timeout` would be exceeded.
    ///
    /// Returns [`AppError::RateLimitExceeded`] when the next token cannot
    /// arrive within the remaining time. Cancel-safe: a token is only taken
    /// in the same step that resolves the future.
    pub async fn acquire(&self, timeout: Duration, min_spacing: Duration) -> Result<(), AppError> {
        let started = Instant::now();
        loop {
            let wait = match self.try_acquire(min_spacing) {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };

            let elapsed = started.elapsed();
            if wait > timeout.saturating_sub(elapsed) {
                return Err(AppError::RateLimitExceeded {
                    domain: self.domain.clone(),
                    waited_ms: elapsed.as_millis() as u64,
                });
            }

            tracing::debug!(
                domain = %self.domain,
                wait_ms = wait.as_millis() as u64,
                "Waiting for rate limit token"
            );
            tokio::time::sleep(wait).await;
        }
    }
}
