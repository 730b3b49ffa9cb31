//! Per-domain circuit breaker.
//!
//! Fails fast when a domain keeps failing, then probes it with a single
//! trial request once the cooldown has elapsed.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED --[N consecutive failures]--> OPEN --[cooldown]--> HALF_OPEN (one trial)
//!                                        ^                        |
//!                                        +---[trial fails, x2]----+
//!                                                                 |
//! CLOSED <--------------------[trial succeeds]--------------------+
//! ```

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::AppError;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are rejected immediately.
    Open,
    /// One trial request is allowed to test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u32,

    /// Base time to wait before transitioning from Open to HalfOpen.
    pub cooldown: Duration,

    /// Cap for the cooldown after repeated failed trials.
    pub max_cooldown: Duration,

    /// Cooldown multiplier applied when a trial fails.
    pub backoff_multiplier: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(300),
            backoff_multiplier: 2.0,
        }
    }
}

#[derive(Debug)]
struct CircuitBreakerInner {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    last_error: Option<String>,
    current_cooldown: Duration,
    trial_in_flight: bool,
}

impl CircuitBreakerInner {
    fn remaining_cooldown(&self) -> Duration {
        self.opened_at
            .map(|t| self.current_cooldown.saturating_sub(t.elapsed()))
            .unwrap_or(self.current_cooldown)
    }
}

/// Snapshot of breaker state for reporting.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CircuitBreakerStats {
    pub domain: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_error: Option<String>,
    pub current_cooldown: Duration,
    pub time_until_half_open: Option<Duration>,
}

/// Admission granted by [`CircuitBreaker::before_call`].
///
/// Hand it back to [`CircuitBreaker::record_result`] once the call
/// completes. A half-open trial permit dropped without being reported
/// (the call panicked or its future was dropped) counts as a failed trial,
/// so the domain goes back to Open instead of waiting on a trial that will
/// never report.
#[derive(Debug)]
#[must_use = "the permit must be passed to record_result"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
}

impl CallPermit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Mark the permit as reported; returns whether it was the trial.
    fn settle(&mut self) -> bool {
        std::mem::replace(&mut self.trial, false)
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settle() {
            return;
        }
        let breaker = self.breaker;
        let mut inner = breaker.lock_inner();
        if inner.state == CircuitState::HalfOpen && inner.trial_in_flight {
            inner.last_error = Some("trial call abandoned before reporting".into());
            breaker.reopen_after_trial(&mut inner);
            tracing::warn!(
                domain = %breaker.domain,
                cooldown_secs = inner.current_cooldown.as_secs(),
                "Circuit breaker trial abandoned, returning to open state"
            );
        }
    }
}

/// Thread-safe circuit breaker for one domain.
#[derive(Debug)]
pub struct CircuitBreaker {
    domain: String,
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitBreakerInner>,
}

impl CircuitBreaker {
    pub fn new(domain: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let inner = CircuitBreakerInner {
            state: CircuitState::Closed,
            failure_count: 0,
            opened_at: None,
            last_error: None,
            current_cooldown: config.cooldown,
            trial_in_flight: false,
        };
        Self {
            domain: domain.into(),
            config,
            inner: Mutex::new(inner),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> MutexGuard<'_, CircuitBreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(domain = %self.domain, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Returns the current state, handling lazy Open → HalfOpen transitions.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);
        inner.state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);

        let time_until_half_open =
            (inner.state == CircuitState::Open).then(|| inner.remaining_cooldown());

        CircuitBreakerStats {
            domain: self.domain.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            last_error: inner.last_error.clone(),
            current_cooldown: inner.current_cooldown,
            time_until_half_open,
        }
    }

    /// Ask permission to call the domain.
    ///
    /// - Closed: permitted
    /// - Open: `CircuitOpen` until the cooldown has elapsed
    /// - HalfOpen: the first caller gets the trial, everyone else gets
    ///   `CircuitOpen` until it resolves
    pub fn before_call(&self) -> Result<CallPermit<'_>, AppError> {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);

        match inner.state {
            CircuitState::Closed => Ok(CallPermit {
                breaker: self,
                trial: false,
            }),
            CircuitState::Open => Err(AppError::CircuitOpen {
                domain: self.domain.clone(),
                retry_after: inner.remaining_cooldown(),
            }),
            CircuitState::HalfOpen if inner.trial_in_flight => Err(AppError::CircuitOpen {
                domain: self.domain.clone(),
                retry_after: Duration::ZERO,
            }),
            CircuitState::HalfOpen => {
                inner.trial_in_flight = true;
                tracing::debug!(domain = %self.domain, "Circuit breaker admitting trial request");
                Ok(CallPermit {
                    breaker: self,
                    trial: true,
                })
            }
        }
    }

    /// Record the result of a permitted call.
    ///
    /// Errors that do not implicate the domain (client errors, extraction
    /// problems) count as successes.
    pub fn record_result<T>(&self, permit: CallPermit<'_>, result: &Result<T, AppError>) {
        match result {
            Err(err) if err.trips_circuit() => self.record_failure(permit, &err.to_string()),
            _ => self.record_success(permit),
        }
    }

    pub fn record_success(&self, mut permit: CallPermit<'_>) {
        let trial = permit.settle();
        let mut inner = self.lock_inner();

        match inner.state {
            CircuitState::HalfOpen if trial => {
                tracing::info!(domain = %self.domain, "Circuit breaker closing after successful trial");
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.opened_at = None;
                inner.last_error = None;
                inner.current_cooldown = self.config.cooldown;
                inner.trial_in_flight = false;
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            // Calls admitted before the circuit opened resolve late; they
            // do not decide the trial.
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, mut permit: CallPermit<'_>, error: &str) {
        let trial = permit.settle();
        let mut inner = self.lock_inner();
        inner.last_error = Some(error.to_string());

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        domain = %self.domain,
                        failures = inner.failure_count,
                        error = %error,
                        cooldown_secs = inner.current_cooldown.as_secs(),
                        "Circuit breaker opening after {} consecutive failures",
                        inner.failure_count
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen if trial => {
                self.reopen_after_trial(&mut inner);
                tracing::warn!(
                    domain = %self.domain,
                    error = %error,
                    cooldown_secs = inner.current_cooldown.as_secs(),
                    "Circuit breaker trial failed, returning to open state"
                );
            }
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    /// HalfOpen -> Open with the cooldown multiplied, up to the cap.
    fn reopen_after_trial(&self, inner: &mut CircuitBreakerInner) {
        let next = Duration::try_from_secs_f64(
            inner.current_cooldown.as_secs_f64() * self.config.backoff_multiplier,
        )
        .unwrap_or(self.config.max_cooldown);
        inner.current_cooldown = next.min(self.config.max_cooldown);
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.trial_in_flight = false;
    }

    fn maybe_transition_to_half_open(&self, inner: &mut CircuitBreakerInner) {
        if inner.state == CircuitState::Open
            && let Some(opened_at) = inner.opened_at
            && opened_at.elapsed() >= inner.current_cooldown
        {
            tracing::info!(
                domain = %self.domain,
                "Circuit breaker transitioning to half-open state"
            );
            inner.state = CircuitState::HalfOpen;
            inner.trial_in_flight = false;
        }
    }
}
