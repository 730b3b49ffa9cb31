//! Scraping strategies and the per-target fallback chain.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;

use crate::error::AppError;
use crate::executor::TargetRun;
use crate::job::{ScrapingConfig, Target};
use crate::models::{Payload, StrategyAttempts};
use crate::retry::{AttemptOutcome, RetryDecision, RetryPolicy};

/// What a strategy can do and what it costs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub handles_javascript: bool,
    /// Higher gets past more anti-bot defenses.
    pub stealth_level: u8,
    /// Relative resource cost of one invocation.
    pub cost: u8,
}

/// A pluggable scraping mechanism.
///
/// Given a target and its effective config, returns the extracted payload
/// or a classified error. Implementations must not retry internally.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    fn try_scrape<'a>(
        &'a self,
        target: &'a Target,
        config: &'a ScrapingConfig,
    ) -> BoxFuture<'a, Result<Payload, AppError>>;
}

/// How a chain run ended.
#[derive(Debug)]
pub enum ChainResult {
    Resolved(Result<Payload, AppError>),
    /// Cancellation was observed before the target resolved.
    Cancelled,
}

#[derive(Debug)]
pub struct ChainReport {
    pub result: ChainResult,
    pub strategy_used: Option<String>,
    pub attempts: Vec<StrategyAttempts>,
}

/// Ordered strategies to try for one target.
#[derive(Clone)]
pub struct StrategyChain {
    strategies: Vec<Arc<dyn Strategy>>,
    pinned: bool,
}

impl fmt::Debug for StrategyChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyChain")
            .field("strategies", &self.names())
            .field("pinned", &self.pinned)
            .finish()
    }
}

impl StrategyChain {
    /// A chain that tries `strategies` in the given order.
    pub fn new(strategies: Vec<Arc<dyn Strategy>>) -> Self {
        Self {
            strategies,
            pinned: false,
        }
    }

    /// Order `available` for `target`.
    ///
    /// A target that names a strategy gets exactly that one. Otherwise the
    /// strategies matching the JavaScript requirement come first (cheapest
    /// first without JS, stealthiest first with JS) and the rest follow as
    /// fallbacks in the same order.
    pub fn resolve(
        available: &[Arc<dyn Strategy>],
        target: &Target,
        config: &ScrapingConfig,
    ) -> Result<Self, AppError> {
        if let Some(name) = &target.strategy {
            let strategy = available
                .iter()
                .find(|s| s.name() == name)
                .ok_or_else(|| AppError::ValidationError(format!("Unknown strategy '{name}'")))?;
            return Ok(Self {
                strategies: vec![strategy.clone()],
                pinned: true,
            });
        }

        if available.is_empty() {
            return Err(AppError::ValidationError(
                "No scraping strategies registered".into(),
            ));
        }

        let js = config.javascript_enabled;
        let (mut matching, mut fallback): (Vec<_>, Vec<_>) = available
            .iter()
            .cloned()
            .partition(|s| s.capabilities().handles_javascript == js);

        let order = |a: &Arc<dyn Strategy>, b: &Arc<dyn Strategy>| {
            let (ca, cb) = (a.capabilities(), b.capabilities());
            if js {
                cb.stealth_level
                    .cmp(&ca.stealth_level)
                    .then(ca.cost.cmp(&cb.cost))
            } else {
                ca.cost
                    .cmp(&cb.cost)
                    .then(cb.stealth_level.cmp(&ca.stealth_level))
            }
        };
        matching.sort_by(order);
        fallback.sort_by(order);
        matching.extend(fallback);

        Ok(Self {
            strategies: matching,
            pinned: false,
        })
    }

    pub fn names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Run the chain for one target.
    ///
    /// Each strategy gets its own retry run. An anti-bot wall skips straight
    /// to the next strategy, except on the last one where it is retried in
    /// place. Fatal errors, including an open circuit, end the chain.
    pub async fn execute(&self, run: &TargetRun<'_>) -> ChainReport {
        let mut strategy_used = None;
        let mut attempts = Vec::new();
        let mut last_error = None;

        for (position, strategy) in self.strategies.iter().enumerate() {
            let is_last = position + 1 == self.strategies.len();
            let policy = RetryPolicy::new(run.config().max_retries, run.retry_config().clone());
            let mut invocations = 0u32;
            let mut attempt = 0u32;

            let resolved = loop {
                if run.is_cancelled() {
                    break Some(ChainResult::Cancelled);
                }
                attempt += 1;

                let Some(outcome) = run.attempt(strategy.as_ref()).await else {
                    break Some(ChainResult::Cancelled);
                };
                if outcome.invoked {
                    invocations += 1;
                    strategy_used = Some(strategy.name().to_string());
                }

                let outcome = AttemptOutcome::from(outcome.result);
                let decision = policy.decide(attempt, &outcome);
                match outcome {
                    AttemptOutcome::Success(payload) => break Some(ChainResult::Resolved(Ok(payload))),
                    AttemptOutcome::Fatal(err) => {
                        tracing::debug!(
                            strategy = strategy.name(),
                            attempt,
                            error = %err,
                            "Fatal failure, stopping strategy chain"
                        );
                        break Some(ChainResult::Resolved(Err(err)));
                    }
                    AttemptOutcome::Retryable(err) => {
                        let advance = err.is_strategy_incapable() && !is_last;
                        tracing::debug!(
                            strategy = strategy.name(),
                            attempt,
                            error = %err,
                            advance,
                            "Attempt failed"
                        );
                        last_error = Some(err);
                        if advance {
                            break None;
                        }
                        match decision {
                            RetryDecision::Retry(delay) => {
                                if !run.backoff(delay).await {
                                    break Some(ChainResult::Cancelled);
                                }
                            }
                            RetryDecision::Stop => break None,
                        }
                    }
                }
            };

            if invocations > 0 {
                attempts.push(StrategyAttempts {
                    strategy: strategy.name().to_string(),
                    attempts: invocations,
                });
            }

            if let Some(result) = resolved {
                return ChainReport {
                    result,
                    strategy_used,
                    attempts,
                };
            }
        }

        let err = last_error
            .unwrap_or_else(|| AppError::ValidationError("Strategy chain is empty".into()));
        ChainReport {
            result: ChainResult::Resolved(Err(err)),
            strategy_used,
            attempts,
        }
    }
}
