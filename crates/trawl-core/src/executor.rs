//! Runs one target through rate limiting, circuit breaking, the strategy
//! chain and retries.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::{DomainRegistry, DomainState};
use crate::error::AppError;
use crate::job::{ScrapingConfig, Target};
use crate::models::{FailureCause, Payload, TargetOutcome, TargetResult};
use crate::retry::RetryConfig;
use crate::strategy::{ChainResult, Strategy, StrategyChain};

/// Result of one charged attempt.
#[derive(Debug)]
pub struct Attempt {
    pub result: Result<Payload, AppError>,
    /// Whether the strategy was actually invoked (false when the rate
    /// limiter or the breaker refused the call).
    pub invoked: bool,
}

/// What happened to a dispatched target.
#[derive(Debug)]
pub enum TargetExecution {
    Resolved(TargetResult),
    Cancelled,
}

/// Executes targets of one job.
#[derive(Debug, Clone)]
pub struct TargetExecutor {
    registry: Arc<DomainRegistry>,
    retry: RetryConfig,
    acquire_timeout: Duration,
    cancel: CancellationToken,
}

impl TargetExecutor {
    pub fn new(
        registry: Arc<DomainRegistry>,
        retry: RetryConfig,
        acquire_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            retry,
            acquire_timeout,
            cancel,
        }
    }

    /// Resolve target `index` of job `job_id`.
    ///
    /// `chain` is the strategy chain resolved at job start, or the error
    /// that prevented resolving one.
    pub async fn execute(
        &self,
        job_id: Uuid,
        index: usize,
        target: &Target,
        job_config: &ScrapingConfig,
        chain: Result<StrategyChain, AppError>,
    ) -> TargetExecution {
        let started = Instant::now();
        let failed = |err: AppError| {
            TargetExecution::Resolved(TargetResult::new(
                job_id,
                index,
                target,
                TargetOutcome::Failed {
                    error: FailureCause::from(&err),
                },
                None,
                Vec::new(),
                started.elapsed().as_millis() as u64,
            ))
        };

        let chain = match chain {
            Ok(chain) => chain,
            Err(err) => return failed(err),
        };
        let Some(domain) = target.domain() else {
            return failed(AppError::ValidationError(format!(
                "Target URL has no host: {}",
                target.url
            )));
        };

        let config = job_config.effective_for(target);
        let state = self.registry.get_or_create(&domain, &config.rate_limit);
        let run = TargetRun {
            executor: self,
            domain: state,
            target,
            config: &config,
        };

        let report = chain.execute(&run).await;
        let outcome = match report.result {
            ChainResult::Cancelled => {
                tracing::debug!(%job_id, index, url = %target.url, "Target abandoned on cancellation");
                return TargetExecution::Cancelled;
            }
            ChainResult::Resolved(Ok(payload)) => TargetOutcome::Success { payload },
            ChainResult::Resolved(Err(err)) => TargetOutcome::Failed {
                error: FailureCause::from(&err),
            },
        };

        TargetExecution::Resolved(TargetResult::new(
            job_id,
            index,
            target,
            outcome,
            report.strategy_used,
            report.attempts,
            started.elapsed().as_millis() as u64,
        ))
    }
}

/// Per-target execution context handed to [`StrategyChain::execute`].
pub struct TargetRun<'a> {
    executor: &'a TargetExecutor,
    domain: Arc<DomainState>,
    target: &'a Target,
    config: &'a ScrapingConfig,
}

impl TargetRun<'_> {
    pub fn config(&self) -> &ScrapingConfig {
        self.config
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.executor.retry
    }

    pub fn is_cancelled(&self) -> bool {
        self.executor.cancel.is_cancelled()
    }

    /// One charged attempt: rate limiter, then breaker admission, then the
    /// strategy under the per-attempt timeout. Every admitted call reports
    /// its result to the breaker.
    ///
    /// Returns `None` when the job is cancelled before the strategy could be
    /// invoked, including while waiting for a rate-limit token.
    pub async fn attempt(&self, strategy: &dyn Strategy) -> Option<Attempt> {
        let domain = self.domain.limiter.domain();

        let acquired = tokio::select! {
            biased;
            () = self.executor.cancel.cancelled() => {
                tracing::debug!(domain, url = %self.target.url, "Cancelled while waiting for rate limit token");
                return None;
            }
            acquired = self
                .domain
                .limiter
                .acquire(self.executor.acquire_timeout, self.config.delay_between_requests) => acquired,
        };
        if let Err(err) = acquired {
            return Some(Attempt {
                result: Err(err),
                invoked: false,
            });
        }
        if self.is_cancelled() {
            return None;
        }

        let permit = match self.domain.breaker.before_call() {
            Ok(permit) => permit,
            Err(err) => {
                tracing::debug!(domain, strategy = strategy.name(), "Circuit open, attempt refused");
                return Some(Attempt {
                    result: Err(err),
                    invoked: false,
                });
            }
        };

        let started = Instant::now();
        let result = match tokio::time::timeout(
            self.config.timeout,
            strategy.try_scrape(self.target, self.config),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout(self.config.timeout.as_millis() as u64)),
        };
        self.domain.breaker.record_result(permit, &result);

        tracing::debug!(
            domain,
            strategy = strategy.name(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "Strategy attempt finished"
        );

        Some(Attempt {
            result,
            invoked: true,
        })
    }

    /// Sleep before a retry. Returns false if cancelled while waiting.
    pub async fn backoff(&self, delay: Duration) -> bool {
        tracing::debug!(url = %self.target.url, delay_ms = delay.as_millis() as u64, "Backing off before retry");
        tokio::select! {
            () = tokio::time::sleep(delay) => true,
            () = self.executor.cancel.cancelled() => false,
        }
    }
}
