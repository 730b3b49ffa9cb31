//! Job engine: fans a job's targets out to executors under the global
//! concurrency limit and drives the job state machine.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::domain::DomainRegistry;
use crate::error::AppError;
use crate::executor::{TargetExecution, TargetExecutor};
use crate::job::Job;
use crate::models::{FailureCause, JobOutcome, TargetOutcome, TargetResult};
use crate::strategy::{Strategy, StrategyChain};
use crate::traits::ResultSink;

/// Events emitted by the engine for monitoring/logging.
#[derive(Debug, Clone)]
pub enum EngineEvent<'a> {
    JobStarted {
        job_id: Uuid,
        name: &'a str,
        targets: usize,
    },
    TargetDispatched {
        job_id: Uuid,
        index: usize,
        url: &'a str,
        strategies: &'a [&'a str],
    },
    TargetResolved {
        job_id: Uuid,
        result: &'a TargetResult,
    },
    Interrupted {
        job_id: Uuid,
        reason: &'a str,
        pending: usize,
    },
    SinkFailed {
        job_id: Uuid,
        error: &'a AppError,
    },
    JobFinished {
        job_id: Uuid,
        outcome: &'a JobOutcome,
    },
}

/// Trait for receiving engine events (decoupled logging).
pub trait EngineReporter: Send + Sync {
    fn report(&self, event: EngineEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEngineReporter;

impl EngineReporter for TracingEngineReporter {
    fn report(&self, event: EngineEvent<'_>) {
        match event {
            EngineEvent::JobStarted {
                job_id,
                name,
                targets,
            } => {
                tracing::info!(%job_id, %name, targets, "Job started");
            }
            EngineEvent::TargetDispatched {
                job_id,
                index,
                url,
                strategies,
            } => {
                tracing::debug!(%job_id, index, %url, ?strategies, "Target dispatched");
            }
            EngineEvent::TargetResolved { job_id, result } => match result.error() {
                None => tracing::info!(
                    %job_id,
                    index = result.target_index,
                    url = %result.url,
                    strategy = result.strategy_used.as_deref().unwrap_or("-"),
                    attempts = result.attempts,
                    elapsed_ms = result.elapsed_ms,
                    "Target succeeded"
                ),
                Some(cause) => tracing::warn!(
                    %job_id,
                    index = result.target_index,
                    url = %result.url,
                    attempts = result.attempts,
                    kind = %cause.kind,
                    error = %cause.message,
                    "Target failed"
                ),
            },
            EngineEvent::Interrupted {
                job_id,
                reason,
                pending,
            } => {
                tracing::warn!(%job_id, %reason, pending, "Job interrupted");
            }
            EngineEvent::SinkFailed { job_id, error } => {
                tracing::error!(%job_id, %error, "Failed to persist target result");
            }
            EngineEvent::JobFinished { job_id, outcome } => {
                tracing::info!(
                    %job_id,
                    status = %outcome.status,
                    succeeded = outcome.succeeded,
                    failed = outcome.failed,
                    unresolved = outcome.unresolved,
                    "Job finished"
                );
            }
        }
    }
}

/// Handle for cancelling running jobs from outside the engine.
#[derive(Debug, Clone, Default)]
pub struct JobCanceller {
    running: Arc<DashMap<Uuid, CancellationToken>>,
}

impl JobCanceller {
    /// Request cooperative cancellation. Returns true if the job was running.
    pub fn cancel(&self, job_id: Uuid) -> bool {
        match self.running.get(&job_id) {
            Some(token) => {
                tracing::info!(%job_id, "Cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/// Removes the job from the running set when the run ends.
struct RunningGuard {
    running: Arc<DashMap<Uuid, CancellationToken>>,
    job_id: Uuid,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running.remove(&self.job_id);
    }
}

struct InFlight {
    index: usize,
    _permit: OwnedSemaphorePermit,
}

/// Executes jobs against a shared set of strategies and domain state.
pub struct JobEngine<S: ResultSink> {
    sink: S,
    strategies: Vec<Arc<dyn Strategy>>,
    registry: Arc<DomainRegistry>,
    permits: Arc<Semaphore>,
    canceller: JobCanceller,
    config: EngineConfig,
}

impl<S: ResultSink> JobEngine<S> {
    pub fn new(sink: S, strategies: Vec<Arc<dyn Strategy>>, config: EngineConfig) -> Self {
        let registry = Arc::new(DomainRegistry::new(config.breaker.clone()));
        Self {
            sink,
            strategies,
            registry,
            permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            canceller: JobCanceller::default(),
            config,
        }
    }

    /// Share domain state with another engine.
    pub fn with_registry(mut self, registry: Arc<DomainRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &Arc<DomainRegistry> {
        &self.registry
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn canceller(&self) -> JobCanceller {
        self.canceller.clone()
    }

    /// Request cooperative cancellation. Returns true if the job was running.
    pub fn cancel(&self, job_id: Uuid) -> bool {
        self.canceller.cancel(job_id)
    }

    pub fn is_running(&self, job_id: Uuid) -> bool {
        self.canceller.running.contains_key(&job_id)
    }

    /// Run `job` to completion, logging through `tracing`.
    pub async fn start(&self, job: Job) -> Result<JobOutcome, AppError> {
        self.start_with(job, &TracingEngineReporter).await
    }

    /// Run `job` to completion.
    ///
    /// Target failures never abort the job. The only error returned is a
    /// job that cannot start or a failed finalization.
    pub async fn start_with<R: EngineReporter>(
        &self,
        job: Job,
        reporter: &R,
    ) -> Result<JobOutcome, AppError> {
        self.run(job, reporter, CancellationToken::new()).await
    }

    /// Like [`start_with`](Self::start_with), but the job is also cancelled
    /// when `parent` is, including if `parent` was cancelled before the job
    /// registered as running.
    pub async fn start_within<R: EngineReporter>(
        &self,
        job: Job,
        reporter: &R,
        parent: &CancellationToken,
    ) -> Result<JobOutcome, AppError> {
        self.run(job, reporter, parent.child_token()).await
    }

    async fn run<R: EngineReporter>(
        &self,
        mut job: Job,
        reporter: &R,
        token: CancellationToken,
    ) -> Result<JobOutcome, AppError> {
        job.start()?;

        self.canceller.running.insert(job.id, token.clone());
        let _guard = RunningGuard {
            running: self.canceller.running.clone(),
            job_id: job.id,
        };

        reporter.report(EngineEvent::JobStarted {
            job_id: job.id,
            name: &job.name,
            targets: job.targets.len(),
        });

        if let Err(error) = self.sink.mark_running(&job).await {
            reporter.report(EngineEvent::SinkFailed {
                job_id: job.id,
                error: &error,
            });
        }

        // Chains are fixed before anything is dispatched.
        let chains: Vec<_> = job
            .targets
            .iter()
            .map(|t| StrategyChain::resolve(&self.strategies, t, &job.config.effective_for(t)))
            .collect();

        // The job's rate limit applies to its domains until the run ends.
        let domains: Vec<String> = job.targets.iter().filter_map(|t| t.domain()).collect();
        let _lease = self.registry.lease(
            job.id,
            domains.iter().map(String::as_str),
            &job.config.rate_limit,
        );

        let results = self.dispatch(&job, chains, &token, reporter).await;

        let outcome = JobOutcome::new(job.id, results, job.targets.len());
        job.finish(outcome.status);
        self.sink.finalize(&job, &outcome).await?;

        reporter.report(EngineEvent::JobFinished {
            job_id: job.id,
            outcome: &outcome,
        });
        Ok(outcome)
    }

    async fn dispatch<R: EngineReporter>(
        &self,
        job: &Job,
        chains: Vec<Result<StrategyChain, AppError>>,
        token: &CancellationToken,
        reporter: &R,
    ) -> Vec<TargetResult> {
        let executor = TargetExecutor::new(
            self.registry.clone(),
            self.config.retry.clone(),
            self.config.acquire_timeout,
            token.clone(),
        );
        let config = Arc::new(job.config.clone());

        let mut queue = job.targets.iter().cloned().zip(chains).enumerate();
        let mut next = queue.next();
        let mut tasks = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, InFlight> = HashMap::new();
        let mut results = Vec::with_capacity(job.targets.len());
        let mut interrupted = false;

        let deadline = job.config.deadline;
        let deadline_expired = async move {
            match deadline {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline_expired);

        loop {
            if tasks.is_empty() && (next.is_none() || interrupted) {
                break;
            }

            tokio::select! {
                biased;

                Some(joined) = tasks.join_next_with_id(), if !tasks.is_empty() => {
                    // The permit is released only after the result is handled,
                    // so a cancellation raised here is seen before the next dispatch.
                    let (id, execution) = match joined {
                        Ok((id, execution)) => (id, execution),
                        Err(join_err) => {
                            let id = join_err.id();
                            let message = format!("Target task failed: {join_err}");
                            let execution = match in_flight.get(&id) {
                                Some(f) => TargetExecution::Resolved(panicked(job, f.index, message)),
                                None => TargetExecution::Cancelled,
                            };
                            (id, execution)
                        }
                    };

                    if let TargetExecution::Resolved(result) = execution {
                        if let Err(error) = self.sink.save_result(job.id, &result).await {
                            reporter.report(EngineEvent::SinkFailed { job_id: job.id, error: &error });
                        }
                        reporter.report(EngineEvent::TargetResolved { job_id: job.id, result: &result });
                        results.push(result);
                    }
                    in_flight.remove(&id);
                }

                () = token.cancelled(), if !interrupted => {
                    interrupted = true;
                    reporter.report(EngineEvent::Interrupted {
                        job_id: job.id,
                        reason: "cancelled",
                        pending: job.targets.len() - results.len(),
                    });
                }

                () = &mut deadline_expired, if !interrupted => {
                    interrupted = true;
                    token.cancel();
                    reporter.report(EngineEvent::Interrupted {
                        job_id: job.id,
                        reason: "deadline expired",
                        pending: job.targets.len() - results.len(),
                    });
                }

                permit = self.permits.clone().acquire_owned(), if next.is_some() && !interrupted => {
                    let Ok(permit) = permit else {
                        tracing::error!(job_id = %job.id, "Concurrency semaphore closed");
                        interrupted = true;
                        continue;
                    };
                    let Some((index, (target, chain))) = next.take() else {
                        continue;
                    };
                    next = queue.next();

                    let names: Vec<&str> = chain.as_ref().map(|c| c.names()).unwrap_or_default();
                    reporter.report(EngineEvent::TargetDispatched {
                        job_id: job.id,
                        index,
                        url: &target.url,
                        strategies: &names,
                    });

                    let executor = executor.clone();
                    let config = config.clone();
                    let job_id = job.id;
                    let handle = tasks.spawn(async move {
                        executor.execute(job_id, index, &target, &config, chain).await
                    });
                    in_flight.insert(handle.id(), InFlight { index, _permit: permit });
                }
            }
        }

        results
    }
}

fn panicked(job: &Job, index: usize, message: String) -> TargetResult {
    TargetResult::new(
        job.id,
        index,
        &job.targets[index],
        TargetOutcome::Failed {
            error: FailureCause {
                kind: "generic".into(),
                message,
            },
        },
        None,
        Vec::new(),
        0,
    )
}
