//! Background job execution with backpressure.
//!
//! Jobs are pushed onto a bounded queue and picked up by a fixed set of
//! workers, each running [`JobEngine::start`]. Callers poll the result sink
//! for progress.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine::{EngineReporter, JobEngine, TracingEngineReporter};
use crate::error::AppError;
use crate::job::Job;
use crate::traits::ResultSink;

/// Sizing of a [`JobPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 32,
        }
    }
}

/// Bounded worker pool in front of a [`JobEngine`].
pub struct JobPool {
    sender: mpsc::Sender<Job>,
    capacity: usize,
    shutdown: CancellationToken,
    workers: JoinSet<()>,
}

impl JobPool {
    /// Start `config.workers` workers pulling from a queue of
    /// `config.queue_capacity` jobs.
    pub fn spawn<S>(engine: Arc<JobEngine<S>>, config: PoolConfig) -> Self
    where
        S: ResultSink + 'static,
    {
        Self::spawn_with(engine, config, Arc::new(TracingEngineReporter))
    }

    pub fn spawn_with<S, R>(engine: Arc<JobEngine<S>>, config: PoolConfig, reporter: Arc<R>) -> Self
    where
        S: ResultSink + 'static,
        R: EngineReporter + 'static,
    {
        let capacity = config.queue_capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let shutdown = CancellationToken::new();

        let mut workers = JoinSet::new();
        for worker in 0..config.workers.max(1) {
            let engine = engine.clone();
            let receiver = receiver.clone();
            let shutdown = shutdown.clone();
            let reporter = reporter.clone();
            workers.spawn(async move {
                run_worker(worker, engine, receiver, shutdown, reporter.as_ref()).await;
            });
        }

        Self {
            sender,
            capacity,
            shutdown,
            workers,
        }
    }

    /// Queue a job without waiting. Fails with [`AppError::QueueFull`] when
    /// the queue is saturated.
    pub fn submit(&self, job: Job) -> Result<Uuid, AppError> {
        let job_id = job.id;
        match self.sender.try_send(job) {
            Ok(()) => {
                tracing::debug!(%job_id, "Job queued");
                Ok(job_id)
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(AppError::QueueFull(self.capacity)),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(AppError::Generic("Job pool is shut down".into()))
            }
        }
    }

    /// Queue a job, waiting for capacity if the queue is full.
    pub async fn submit_wait(&self, job: Job) -> Result<Uuid, AppError> {
        let job_id = job.id;
        tokio::select! {
            sent = self.sender.send(job) => {
                sent.map_err(|_| AppError::Generic("Job pool is shut down".into()))?;
                tracing::debug!(%job_id, "Job queued");
                Ok(job_id)
            }
            () = self.shutdown.cancelled() => Err(AppError::Generic("Job pool is shut down".into())),
        }
    }

    /// Jobs waiting in the queue.
    pub fn queued(&self) -> usize {
        self.capacity - self.sender.capacity()
    }

    /// Stop accepting work, cancel running jobs and wait for the workers.
    /// Jobs still queued are dropped without being started; a job a worker
    /// dequeued concurrently is finalized as cancelled.
    pub async fn shutdown(mut self) {
        tracing::info!(queued = self.queued(), "Shutting down job pool");
        // Every pool job runs under a child of this token.
        self.shutdown.cancel();
        while let Some(joined) = self.workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Pool worker panicked");
            }
        }
    }
}

async fn run_worker<S, R>(
    worker: usize,
    engine: Arc<JobEngine<S>>,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    shutdown: CancellationToken,
    reporter: &R,
) where
    S: ResultSink,
    R: EngineReporter,
{
    tracing::debug!(worker, "Pool worker started");
    loop {
        let job = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            job = async { receiver.lock().await.recv().await } => match job {
                Some(job) => job,
                None => break,
            },
        };

        let job_id = job.id;
        if let Err(error) = engine.start_within(job, reporter, &shutdown).await {
            tracing::error!(worker, %job_id, %error, "Job did not finish cleanly");
        }
    }
    tracing::debug!(worker, "Pool worker stopped");
}
