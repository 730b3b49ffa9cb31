use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

use crate::error::AppError;
use crate::job::Job;
use crate::models::{JobOutcome, JobRecord, TargetResult};

/// Durable store for job state and target results.
///
/// Every method must have persisted its write before the future resolves.
pub trait ResultSink: Send + Sync + Clone {
    /// Record that the job has started, so pollers observe `running`.
    fn mark_running(&self, job: &Job) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Save one resolved target. Overwrites an earlier save for the same
    /// target index.
    fn save_result(
        &self,
        job_id: Uuid,
        result: &TargetResult,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Write the final job status together with every result, atomically.
    fn finalize(
        &self,
        job: &Job,
        outcome: &JobOutcome,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<Uuid, JobRecord>,
    staged: HashMap<Uuid, BTreeMap<usize, TargetResult>>,
    committed: HashMap<Uuid, Vec<TargetResult>>,
}

/// In-process sink. Results become visible only once the job is finalized.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned memory sink mutex");
            poisoned.into_inner()
        })
    }

    pub fn get_job(&self, job_id: Uuid) -> Option<JobRecord> {
        self.lock().jobs.get(&job_id).cloned()
    }

    /// Finalized results of a job, sorted by target index.
    pub fn get_results(&self, job_id: Uuid) -> Vec<TargetResult> {
        self.lock()
            .committed
            .get(&job_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of results saved but not yet finalized.
    pub fn staged_count(&self, job_id: Uuid) -> usize {
        self.lock().staged.get(&job_id).map_or(0, |s| s.len())
    }
}

impl ResultSink for MemorySink {
    async fn mark_running(&self, job: &Job) -> Result<(), AppError> {
        self.lock().jobs.insert(job.id, JobRecord::from(job));
        Ok(())
    }

    async fn save_result(&self, job_id: Uuid, result: &TargetResult) -> Result<(), AppError> {
        self.lock()
            .staged
            .entry(job_id)
            .or_default()
            .insert(result.target_index, result.clone());
        Ok(())
    }

    async fn finalize(&self, job: &Job, outcome: &JobOutcome) -> Result<(), AppError> {
        let mut state = self.lock();
        state.staged.remove(&job.id);
        state.jobs.insert(job.id, JobRecord::from(job));
        state.committed.insert(job.id, outcome.results.clone());
        Ok(())
    }
}
