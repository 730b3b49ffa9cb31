use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{DataType, Job, JobStatus, Target};

/// Extracted fields keyed by the selector names of the target.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Why a target failed. Always carries a non-empty message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCause {
    pub kind: String,
    pub message: String,
}

impl From<&AppError> for FailureCause {
    fn from(err: &AppError) -> Self {
        let kind = err.kind().to_string();
        let mut message = err.to_string();
        if message.trim().is_empty() {
            message = kind.clone();
        }
        Self { kind, message }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TargetOutcome {
    Success { payload: Payload },
    Failed { error: FailureCause },
}

/// Number of strategy invocations spent on one strategy of the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyAttempts {
    pub strategy: String,
    pub attempts: u32,
}

/// The resolved outcome of scraping one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetResult {
    pub job_id: Uuid,
    pub target_index: usize,
    pub url: String,
    pub data_type: DataType,
    pub outcome: TargetOutcome,
    /// Last strategy that was invoked; `None` when no strategy ran
    /// (e.g. the circuit was open).
    pub strategy_used: Option<String>,
    /// Total strategy invocations across the chain.
    pub attempts: u32,
    pub strategy_attempts: Vec<StrategyAttempts>,
    pub elapsed_ms: u64,
    /// SHA-256 of the payload, for change detection.
    pub data_hash: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl TargetResult {
    pub fn new(
        job_id: Uuid,
        target_index: usize,
        target: &Target,
        outcome: TargetOutcome,
        strategy_used: Option<String>,
        strategy_attempts: Vec<StrategyAttempts>,
        elapsed_ms: u64,
    ) -> Self {
        let data_hash = match &outcome {
            TargetOutcome::Success { payload } => Some(payload_hash(payload)),
            TargetOutcome::Failed { .. } => None,
        };
        Self {
            job_id,
            target_index,
            url: target.url.clone(),
            data_type: target.data_type,
            outcome,
            strategy_used,
            attempts: strategy_attempts.iter().map(|s| s.attempts).sum(),
            strategy_attempts,
            elapsed_ms,
            data_hash,
            finished_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, TargetOutcome::Success { .. })
    }

    pub fn payload(&self) -> Option<&Payload> {
        match &self.outcome {
            TargetOutcome::Success { payload } => Some(payload),
            TargetOutcome::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&FailureCause> {
        match &self.outcome {
            TargetOutcome::Failed { error } => Some(error),
            TargetOutcome::Success { .. } => None,
        }
    }
}

/// Aggregate of a job's target results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: Uuid,
    pub status: JobStatus,
    /// Resolved results, sorted by target index.
    pub results: Vec<TargetResult>,
    pub total_targets: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Targets never dispatched or abandoned by cancellation.
    pub unresolved: usize,
}

impl JobOutcome {
    pub fn new(job_id: Uuid, mut results: Vec<TargetResult>, total_targets: usize) -> Self {
        results.sort_by_key(|r| r.target_index);
        let succeeded = results.iter().filter(|r| r.is_success()).count();
        let failed = results.len() - succeeded;
        let unresolved = total_targets.saturating_sub(results.len());
        let status = derive_status(succeeded, failed, unresolved);
        Self {
            job_id,
            status,
            results,
            total_targets,
            succeeded,
            failed,
            unresolved,
        }
    }
}

/// Job row as persisted by a result sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub name: String,
    pub status: JobStatus,
    pub target_count: usize,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&Job> for JobRecord {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            name: job.name.clone(),
            status: job.status,
            target_count: job.targets.len(),
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
        }
    }
}

/// Final job status as a pure function of the resolved results.
///
/// Unresolved targets only exist after a cancellation or deadline expiry.
/// A job with no results at all is reported as failed.
pub fn derive_status(succeeded: usize, failed: usize, unresolved: usize) -> JobStatus {
    if unresolved > 0 {
        JobStatus::Cancelled
    } else if succeeded > 0 && failed == 0 {
        JobStatus::Completed
    } else if succeeded == 0 {
        JobStatus::Failed
    } else {
        JobStatus::PartiallyCompleted
    }
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Hash of a payload's canonical JSON (keys are sorted by `serde_json::Map`).
pub fn payload_hash(payload: &Payload) -> String {
    compute_hash(&serde_json::Value::Object(payload.clone()).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(index: usize, ok: bool) -> TargetResult {
        let target = Target::new(format!("https://example.com/{index}"), DataType::GeneralData);
        let outcome = if ok {
            let mut payload = Payload::new();
            payload.insert("title".into(), json!("Example"));
            TargetOutcome::Success { payload }
        } else {
            TargetOutcome::Failed {
                error: FailureCause::from(&AppError::NetworkError("reset".into())),
            }
        };
        TargetResult::new(
            Uuid::nil(),
            index,
            &target,
            outcome,
            Some("http".into()),
            vec![StrategyAttempts {
                strategy: "http".into(),
                attempts: 2,
            }],
            10,
        )
    }

    #[test]
    fn test_compute_hash_consistency() {
        let h1 = compute_hash("hello world");
        let h2 = compute_hash("hello world");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert_ne!(compute_hash("hello"), compute_hash("world"));
    }

    #[test]
    fn test_payload_hash_ignores_insertion_order() {
        let mut a = Payload::new();
        a.insert("b".into(), json!(2));
        a.insert("a".into(), json!(1));
        let mut b = Payload::new();
        b.insert("a".into(), json!(1));
        b.insert("b".into(), json!(2));
        assert_eq!(payload_hash(&a), payload_hash(&b));
    }

    #[test]
    fn test_status_derivation() {
        assert_eq!(derive_status(3, 0, 0), JobStatus::Completed);
        assert_eq!(derive_status(0, 3, 0), JobStatus::Failed);
        assert_eq!(derive_status(2, 1, 0), JobStatus::PartiallyCompleted);
        assert_eq!(derive_status(1, 0, 4), JobStatus::Cancelled);
        assert_eq!(derive_status(0, 0, 0), JobStatus::Failed);
    }

    #[test]
    fn test_outcome_sorts_and_counts() {
        let outcome = JobOutcome::new(
            Uuid::nil(),
            vec![result(2, false), result(0, true), result(1, true)],
            3,
        );
        let indexes: Vec<_> = outcome.results.iter().map(|r| r.target_index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
        assert_eq!(outcome.succeeded, 2);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.unresolved, 0);
        assert_eq!(outcome.status, JobStatus::PartiallyCompleted);
    }

    #[test]
    fn test_failed_result_has_cause_and_no_hash() {
        let failed = result(0, false);
        let cause = failed.error().unwrap();
        assert_eq!(cause.kind, "network");
        assert!(!cause.message.is_empty());
        assert!(failed.data_hash.is_none());
        assert_eq!(failed.attempts, 2);

        let ok = result(1, true);
        assert_eq!(ok.data_hash.as_deref().map(str::len), Some(64));
    }

    #[test]
    fn test_outcome_serializes_tagged() {
        let value = serde_json::to_value(result(0, true)).unwrap();
        assert_eq!(value["outcome"]["status"], "success");
        assert_eq!(value["outcome"]["payload"]["title"], "Example");
    }
}
