//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use uuid::Uuid;

use crate::engine::{EngineEvent, EngineReporter, JobCanceller};
use crate::error::AppError;
use crate::job::{Job, JobStatus, ScrapingConfig, Target};
use crate::models::{JobOutcome, Payload, TargetResult};
use crate::strategy::{Capabilities, Strategy};
use crate::traits::ResultSink;

// ---------------------------------------------------------------------------
// MockStrategy
// ---------------------------------------------------------------------------

type Responder = Arc<dyn Fn() -> Result<Payload, AppError> + Send + Sync>;

/// Mock strategy with scripted responses.
///
/// Each call pops the first scripted response; once they run out, the
/// fallback responder is used (a `{"title": "mock"}` payload by default).
#[derive(Clone)]
pub struct MockStrategy {
    name: String,
    capabilities: Capabilities,
    responses: Arc<Mutex<Vec<Result<Payload, AppError>>>>,
    fallback: Responder,
    delay: Duration,
    calls: Arc<AtomicUsize>,
    call_times: Arc<Mutex<Vec<Instant>>>,
}

impl MockStrategy {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            capabilities: Capabilities {
                handles_javascript: false,
                stealth_level: 1,
                cost: 1,
            },
            responses: Arc::new(Mutex::new(Vec::new())),
            fallback: Arc::new(|| Ok(mock_payload())),
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
            call_times: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_capabilities(mut self, handles_javascript: bool, stealth_level: u8, cost: u8) -> Self {
        self.capabilities = Capabilities {
            handles_javascript,
            stealth_level,
            cost,
        };
        self
    }

    pub fn with_responses(self, responses: Vec<Result<Payload, AppError>>) -> Self {
        *self.responses.lock().unwrap() = responses;
        self
    }

    /// Respond with `f()` whenever the scripted responses are exhausted.
    pub fn always(
        mut self,
        f: impl Fn() -> Result<Payload, AppError> + Send + Sync + 'static,
    ) -> Self {
        self.fallback = Arc::new(f);
        self
    }

    /// Sleep this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.call_times.lock().unwrap().clone()
    }
}

impl Strategy for MockStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn try_scrape<'a>(
        &'a self,
        _target: &'a Target,
        _config: &'a ScrapingConfig,
    ) -> BoxFuture<'a, Result<Payload, AppError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.call_times.lock().unwrap().push(Instant::now());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let scripted = {
                let mut responses = self.responses.lock().unwrap();
                if responses.is_empty() {
                    None
                } else {
                    Some(responses.remove(0))
                }
            };
            scripted.unwrap_or_else(|| (self.fallback)())
        })
    }
}

pub fn mock_payload() -> Payload {
    let mut payload = Payload::new();
    payload.insert("title".into(), serde_json::json!("mock"));
    payload
}

// ---------------------------------------------------------------------------
// RecordingSink
// ---------------------------------------------------------------------------

/// Sink that records every call and can be told to fail.
#[derive(Clone, Default)]
pub struct RecordingSink {
    running: Arc<Mutex<Vec<Uuid>>>,
    saved: Arc<Mutex<Vec<TargetResult>>>,
    finalized: Arc<Mutex<Vec<(Uuid, JobStatus, usize)>>>,
    fail_saves: bool,
    fail_finalize: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_saves() -> Self {
        Self {
            fail_saves: true,
            ..Self::default()
        }
    }

    pub fn failing_finalize() -> Self {
        Self {
            fail_finalize: true,
            ..Self::default()
        }
    }

    pub fn running(&self) -> Vec<Uuid> {
        self.running.lock().unwrap().clone()
    }

    pub fn saved(&self) -> Vec<TargetResult> {
        self.saved.lock().unwrap().clone()
    }

    pub fn finalized_status(&self, job_id: Uuid) -> Option<JobStatus> {
        self.finalized
            .lock()
            .unwrap()
            .iter()
            .find(|(id, _, _)| *id == job_id)
            .map(|(_, status, _)| *status)
    }
}

impl ResultSink for RecordingSink {
    async fn mark_running(&self, job: &Job) -> Result<(), AppError> {
        self.running.lock().unwrap().push(job.id);
        Ok(())
    }

    async fn save_result(&self, _job_id: Uuid, result: &TargetResult) -> Result<(), AppError> {
        if self.fail_saves {
            return Err(AppError::DatabaseError("connection refused".into()));
        }
        self.saved.lock().unwrap().push(result.clone());
        Ok(())
    }

    async fn finalize(&self, job: &Job, outcome: &JobOutcome) -> Result<(), AppError> {
        if self.fail_finalize {
            return Err(AppError::DatabaseError("connection refused".into()));
        }
        self.finalized
            .lock()
            .unwrap()
            .push((job.id, job.status, outcome.results.len()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Mock engine reporter that records events.
#[derive(Default)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<String>>>,
    cancel_on_result: Option<JobCanceller>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reporter that cancels the job as soon as its first target resolves.
    pub fn cancelling(canceller: JobCanceller) -> Self {
        Self {
            events: Arc::default(),
            cancel_on_result: Some(canceller),
        }
    }

    pub fn count(&self, label: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.as_str() == label)
            .count()
    }
}

impl EngineReporter for MockReporter {
    fn report(&self, event: EngineEvent<'_>) {
        let label = match &event {
            EngineEvent::JobStarted { .. } => "JobStarted",
            EngineEvent::TargetDispatched { .. } => "TargetDispatched",
            EngineEvent::TargetResolved { .. } => "TargetResolved",
            EngineEvent::Interrupted { .. } => "Interrupted",
            EngineEvent::SinkFailed { .. } => "SinkFailed",
            EngineEvent::JobFinished { .. } => "JobFinished",
        };
        self.events.lock().unwrap().push(label.to_string());

        if let EngineEvent::TargetResolved { job_id, .. } = event
            && let Some(canceller) = &self.cancel_on_result
        {
            canceller.cancel(job_id);
        }
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn wait_until(timeout: Duration, check: impl Fn() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < timeout {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
