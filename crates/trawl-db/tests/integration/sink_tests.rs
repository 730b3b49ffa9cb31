use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use trawl_core::job::{DataType, Job, JobStatus, RateLimit, ScrapingConfig, Target};
use trawl_core::models::{JobOutcome, Payload, StrategyAttempts, TargetOutcome, TargetResult};
use trawl_core::strategy::{Capabilities, Strategy};
use trawl_core::traits::ResultSink;
use trawl_core::{AppError, EngineConfig, FailureCause, JobEngine};

use crate::integration::common::setup_test_db;

fn job(targets: usize) -> Job {
    let targets = (0..targets)
        .map(|i| Target::new(format!("https://example.com/{i}"), DataType::JobListing))
        .collect();
    Job::new("persisted", targets, ScrapingConfig::default())
}

fn success(job: &Job, index: usize) -> TargetResult {
    let mut payload = Payload::new();
    payload.insert("title".into(), serde_json::json!(format!("Job {index}")));
    TargetResult::new(
        job.id,
        index,
        &job.targets[index],
        TargetOutcome::Success { payload },
        Some("http".into()),
        vec![StrategyAttempts {
            strategy: "http".into(),
            attempts: 2,
        }],
        42,
    )
}

fn failure(job: &Job, index: usize) -> TargetResult {
    let err = AppError::HttpStatus {
        status: 404,
        url: job.targets[index].url.clone(),
    };
    TargetResult::new(
        job.id,
        index,
        &job.targets[index],
        TargetOutcome::Failed {
            error: FailureCause::from(&err),
        },
        Some("http".into()),
        vec![StrategyAttempts {
            strategy: "http".into(),
            attempts: 1,
        }],
        7,
    )
}

#[tokio::test]
async fn mark_running_makes_job_visible() {
    let (db, _container) = setup_test_db().await;
    let sink = db.result_sink();

    let mut job = job(2);
    job.start().unwrap();
    sink.mark_running(&job).await.unwrap();

    let record = sink.get_job(job.id).await.unwrap().expect("job row");
    assert_eq!(record.status, JobStatus::Running);
    assert_eq!(record.name, "persisted");
    assert_eq!(record.target_count, 2);
    assert!(record.started_at.is_some());
    assert!(record.finished_at.is_none());
}

#[tokio::test]
async fn results_hidden_until_finalized() {
    let (db, _container) = setup_test_db().await;
    let sink = db.result_sink();

    let mut job = job(2);
    job.start().unwrap();
    sink.mark_running(&job).await.unwrap();
    sink.save_result(job.id, &success(&job, 1)).await.unwrap();

    assert!(sink.get_results(job.id).await.unwrap().is_empty());

    let outcome = JobOutcome::new(job.id, vec![success(&job, 1), failure(&job, 0)], 2);
    job.finish(outcome.status);
    sink.finalize(&job, &outcome).await.unwrap();

    let record = sink.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::PartiallyCompleted);
    assert!(record.finished_at.is_some());

    let results = sink.get_results(job.id).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].target_index, 0);
    assert_eq!(results[1].target_index, 1);

    let error = results[0].error().expect("failed result");
    assert_eq!(error.kind, "http_status");
    assert!(!error.message.is_empty());

    let payload = results[1].payload().expect("successful result");
    assert_eq!(payload["title"], "Job 1");
    assert_eq!(results[1].attempts, 2);
    assert_eq!(results[1].strategy_attempts[0].strategy, "http");
    assert_eq!(results[1].data_hash, success(&job, 1).data_hash);
}

#[tokio::test]
async fn finalize_is_idempotent() {
    let (db, _container) = setup_test_db().await;
    let sink = db.result_sink();

    let mut job = job(1);
    job.start().unwrap();
    sink.mark_running(&job).await.unwrap();

    let outcome = JobOutcome::new(job.id, vec![success(&job, 0)], 1);
    job.finish(outcome.status);
    sink.finalize(&job, &outcome).await.unwrap();
    sink.finalize(&job, &outcome).await.unwrap();

    assert_eq!(sink.get_results(job.id).await.unwrap().len(), 1);
    assert_eq!(
        sink.get_job(job.id).await.unwrap().unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test]
async fn finalize_without_mark_running_creates_job() {
    let (db, _container) = setup_test_db().await;
    let sink = db.result_sink();

    let mut job = job(1);
    job.start().unwrap();
    let outcome = JobOutcome::new(job.id, vec![failure(&job, 0)], 1);
    job.finish(outcome.status);
    sink.finalize(&job, &outcome).await.unwrap();

    assert_eq!(
        sink.get_job(job.id).await.unwrap().unwrap().status,
        JobStatus::Failed
    );
}

#[tokio::test]
async fn list_jobs_filters_by_status() {
    let (db, _container) = setup_test_db().await;
    let sink = db.result_sink();

    let mut running = job(1);
    running.start().unwrap();
    sink.mark_running(&running).await.unwrap();

    let mut done = job(1);
    done.start().unwrap();
    let outcome = JobOutcome::new(done.id, vec![success(&done, 0)], 1);
    done.finish(outcome.status);
    sink.finalize(&done, &outcome).await.unwrap();

    assert_eq!(sink.list_jobs(None, 10).await.unwrap().len(), 2);

    let completed = sink
        .list_jobs(Some(JobStatus::Completed), 10)
        .await
        .unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].id, done.id);

    assert_eq!(sink.list_jobs(None, 1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn get_job_returns_none_for_unknown_id() {
    let (db, _container) = setup_test_db().await;
    let sink = db.result_sink();
    assert!(sink.get_job(uuid::Uuid::new_v4()).await.unwrap().is_none());
}

/// Strategy that fails every URL containing "broken".
struct PathStrategy;

impl Strategy for PathStrategy {
    fn name(&self) -> &str {
        "path"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            handles_javascript: false,
            stealth_level: 1,
            cost: 1,
        }
    }

    fn try_scrape<'a>(
        &'a self,
        target: &'a Target,
        _config: &'a ScrapingConfig,
    ) -> Pin<Box<dyn Future<Output = Result<Payload, AppError>> + Send + 'a>> {
        Box::pin(async move {
            if target.url.contains("broken") {
                return Err(AppError::HttpStatus {
                    status: 410,
                    url: target.url.clone(),
                });
            }
            let mut payload = Payload::new();
            payload.insert("url".into(), serde_json::json!(target.url));
            Ok(payload)
        })
    }
}

#[tokio::test]
async fn engine_persists_job_through_sink() {
    let (db, _container) = setup_test_db().await;
    let engine = JobEngine::new(
        db.result_sink(),
        vec![Arc::new(PathStrategy) as Arc<dyn Strategy>],
        EngineConfig::default(),
    );

    let config = ScrapingConfig::default()
        .with_delay(Duration::ZERO)
        .with_rate_limit(RateLimit::new(100, Duration::from_secs(1), 10));
    let job = Job::new(
        "engine",
        vec![
            Target::new("https://a.example.com/ok", DataType::GeneralData),
            Target::new("https://b.example.com/broken", DataType::GeneralData),
            Target::new("https://c.example.com/ok", DataType::SupportResource),
        ],
        config,
    );
    let job_id = job.id;

    let outcome = engine.start(job).await.unwrap();
    assert_eq!(outcome.status, JobStatus::PartiallyCompleted);

    let sink = engine.sink();
    let record = sink.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::PartiallyCompleted);

    let results = sink.get_results(job_id).await.unwrap();
    assert_eq!(results.len(), 3);
    assert!(results[0].is_success());
    assert!(!results[1].is_success());
    assert_eq!(results[1].error().unwrap().kind, "http_status");
    assert_eq!(results[2].data_type, DataType::SupportResource);
}
