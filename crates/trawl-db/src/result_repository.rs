use chrono::{DateTime, Utc};
use sqlx::{PgExecutor, PgPool};
use trawl_core::error::AppError;
use trawl_core::job::{Job, JobStatus};
use trawl_core::models::{FailureCause, JobOutcome, JobRecord, TargetOutcome, TargetResult};
use trawl_core::traits::ResultSink;
use uuid::Uuid;

const TERMINAL_STATUSES: &[&str] = &["completed", "partially_completed", "failed", "cancelled"];

/// PostgreSQL-backed [`ResultSink`].
///
/// Results are written as they resolve, but the read queries only return
/// them once the job row carries a terminal status. `finalize` rewrites the
/// job row and every result in one transaction, so readers see either the
/// full result set with its status or nothing.
#[derive(Clone)]
pub struct PgResultSink {
    pool: PgPool,
}

impl PgResultSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<JobRecord>, AppError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, name, status, target_count, created_at, started_at, finished_at
            FROM scrape_jobs
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.map(TryInto::try_into).transpose()
    }

    /// Results of a finished job, sorted by target index. Empty while the
    /// job is still pending or running.
    pub async fn get_results(&self, job_id: Uuid) -> Result<Vec<TargetResult>, AppError> {
        let rows = sqlx::query_as::<_, ResultRow>(
            r#"
            SELECT r.job_id, r.target_index, r.url, r.data_type, r.success, r.payload,
                   r.error_kind, r.error_message, r.strategy_used, r.attempts,
                   r.strategy_attempts, r.elapsed_ms, r.data_hash, r.finished_at
            FROM target_results r
            JOIN scrape_jobs j ON j.id = r.job_id
            WHERE r.job_id = $1 AND j.status = ANY($2)
            ORDER BY r.target_index
            "#,
        )
        .bind(job_id)
        .bind(TERMINAL_STATUSES)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Most recent jobs first, optionally filtered by status.
    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, AppError> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, name, status, target_count, created_at, started_at, finished_at
            FROM scrape_jobs
            WHERE $1::text IS NULL OR status = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}

impl ResultSink for PgResultSink {
    async fn mark_running(&self, job: &Job) -> Result<(), AppError> {
        upsert_job(&self.pool, job).await
    }

    async fn save_result(&self, job_id: Uuid, result: &TargetResult) -> Result<(), AppError> {
        upsert_result(&self.pool, job_id, result).await
    }

    async fn finalize(&self, job: &Job, outcome: &JobOutcome) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        upsert_job(&mut *tx, job).await?;
        for result in &outcome.results {
            upsert_result(&mut *tx, job.id, result).await?;
        }

        tx.commit().await.map_err(db_error)?;
        tracing::debug!(
            job_id = %job.id,
            status = %job.status,
            results = outcome.results.len(),
            "Job finalized"
        );
        Ok(())
    }
}

async fn upsert_job<'e>(executor: impl PgExecutor<'e>, job: &Job) -> Result<(), AppError> {
    let config = serde_json::to_value(&job.config)?;
    sqlx::query(
        r#"
        INSERT INTO scrape_jobs (id, name, status, config, target_count, created_at, started_at, finished_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (id) DO UPDATE
        SET status = EXCLUDED.status,
            started_at = EXCLUDED.started_at,
            finished_at = EXCLUDED.finished_at
        "#,
    )
    .bind(job.id)
    .bind(&job.name)
    .bind(job.status.as_str())
    .bind(config)
    .bind(job.targets.len() as i32)
    .bind(job.created_at)
    .bind(job.started_at)
    .bind(job.finished_at)
    .execute(executor)
    .await
    .map_err(db_error)?;
    Ok(())
}

async fn upsert_result<'e>(
    executor: impl PgExecutor<'e>,
    job_id: Uuid,
    result: &TargetResult,
) -> Result<(), AppError> {
    let (payload, error) = match &result.outcome {
        TargetOutcome::Success { payload } => (Some(serde_json::Value::Object(payload.clone())), None),
        TargetOutcome::Failed { error } => (None, Some(error)),
    };
    let strategy_attempts = serde_json::to_value(&result.strategy_attempts)?;

    sqlx::query(
        r#"
        INSERT INTO target_results (
            job_id, target_index, url, data_type, success, payload, error_kind, error_message,
            strategy_used, attempts, strategy_attempts, elapsed_ms, data_hash, finished_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        ON CONFLICT (job_id, target_index) DO UPDATE
        SET url = EXCLUDED.url,
            data_type = EXCLUDED.data_type,
            success = EXCLUDED.success,
            payload = EXCLUDED.payload,
            error_kind = EXCLUDED.error_kind,
            error_message = EXCLUDED.error_message,
            strategy_used = EXCLUDED.strategy_used,
            attempts = EXCLUDED.attempts,
            strategy_attempts = EXCLUDED.strategy_attempts,
            elapsed_ms = EXCLUDED.elapsed_ms,
            data_hash = EXCLUDED.data_hash,
            finished_at = EXCLUDED.finished_at
        "#,
    )
    .bind(job_id)
    .bind(result.target_index as i32)
    .bind(&result.url)
    .bind(result.data_type.as_str())
    .bind(result.is_success())
    .bind(payload)
    .bind(error.map(|e| e.kind.as_str()))
    .bind(error.map(|e| e.message.as_str()))
    .bind(result.strategy_used.as_deref())
    .bind(result.attempts as i32)
    .bind(strategy_attempts)
    .bind(result.elapsed_ms as i64)
    .bind(result.data_hash.as_deref())
    .bind(result.finished_at)
    .execute(executor)
    .await
    .map_err(db_error)?;
    Ok(())
}

fn db_error(e: sqlx::Error) -> AppError {
    AppError::DatabaseError(e.to_string())
}

// -- Internal row types for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    name: String,
    status: String,
    target_count: i32,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = AppError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(JobRecord {
            id: row.id,
            name: row.name,
            status: row.status.parse().map_err(AppError::DatabaseError)?,
            target_count: row.target_count.max(0) as usize,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ResultRow {
    job_id: Uuid,
    target_index: i32,
    url: String,
    data_type: String,
    success: bool,
    payload: Option<serde_json::Value>,
    error_kind: Option<String>,
    error_message: Option<String>,
    strategy_used: Option<String>,
    attempts: i32,
    strategy_attempts: serde_json::Value,
    elapsed_ms: i64,
    data_hash: Option<String>,
    finished_at: DateTime<Utc>,
}

impl TryFrom<ResultRow> for TargetResult {
    type Error = AppError;

    fn try_from(row: ResultRow) -> Result<Self, Self::Error> {
        let outcome = if row.success {
            match row.payload {
                Some(serde_json::Value::Object(payload)) => TargetOutcome::Success { payload },
                other => {
                    return Err(AppError::DatabaseError(format!(
                        "Result {}#{} has a non-object payload: {other:?}",
                        row.job_id, row.target_index
                    )));
                }
            }
        } else {
            let kind = row.error_kind.unwrap_or_else(|| "generic".into());
            TargetOutcome::Failed {
                error: FailureCause {
                    message: row.error_message.unwrap_or_else(|| kind.clone()),
                    kind,
                },
            }
        };

        Ok(TargetResult {
            job_id: row.job_id,
            target_index: row.target_index.max(0) as usize,
            url: row.url,
            data_type: row.data_type.parse().map_err(AppError::DatabaseError)?,
            outcome,
            strategy_used: row.strategy_used,
            attempts: row.attempts.max(0) as u32,
            strategy_attempts: serde_json::from_value(row.strategy_attempts)?,
            elapsed_ms: row.elapsed_ms.max(0) as u64,
            data_hash: row.data_hash,
            finished_at: row.finished_at,
        })
    }
}
