use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use trawl_client::HttpStrategy;
use trawl_core::models::{JobOutcome, TargetResult};
use trawl_core::traits::ResultSink;
use trawl_core::{EngineConfig, JobDefinition, JobEngine, JobStatus, MemorySink, Strategy};
use trawl_db::{Database, DatabaseConfig, PgResultSink};

#[derive(Parser)]
#[command(name = "trawl", version, about = "Rate-limited, fault-tolerant scraping jobs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Json,
    Csv,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a job definition to completion
    Run {
        /// Path to the JSON job definition
        #[arg(short, long)]
        job: PathBuf,

        /// Persist the job and its results (requires DATABASE_URL)
        #[arg(long, default_value_t = false)]
        save: bool,

        /// Output format for the outcome
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,

        /// Global number of targets in flight
        #[arg(short, long, env = "TRAWL_MAX_CONCURRENCY")]
        concurrency: Option<usize>,

        /// Proxy used for targets with `use_proxy`
        #[arg(long, env = "TRAWL_PROXY")]
        proxy: Option<String>,

        /// Allow targets on private/reserved IP ranges
        #[arg(long, default_value_t = false)]
        allow_private_urls: bool,

        /// Also register the headless browser strategies
        #[cfg(feature = "browser")]
        #[arg(long, default_value_t = false)]
        browser: bool,
    },

    /// Show a persisted job
    Status {
        #[arg(long)]
        job_id: Uuid,
    },

    /// Show the results of a finished job
    Results {
        #[arg(long)]
        job_id: Uuid,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },

    /// List recent jobs
    Jobs {
        /// Only jobs in this status (e.g. "failed")
        #[arg(short, long)]
        status: Option<JobStatus>,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Logs go to stderr so stdout stays machine-readable.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("trawl=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            job,
            save,
            format,
            concurrency,
            proxy,
            allow_private_urls,
            #[cfg(feature = "browser")]
            browser,
        } => {
            let mut config = EngineConfig::from_env().context("Invalid engine configuration")?;
            if let Some(n) = concurrency {
                config = config.with_max_concurrency(n);
            }

            #[cfg_attr(not(feature = "browser"), allow(unused_mut))]
            let mut strategies = http_strategies(proxy.as_deref(), allow_private_urls)?;
            #[cfg(feature = "browser")]
            {
                if browser {
                    strategies.extend(browser_strategies().await?);
                }
            }

            if save {
                let db = connect_db().await?;
                let engine = JobEngine::new(db.result_sink(), strategies, config);
                cmd_run(&engine, &job, format).await?;
            } else {
                let engine = JobEngine::new(MemorySink::new(), strategies, config);
                cmd_run(&engine, &job, format).await?;
            }
        }
        Commands::Status { job_id } => {
            let sink = connect_db().await?.result_sink();
            cmd_status(&sink, job_id).await?;
        }
        Commands::Results { job_id, format } => {
            let sink = connect_db().await?.result_sink();
            cmd_results(&sink, job_id, format).await?;
        }
        Commands::Jobs { status, limit } => {
            let sink = connect_db().await?.result_sink();
            cmd_jobs(&sink, status, limit).await?;
        }
    }

    Ok(())
}

/// Connect to PostgreSQL using DATABASE_URL and apply migrations.
async fn connect_db() -> Result<Database> {
    let config = DatabaseConfig::from_env()?;
    let db = Database::connect(&config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await?;
    Ok(db)
}

fn http_strategies(proxy: Option<&str>, allow_private_urls: bool) -> Result<Vec<Arc<dyn Strategy>>> {
    let mut http = HttpStrategy::new().context("Failed to create HTTP client")?;
    if let Some(proxy) = proxy {
        http = http.with_proxy(proxy)?;
    }
    if allow_private_urls {
        http = http.allow_private_urls();
    }
    Ok(vec![Arc::new(http) as Arc<dyn Strategy>])
}

#[cfg(feature = "browser")]
async fn browser_strategies() -> Result<Vec<Arc<dyn Strategy>>> {
    use trawl_client::BrowserStrategy;

    let browser = BrowserStrategy::launch()
        .await
        .context("Failed to launch headless browser")?;
    let stealth = BrowserStrategy::launch_stealth()
        .await
        .context("Failed to launch stealth browser")?;
    Ok(vec![
        Arc::new(browser) as Arc<dyn Strategy>,
        Arc::new(stealth) as Arc<dyn Strategy>,
    ])
}

async fn cmd_run<S: ResultSink + 'static>(
    engine: &JobEngine<S>,
    job_path: &Path,
    format: OutputFormat,
) -> Result<()> {
    let job = JobDefinition::from_file(job_path)?
        .into_job()
        .with_context(|| format!("Invalid job definition: {}", job_path.display()))?;
    let job_id = job.id;

    tracing::info!(%job_id, name = %job.name, targets = job.targets.len(), "Running job");

    // First Ctrl-C cancels cooperatively; in-flight attempts still finish.
    let canceller = engine.canceller();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!(%job_id, "Interrupt received, cancelling job");
            canceller.cancel(job_id);
        }
    });

    let outcome = engine.start(job).await;
    ctrl_c.abort();
    let outcome = outcome.context("Failed to finalize job")?;

    for stats in engine.registry().snapshot() {
        tracing::info!(
            domain = %stats.domain,
            state = ?stats.state,
            failures = stats.failure_count,
            last_error = stats.last_error.as_deref().unwrap_or("-"),
            "Circuit breaker"
        );
    }

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&outcome)?),
        OutputFormat::Csv => write_csv(std::io::stdout().lock(), &outcome.results)?,
    }

    if outcome.status != JobStatus::Completed {
        print_summary(&outcome);
    }
    Ok(())
}

fn print_summary(outcome: &JobOutcome) {
    tracing::warn!(
        job_id = %outcome.job_id,
        status = %outcome.status,
        succeeded = outcome.succeeded,
        failed = outcome.failed,
        unresolved = outcome.unresolved,
        "Job did not complete cleanly"
    );
}

async fn cmd_status(sink: &PgResultSink, job_id: Uuid) -> Result<()> {
    match sink.get_job(job_id).await? {
        Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
        None => println!("No job found with id {job_id}"),
    }
    Ok(())
}

async fn cmd_results(sink: &PgResultSink, job_id: Uuid, format: OutputFormat) -> Result<()> {
    let Some(record) = sink.get_job(job_id).await? else {
        println!("No job found with id {job_id}");
        return Ok(());
    };
    if !record.status.is_terminal() {
        println!("Job {job_id} is {}; results are available once it finishes", record.status);
        return Ok(());
    }

    let results = sink.get_results(job_id).await?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&results)?),
        OutputFormat::Csv => write_csv(std::io::stdout().lock(), &results)?,
    }
    Ok(())
}

async fn cmd_jobs(sink: &PgResultSink, status: Option<JobStatus>, limit: usize) -> Result<()> {
    let jobs = sink.list_jobs(status, limit).await?;
    if jobs.is_empty() {
        println!("No jobs found");
        return Ok(());
    }

    for job in &jobs {
        println!(
            "  {} [{}] {} ({} targets, created {})",
            job.id,
            job.status,
            job.name,
            job.target_count,
            job.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
        );
    }
    println!("\nTotal: {} jobs", jobs.len());
    Ok(())
}

/// One CSV row per target result.
fn write_csv(writer: impl Write, results: &[TargetResult]) -> Result<()> {
    let mut csv = csv::Writer::from_writer(writer);
    csv.write_record([
        "target_index",
        "url",
        "data_type",
        "status",
        "strategy_used",
        "attempts",
        "elapsed_ms",
        "error_kind",
        "error_message",
        "payload",
        "data_hash",
    ])?;

    for r in results {
        let payload = match r.payload() {
            Some(p) => serde_json::to_string(p)?,
            None => String::new(),
        };
        let (kind, message) = r
            .error()
            .map(|e| (e.kind.as_str(), e.message.as_str()))
            .unwrap_or_default();
        csv.write_record([
            r.target_index.to_string().as_str(),
            r.url.as_str(),
            r.data_type.as_str(),
            if r.is_success() { "success" } else { "failed" },
            r.strategy_used.as_deref().unwrap_or(""),
            r.attempts.to_string().as_str(),
            r.elapsed_ms.to_string().as_str(),
            kind,
            message,
            payload.as_str(),
            r.data_hash.as_deref().unwrap_or(""),
        ])?;
    }
    csv.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use trawl_core::job::{DataType, Target};
    use trawl_core::models::{FailureCause, Payload, StrategyAttempts, TargetOutcome};
    use trawl_core::AppError;

    use super::*;

    #[test]
    fn csv_has_one_row_per_result() {
        let job_id = Uuid::new_v4();
        let target = Target::new("https://example.com/jobs", DataType::JobListing);
        let mut payload = Payload::new();
        payload.insert("title".into(), serde_json::json!("Rust Engineer"));

        let ok = TargetResult::new(
            job_id,
            0,
            &target,
            TargetOutcome::Success { payload },
            Some("http".into()),
            vec![StrategyAttempts {
                strategy: "http".into(),
                attempts: 1,
            }],
            12,
        );
        let failed = TargetResult::new(
            job_id,
            1,
            &target,
            TargetOutcome::Failed {
                error: FailureCause::from(&AppError::Timeout(5000)),
            },
            Some("http".into()),
            vec![StrategyAttempts {
                strategy: "http".into(),
                attempts: 3,
            }],
            15000,
        );

        let mut out = Vec::new();
        write_csv(&mut out, &[ok, failed]).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("target_index,url,data_type,status"));
        assert!(lines[1].contains("success"));
        assert!(lines[1].contains("Rust Engineer"));
        assert!(lines[2].contains("failed"));
        assert!(lines[2].contains("timeout"));
    }
}
