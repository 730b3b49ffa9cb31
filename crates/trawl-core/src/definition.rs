use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::AppError;
use crate::job::{Job, ScrapingConfig, Target};

/// Upper bound on targets in one job.
pub const MAX_TARGETS: usize = 100;

/// A job as submitted by a user, before validation.
///
/// ```json
/// {
///   "name": "nyc-listings",
///   "config": {"max_retries": 2, "rate_limit": {"requests": 2, "window_ms": 1000, "burst": 2}},
///   "targets": [
///     {"url": "https://example.com/jobs", "data_type": "job_listing",
///      "extraction": {"selectors": {"title": "h2.title"}}}
///   ]
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    #[serde(default)]
    pub config: ScrapingConfig,
    pub targets: Vec<Target>,
}

impl JobDefinition {
    /// Load a definition from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::ConfigError(format!("Failed to read job file {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            AppError::ValidationError(format!("Invalid job file {}: {e}", path.display()))
        })
    }

    /// Check the definition against the engine's preconditions.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.name.trim().is_empty() {
            return Err(AppError::ValidationError("Job name must not be empty".into()));
        }
        if self.targets.is_empty() {
            return Err(AppError::ValidationError(
                "Job must have at least one target".into(),
            ));
        }
        if self.targets.len() > MAX_TARGETS {
            return Err(AppError::ValidationError(format!(
                "Job has {} targets, at most {MAX_TARGETS} are allowed",
                self.targets.len()
            )));
        }

        let config = &self.config;
        if config.rate_limit.requests == 0 || config.rate_limit.window.is_zero() {
            return Err(AppError::ValidationError(
                "rate_limit must allow at least one request per non-empty window".into(),
            ));
        }
        if config.timeout.is_zero() {
            return Err(AppError::ValidationError("timeout must be positive".into()));
        }
        if config.max_retries == 0 {
            return Err(AppError::ValidationError("max_retries must be at least 1".into()));
        }

        for (index, target) in self.targets.iter().enumerate() {
            validate_url(&target.url)
                .map_err(|msg| AppError::ValidationError(format!("Target {index}: {msg}")))?;

            if let Some(o) = &target.overrides {
                if o.max_retries == Some(0) {
                    return Err(AppError::ValidationError(format!(
                        "Target {index}: max_retries override must be at least 1"
                    )));
                }
                if o.timeout.is_some_and(|t| t.is_zero()) {
                    return Err(AppError::ValidationError(format!(
                        "Target {index}: timeout override must be positive"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Validate and turn into a pending [`Job`].
    pub fn into_job(self) -> Result<Job, AppError> {
        self.validate()?;
        Ok(Job::new(self.name, self.targets, self.config))
    }
}

fn validate_url(raw: &str) -> Result<(), String> {
    let url = Url::parse(raw).map_err(|e| format!("malformed URL '{raw}': {e}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!(
            "unsupported scheme '{}' in '{raw}', expected http or https",
            url.scheme()
        ));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(format!("URL '{raw}' has no host"));
    }
    Ok(())
}
