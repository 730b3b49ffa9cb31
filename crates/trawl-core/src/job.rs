use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::domain_of;
use crate::error::AppError;

/// Status of a scrape job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    PartiallyCompleted,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::PartiallyCompleted => "partially_completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::PartiallyCompleted
                | JobStatus::Failed
                | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "partially_completed" => Ok(JobStatus::PartiallyCompleted),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// Kind of data a target is expected to yield.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    JobListing,
    MemberClub,
    SupportResource,
    GeneralData,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::JobListing => "job_listing",
            DataType::MemberClub => "member_club",
            DataType::SupportResource => "support_resource",
            DataType::GeneralData => "general_data",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "job_listing" => Ok(DataType::JobListing),
            "member_club" => Ok(DataType::MemberClub),
            "support_resource" => Ok(DataType::SupportResource),
            "general_data" => Ok(DataType::GeneralData),
            _ => Err(format!("Unknown data type: {}", s)),
        }
    }
}

/// Token-bucket parameters: `requests` per `window`, with `burst` capacity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimit {
    pub requests: u32,
    #[serde(with = "millis", rename = "window_ms")]
    pub window: Duration,
    pub burst: u32,
}

impl RateLimit {
    pub fn new(requests: u32, window: Duration, burst: u32) -> Self {
        Self {
            requests,
            window,
            burst,
        }
    }

    /// Refill rate in tokens per second.
    pub fn per_second(&self) -> f64 {
        let secs = self.window.as_secs_f64();
        if secs <= 0.0 {
            return f64::from(self.requests);
        }
        f64::from(self.requests) / secs
    }

    /// Bucket capacity; a zero burst still admits one request.
    pub fn capacity(&self) -> f64 {
        f64::from(self.burst.max(1))
    }
}

impl Default for RateLimit {
    /// 60 requests per minute with a burst of 10.
    fn default() -> Self {
        Self {
            requests: 60,
            window: Duration::from_secs(60),
            burst: 10,
        }
    }
}

/// Per-job scraping configuration. Immutable once the job starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapingConfig {
    /// Minimum spacing between two requests issued to the same domain.
    #[serde(with = "millis", rename = "delay_between_requests_ms")]
    pub delay_between_requests: Duration,
    /// Attempts per strategy run.
    pub max_retries: u32,
    /// Per-attempt timeout.
    #[serde(with = "millis", rename = "timeout_ms")]
    pub timeout: Duration,
    pub rate_limit: RateLimit,
    pub use_proxy: bool,
    pub javascript_enabled: bool,
    pub headers: BTreeMap<String, String>,
    pub user_agent: Option<String>,
    /// Overall deadline for the job, measured from start.
    #[serde(with = "opt_millis", rename = "deadline_ms")]
    pub deadline: Option<Duration>,
}

impl Default for ScrapingConfig {
    fn default() -> Self {
        Self {
            delay_between_requests: Duration::from_secs(1),
            max_retries: 3,
            timeout: Duration::from_secs(30),
            rate_limit: RateLimit::default(),
            use_proxy: false,
            javascript_enabled: false,
            headers: BTreeMap::new(),
            user_agent: None,
            deadline: None,
        }
    }
}

impl ScrapingConfig {
    /// The configuration a single target runs with, after applying its
    /// overrides. Rate limits are domain-scoped and never overridden.
    pub fn effective_for(&self, target: &Target) -> ScrapingConfig {
        let mut config = self.clone();
        if let Some(o) = &target.overrides {
            if let Some(max_retries) = o.max_retries {
                config.max_retries = max_retries;
            }
            if let Some(timeout) = o.timeout {
                config.timeout = timeout;
            }
            if let Some(js) = o.javascript_enabled {
                config.javascript_enabled = js;
            }
            if let Some(proxy) = o.use_proxy {
                config.use_proxy = proxy;
            }
            config
                .headers
                .extend(o.headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        config
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimit) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_between_requests = delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_javascript(mut self, enabled: bool) -> Self {
        self.javascript_enabled = enabled;
        self
    }
}

/// Per-target configuration overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetOverrides {
    pub max_retries: Option<u32>,
    #[serde(with = "opt_millis", rename = "timeout_ms")]
    pub timeout: Option<Duration>,
    pub javascript_enabled: Option<bool>,
    pub use_proxy: Option<bool>,
    pub headers: BTreeMap<String, String>,
}

/// Named CSS selectors. Opaque to the engine; strategies interpret them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionSpec {
    pub selectors: BTreeMap<String, String>,
}

/// A single URL to scrape within a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub url: String,
    pub data_type: DataType,
    #[serde(default)]
    pub extraction: ExtractionSpec,
    /// Pins a single strategy by name and disables fallback.
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub overrides: Option<TargetOverrides>,
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
}

impl Target {
    pub fn new(url: impl Into<String>, data_type: DataType) -> Self {
        Self {
            url: url.into(),
            data_type,
            extraction: ExtractionSpec::default(),
            strategy: None,
            overrides: None,
            cookies: BTreeMap::new(),
        }
    }

    pub fn with_selector(mut self, field: impl Into<String>, css: impl Into<String>) -> Self {
        self.extraction.selectors.insert(field.into(), css.into());
        self
    }

    pub fn with_strategy(mut self, name: impl Into<String>) -> Self {
        self.strategy = Some(name.into());
        self
    }

    pub fn with_overrides(mut self, overrides: TargetOverrides) -> Self {
        self.overrides = Some(overrides);
        self
    }

    /// Host component of the URL, lowercased. `None` for malformed URLs.
    pub fn domain(&self) -> Option<String> {
        domain_of(&self.url)
    }
}

/// A scrape job: an ordered list of targets sharing one configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub targets: Vec<Target>,
    pub config: ScrapingConfig,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(name: impl Into<String>, targets: Vec<Target>, config: ScrapingConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            targets,
            config,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Pending → Running.
    pub fn start(&mut self) -> Result<(), AppError> {
        if self.status != JobStatus::Pending {
            return Err(AppError::ValidationError(format!(
                "Cannot start job {} in {} status",
                self.id, self.status
            )));
        }
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Running → terminal status.
    pub fn finish(&mut self, status: JobStatus) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    pub fn duration(&self) -> Option<TimeDelta> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::PartiallyCompleted,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            let s = status.as_str();
            let parsed: JobStatus = s.parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::PartiallyCompleted.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_default_config_matches_documented_defaults() {
        let config = ScrapingConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.delay_between_requests, Duration::from_secs(1));
        assert_eq!(config.rate_limit.per_second(), 1.0);
        assert_eq!(config.rate_limit.capacity(), 10.0);
    }

    #[test]
    fn test_config_deserializes_millisecond_fields() {
        let config: ScrapingConfig = serde_json::from_value(serde_json::json!({
            "timeout_ms": 1500,
            "deadline_ms": 60000,
            "rate_limit": {"requests": 2, "window_ms": 1000, "burst": 2}
        }))
        .unwrap();

        assert_eq!(config.timeout, Duration::from_millis(1500));
        assert_eq!(config.deadline, Some(Duration::from_secs(60)));
        assert_eq!(config.rate_limit.per_second(), 2.0);
        // Unspecified fields fall back to defaults.
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_target_overrides_apply_on_top_of_job_config() {
        let mut job_config = ScrapingConfig::default();
        job_config
            .headers
            .insert("Accept-Language".into(), "en".into());

        let target = Target::new("https://example.com", DataType::GeneralData).with_overrides(
            TargetOverrides {
                max_retries: Some(7),
                javascript_enabled: Some(true),
                headers: BTreeMap::from([("X-Token".to_string(), "abc".to_string())]),
                ..Default::default()
            },
        );

        let effective = job_config.effective_for(&target);
        assert_eq!(effective.max_retries, 7);
        assert!(effective.javascript_enabled);
        assert_eq!(effective.timeout, job_config.timeout);
        assert_eq!(effective.headers.len(), 2);
    }

    #[test]
    fn test_zero_burst_still_admits_one() {
        let limit = RateLimit::new(5, Duration::from_secs(1), 0);
        assert_eq!(limit.capacity(), 1.0);
    }

    #[test]
    fn test_job_start_only_from_pending() {
        let mut job = Job::new("jobs", vec![], ScrapingConfig::default());
        job.start().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.started_at.is_some());
        assert!(matches!(job.start(), Err(AppError::ValidationError(_))));

        job.finish(JobStatus::Completed);
        assert!(job.finished_at.is_some());
        assert!(job.duration().is_some());
    }

    #[test]
    fn test_target_domain_is_lowercased_host() {
        let target = Target::new("https://Jobs.Example.COM:8443/list?page=2", DataType::JobListing);
        assert_eq!(target.domain().as_deref(), Some("jobs.example.com"));
        assert_eq!(Target::new("not a url", DataType::GeneralData).domain(), None);
    }
}
