//! Process configuration loaded from environment variables.
//!
//! Every queue timing knob (staleness windows, backoff, claim caps) lives
//! here rather than as a constant in the queue code.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::Duration;
use thiserror::Error;

use crate::jobs::types::{JobType, RetryPolicy};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Generic job queue tuning.
#[derive(Debug, Clone)]
pub struct JobQueueSettings {
    pub retry: RetryPolicy,
    /// A `processing` row whose lock is older than this is re-claimable.
    pub stale_after: Duration,
    /// Per-job-type staleness windows overriding `stale_after`.
    pub stale_overrides: HashMap<JobType, Duration>,
}

impl JobQueueSettings {
    pub fn stale_after_for(&self, job_type: JobType) -> Duration {
        self.stale_overrides
            .get(&job_type)
            .copied()
            .unwrap_or(self.stale_after)
    }
}

impl Default for JobQueueSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            stale_after: Duration::minutes(5),
            stale_overrides: HashMap::new(),
        }
    }
}

/// Print fulfillment queue tuning.
#[derive(Debug, Clone)]
pub struct PrintQueueSettings {
    /// A `claimed` job with no ack for this long is handed out again.
    pub stale_claim_after: Duration,
    /// `next_retry_at` offset stamped on every claim.
    pub retry_after: Duration,
    /// Upper bound on `claim(limit)`.
    pub max_claim: usize,
    pub download_url_ttl: Duration,
}

impl Default for PrintQueueSettings {
    fn default() -> Self {
        Self {
            stale_claim_after: Duration::minutes(10),
            retry_after: Duration::minutes(5),
            max_claim: 50,
            download_url_ttl: Duration::minutes(15),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub worker_id: String,
    pub batch_size: usize,
    pub poll_interval: StdDuration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", std::process::id()),
            batch_size: 10,
            poll_interval: StdDuration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Absent: run on the in-memory backend.
    pub database_url: Option<String>,
    pub bind_addr: String,
    /// Base used when building download URLs handed to the print worker.
    pub public_base_url: String,
    pub print_jobs_token: Option<String>,
    pub admin_token: Option<String>,
    pub webhook_secret: Option<String>,
    pub webhook_tolerance_secs: i64,
    pub payment_api_key: Option<String>,
    pub payment_api_base: String,
    pub render_service_url: Option<String>,
    /// Absent: artifacts are kept in memory.
    pub storage_root: Option<PathBuf>,
    pub render_timeout: StdDuration,
    pub price_cache_ttl: StdDuration,
    pub jobs: JobQueueSettings,
    pub print: PrintQueueSettings,
    pub worker: WorkerSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: None,
            bind_addr: "0.0.0.0:8080".to_string(),
            public_base_url: "http://localhost:8080".to_string(),
            print_jobs_token: None,
            admin_token: None,
            webhook_secret: None,
            webhook_tolerance_secs: signpost_auth::DEFAULT_TOLERANCE_SECS,
            payment_api_key: None,
            payment_api_base: "https://api.stripe.com".to_string(),
            render_service_url: None,
            storage_root: None,
            render_timeout: StdDuration::from_secs(120),
            price_cache_ttl: StdDuration::from_secs(3600),
            jobs: JobQueueSettings::default(),
            print: PrintQueueSettings::default(),
            worker: WorkerSettings::default(),
        }
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        Some(raw) => raw.parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn optional(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// `fulfill_order=600,generate_listing_kit=900` (seconds).
fn parse_stale_overrides(raw: &str) -> Result<HashMap<JobType, Duration>, ConfigError> {
    let invalid = |message: String| ConfigError::Invalid {
        key: "JOB_STALE_OVERRIDES",
        message,
    };
    let mut overrides = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, secs) = entry
            .split_once('=')
            .ok_or_else(|| invalid(format!("expected job_type=seconds, got {entry}")))?;
        let job_type = name
            .trim()
            .parse::<JobType>()
            .map_err(|e| invalid(e.to_string()))?;
        let secs = secs
            .trim()
            .parse::<i64>()
            .map_err(|e| invalid(format!("{name}: {e}")))?;
        overrides.insert(job_type, Duration::seconds(secs));
    }
    Ok(overrides)
}

impl Settings {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (tests, config files flattened to env form).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Settings::default();

        let max_attempts = parse(&lookup, "JOB_MAX_ATTEMPTS", defaults.jobs.retry.max_attempts)?;
        let base_delay_secs = parse(&lookup, "JOB_BASE_DELAY_SECS", 30_u64)?;
        let stale_after_secs = parse(&lookup, "JOB_STALE_AFTER_SECS", 300_i64)?;
        let stale_overrides = match optional(&lookup, "JOB_STALE_OVERRIDES") {
            Some(raw) => parse_stale_overrides(&raw)?,
            None => HashMap::new(),
        };

        let jobs = JobQueueSettings {
            retry: RetryPolicy {
                max_attempts,
                base_delay: StdDuration::from_secs(base_delay_secs),
                ..defaults.jobs.retry
            },
            stale_after: Duration::seconds(stale_after_secs),
            stale_overrides,
        };

        let print = PrintQueueSettings {
            stale_claim_after: Duration::seconds(parse(&lookup, "PRINT_STALE_CLAIM_SECS", 600_i64)?),
            retry_after: Duration::seconds(parse(&lookup, "PRINT_RETRY_AFTER_SECS", 300_i64)?),
            max_claim: parse(&lookup, "PRINT_CLAIM_MAX", defaults.print.max_claim)?,
            download_url_ttl: Duration::seconds(parse(&lookup, "DOWNLOAD_URL_TTL_SECS", 900_i64)?),
        };

        let worker = WorkerSettings {
            worker_id: optional(&lookup, "WORKER_ID").unwrap_or(defaults.worker.worker_id),
            batch_size: parse(&lookup, "WORKER_BATCH_SIZE", defaults.worker.batch_size)?,
            poll_interval: StdDuration::from_millis(parse(&lookup, "WORKER_POLL_MS", 5000_u64)?),
        };

        if print.max_claim == 0 {
            return Err(ConfigError::Invalid {
                key: "PRINT_CLAIM_MAX",
                message: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            database_url: optional(&lookup, "DATABASE_URL"),
            bind_addr: optional(&lookup, "BIND_ADDR").unwrap_or(defaults.bind_addr),
            public_base_url: optional(&lookup, "PUBLIC_BASE_URL").unwrap_or(defaults.public_base_url),
            print_jobs_token: optional(&lookup, "PRINT_JOBS_TOKEN"),
            admin_token: optional(&lookup, "ADMIN_TOKEN"),
            webhook_secret: optional(&lookup, "PAYMENT_WEBHOOK_SECRET"),
            webhook_tolerance_secs: parse(
                &lookup,
                "WEBHOOK_TOLERANCE_SECS",
                defaults.webhook_tolerance_secs,
            )?,
            payment_api_key: optional(&lookup, "PAYMENT_API_KEY"),
            payment_api_base: optional(&lookup, "PAYMENT_API_BASE").unwrap_or(defaults.payment_api_base),
            render_service_url: optional(&lookup, "RENDER_SERVICE_URL"),
            storage_root: optional(&lookup, "STORAGE_ROOT").map(PathBuf::from),
            render_timeout: StdDuration::from_secs(parse(&lookup, "RENDER_TIMEOUT_SECS", 120_u64)?),
            price_cache_ttl: StdDuration::from_secs(parse(&lookup, "PRICE_CACHE_TTL_SECS", 3600_u64)?),
            jobs,
            print,
            worker,
        })
    }
}
