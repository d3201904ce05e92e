//! Core job types and policies.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use signpost_core::{DomainError, JobId, OrderId};

/// Known job types. Anything else is rejected at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    FulfillOrder,
    GenerateListingKit,
}

impl JobType {
    pub const ALL: [JobType; 2] = [JobType::FulfillOrder, JobType::GenerateListingKit];

    pub const fn as_str(&self) -> &'static str {
        match self {
            JobType::FulfillOrder => "fulfill_order",
            JobType::GenerateListingKit => "generate_listing_kit",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Err(DomainError::validation("job_type must not be empty")),
            "fulfill_order" => Ok(JobType::FulfillOrder),
            "generate_listing_kit" => Ok(JobType::GenerateListingKit),
            other => Err(DomainError::policy(format!("unknown job_type: {other}"))),
        }
    }
}

/// Typed job payload, one variant per job type.
///
/// Stored at rest as the JSON object without the tag; the tag lives in the
/// `job_type` column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "job_type", rename_all = "snake_case")]
pub enum JobPayload {
    FulfillOrder {
        order_id: OrderId,
    },
    GenerateListingKit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kit_id: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        order_id: Option<OrderId>,
    },
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::FulfillOrder { .. } => JobType::FulfillOrder,
            JobPayload::GenerateListingKit { .. } => JobType::GenerateListingKit,
        }
    }

    /// Parse an untyped `(job_type, payload)` pair.
    pub fn from_parts(job_type: &str, payload: &serde_json::Value) -> Result<Self, DomainError> {
        let job_type: JobType = job_type.parse()?;
        let mut object = match payload {
            serde_json::Value::Object(map) => map.clone(),
            serde_json::Value::Null => serde_json::Map::new(),
            _ => return Err(DomainError::validation("job payload must be a JSON object")),
        };
        object.insert(
            "job_type".to_string(),
            serde_json::Value::String(job_type.as_str().to_string()),
        );
        let parsed: JobPayload = serde_json::from_value(serde_json::Value::Object(object))
            .map_err(|e| DomainError::validation(format!("invalid {job_type} payload: {e}")))?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Payload body as stored (tag stripped).
    pub fn body(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let serde_json::Value::Object(map) = &mut value {
            map.remove("job_type");
        }
        value
    }

    fn validate(&self) -> Result<(), DomainError> {
        match self {
            JobPayload::GenerateListingKit {
                kit_id: None,
                order_id: None,
            } => Err(DomainError::validation(
                "generate_listing_kit requires kit_id or order_id",
            )),
            _ => Ok(()),
        }
    }
}

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be picked up (possibly delayed by `next_run_at`).
    Queued,
    /// Claimed by a worker.
    Processing,
    /// Completed successfully (terminal).
    Done,
    /// Failed; re-claimable while attempts remain.
    Failed,
    /// Exhausted retries or rejected by policy (terminal).
    Dead,
}

impl JobStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Dead)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            "dead" => Ok(JobStatus::Dead),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^attempts
    #[default]
    Exponential,
}

/// Retry policy configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts allowed before a job goes dead.
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(6 * 3600),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Delay before the next run of a job that has been attempted `attempts` times.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 2_u32.checked_pow(attempts).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }

    /// Check if more retries are allowed.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// `now + delay_for_attempt(attempts)`.
    pub fn next_run_at(&self, attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.delay_for_attempt(attempts);
        now + chrono::Duration::milliseconds(delay.as_millis().min(i64::MAX as u128) as i64)
    }
}

/// A row of the generic job queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncJob {
    pub id: JobId,
    pub job_type: JobType,
    /// Opaque body; decode with [`AsyncJob::payload`].
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AsyncJob {
    /// A freshly-enqueued job.
    pub fn new(payload: &JobPayload, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            job_type: payload.job_type(),
            payload: payload.body(),
            status: JobStatus::Queued,
            attempts: 0,
            last_error: None,
            locked_at: None,
            locked_by: None,
            next_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn payload(&self) -> Result<JobPayload, DomainError> {
        JobPayload::from_parts(self.job_type.as_str(), &self.payload)
    }

    /// Whether a claim at `now` may take this row.
    pub fn is_claimable(&self, now: DateTime<Utc>, stale_after: chrono::Duration, max_attempts: u32) -> bool {
        let due = self.next_run_at.is_none_or(|at| at <= now);
        match self.status {
            JobStatus::Queued => due,
            JobStatus::Processing => self.locked_at.is_some_and(|at| at < now - stale_after),
            JobStatus::Failed => self.attempts < max_attempts && self.next_run_at.is_some_and(|at| at <= now),
            JobStatus::Done | JobStatus::Dead => false,
        }
    }

    /// Apply a claim: processing, locked now, one more attempt.
    pub fn mark_claimed(&mut self, worker_id: &str, now: DateTime<Utc>) {
        self.status = JobStatus::Processing;
        self.locked_at = Some(now);
        self.locked_by = Some(worker_id.to_string());
        self.attempts += 1;
        self.next_run_at = None;
        self.updated_at = now;
    }

    /// Apply a failure of the current attempt under `policy`.
    pub fn mark_failed(&mut self, error: &str, policy: &RetryPolicy, now: DateTime<Utc>) {
        self.last_error = Some(signpost_core::truncate_error(error));
        self.locked_at = None;
        self.locked_by = None;
        self.updated_at = now;
        if policy.should_retry(self.attempts) {
            self.status = JobStatus::Queued;
            self.next_run_at = Some(policy.next_run_at(self.attempts, now));
        } else {
            self.status = JobStatus::Dead;
            self.next_run_at = None;
        }
    }
}

/// Result of a job handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Success,
    /// Transient failure; retry with backoff.
    Retry(String),
    /// Policy rejection; never retried automatically.
    Reject(String),
}

/// Counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub queued: usize,
    pub processing: usize,
    pub done: usize,
    pub failed: usize,
    pub dead: usize,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus, count: usize) {
        match status {
            JobStatus::Queued => self.queued += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Done => self.done += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::Dead => self.dead += count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn exponential_backoff_doubles_from_base() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(120));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(240));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(480));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
        assert!(!policy.should_retry(6));
    }

    #[test]
    fn unknown_job_type_is_a_policy_violation() {
        assert!(matches!(
            "send_fax".parse::<JobType>(),
            Err(DomainError::PolicyViolation(_))
        ));
        assert!(matches!("".parse::<JobType>(), Err(DomainError::Validation(_))));
    }

    #[test]
    fn payload_parses_from_untyped_parts() {
        let payload =
            JobPayload::from_parts("fulfill_order", &serde_json::json!({"order_id": 42})).unwrap();
        assert_eq!(
            payload,
            JobPayload::FulfillOrder {
                order_id: OrderId::new(42)
            }
        );
        assert_eq!(payload.body(), serde_json::json!({"order_id": 42}));
    }

    #[test]
    fn listing_kit_payload_needs_an_identifier() {
        assert!(JobPayload::from_parts("generate_listing_kit", &serde_json::json!({})).is_err());
        assert!(
            JobPayload::from_parts("generate_listing_kit", &serde_json::json!({"kit_id": 3})).is_ok()
        );
    }

    #[test]
    fn job_lifecycle_retries_then_dies() {
        let now = Utc::now();
        let policy = RetryPolicy::default();
        let mut job = AsyncJob::new(&JobPayload::FulfillOrder { order_id: OrderId::new(1) }, now);

        for attempt in 1..=4 {
            job.mark_claimed("w", now);
            assert_eq!(job.attempts, attempt);
            job.mark_failed("boom", &policy, now);
            assert_eq!(job.status, JobStatus::Queued);
            assert_eq!(
                job.next_run_at,
                Some(now + chrono::Duration::seconds(30 * 2_i64.pow(attempt)))
            );
        }

        job.mark_claimed("w", now);
        job.mark_failed("boom", &policy, now);
        assert_eq!(job.status, JobStatus::Dead);
        assert_eq!(job.next_run_at, None);
        assert_eq!(job.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn stale_processing_rows_become_claimable() {
        let now = Utc::now();
        let mut job = AsyncJob::new(&JobPayload::FulfillOrder { order_id: OrderId::new(1) }, now);
        job.mark_claimed("w", now);

        let window = chrono::Duration::minutes(5);
        assert!(!job.is_claimable(now + chrono::Duration::minutes(4), window, 5));
        assert!(job.is_claimable(now + chrono::Duration::minutes(6), window, 5));
    }

    proptest! {
        #[test]
        fn backoff_never_decreases(attempts in 0u32..40) {
            let policy = RetryPolicy::default();
            prop_assert!(policy.delay_for_attempt(attempts) <= policy.delay_for_attempt(attempts + 1));
            prop_assert!(policy.delay_for_attempt(attempts) <= policy.max_delay);
        }
    }
}
