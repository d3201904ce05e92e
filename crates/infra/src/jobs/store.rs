//! Job storage: the `JobStore` trait and its in-memory implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use signpost_core::{JobId, TransitionOutcome};

use super::types::{AsyncJob, JobStats, JobStatus, JobType, RetryPolicy};
use crate::claim::{Versioned, claim_versioned};
use crate::db::MemoryStore;
use crate::db::memory::{read, write};
use crate::error::StoreError;

/// Parameters of one `claim_batch` call.
#[derive(Debug, Clone)]
pub struct JobClaim {
    /// Restrict to these types; `None` claims any type.
    pub job_types: Option<Vec<JobType>>,
    pub limit: usize,
    pub worker_id: String,
    pub now: DateTime<Utc>,
    pub stale_after: Duration,
    pub stale_overrides: HashMap<JobType, Duration>,
    pub max_attempts: u32,
}

impl JobClaim {
    pub fn stale_after_for(&self, job_type: JobType) -> Duration {
        self.stale_overrides
            .get(&job_type)
            .copied()
            .unwrap_or(self.stale_after)
    }

    fn wants(&self, job: &AsyncJob) -> bool {
        self.job_types
            .as_ref()
            .is_none_or(|types| types.contains(&job.job_type))
            && job.is_claimable(self.now, self.stale_after_for(job.job_type), self.max_attempts)
    }
}

/// Job store abstraction.
///
/// Every mutation is a single conditional write: the precondition names the
/// allowed source states, and the result says whether it applied.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: &AsyncJob) -> Result<(), StoreError>;

    /// Atomically claim up to `claim.limit` ready jobs.
    async fn claim_jobs(&self, claim: &JobClaim) -> Result<Vec<AsyncJob>, StoreError>;

    /// processing -> done.
    async fn complete_job(&self, id: JobId, now: DateTime<Utc>)
    -> Result<TransitionOutcome, StoreError>;

    /// processing -> queued (with backoff) or dead. `None` if the job was not processing.
    async fn fail_job(
        &self,
        id: JobId,
        error: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<AsyncJob>, StoreError>;

    /// Any non-terminal state -> dead, without further retries.
    async fn bury_job(
        &self,
        id: JobId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError>;

    /// dead | failed -> queued with a fresh attempt budget.
    async fn requeue_job(&self, id: JobId, now: DateTime<Utc>)
    -> Result<TransitionOutcome, StoreError>;

    async fn get_job(&self, id: JobId) -> Result<Option<AsyncJob>, StoreError>;

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<AsyncJob>, StoreError>;

    async fn job_stats(&self) -> Result<JobStats, StoreError>;
}

fn outcome_for(
    job: Option<&mut Versioned<AsyncJob>>,
    allowed: &[JobStatus],
    target: JobStatus,
    apply: impl FnOnce(&mut AsyncJob),
) -> TransitionOutcome {
    let Some(entry) = job else {
        return TransitionOutcome::NotFound;
    };
    if allowed.contains(&entry.row.status) {
        entry.update(apply);
        TransitionOutcome::Applied
    } else if entry.row.status == target {
        TransitionOutcome::AlreadyApplied
    } else {
        TransitionOutcome::rejected(entry.row.status.as_str())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_job(&self, job: &AsyncJob) -> Result<(), StoreError> {
        let mut jobs = write(&self.jobs)?;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::Conflict(format!("job already exists: {}", job.id)));
        }
        jobs.insert(job.id, Versioned::new(job.clone()));
        Ok(())
    }

    async fn claim_jobs(&self, claim: &JobClaim) -> Result<Vec<AsyncJob>, StoreError> {
        claim_versioned(
            &self.jobs,
            claim.limit,
            |job| claim.wants(job),
            // next_run_at ascending with nulls first, then created_at, then id.
            |job| (job.next_run_at.is_some(), job.next_run_at, job.created_at, job.id),
            |job| job.mark_claimed(&claim.worker_id, claim.now),
        )
    }

    async fn complete_job(
        &self,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut jobs = write(&self.jobs)?;
        Ok(outcome_for(
            jobs.get_mut(&id),
            &[JobStatus::Processing],
            JobStatus::Done,
            |job| {
                job.status = JobStatus::Done;
                job.locked_at = None;
                job.locked_by = None;
                job.updated_at = now;
            },
        ))
    }

    async fn fail_job(
        &self,
        id: JobId,
        error: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<AsyncJob>, StoreError> {
        let mut jobs = write(&self.jobs)?;
        match jobs.get_mut(&id) {
            Some(entry) if entry.row.status == JobStatus::Processing => {
                entry.update(|job| job.mark_failed(error, policy, now));
                Ok(Some(entry.row.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn bury_job(
        &self,
        id: JobId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut jobs = write(&self.jobs)?;
        Ok(outcome_for(
            jobs.get_mut(&id),
            &[JobStatus::Queued, JobStatus::Processing, JobStatus::Failed],
            JobStatus::Dead,
            |job| {
                job.status = JobStatus::Dead;
                job.last_error = Some(signpost_core::truncate_error(error));
                job.locked_at = None;
                job.locked_by = None;
                job.next_run_at = None;
                job.updated_at = now;
            },
        ))
    }

    async fn requeue_job(
        &self,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut jobs = write(&self.jobs)?;
        Ok(outcome_for(
            jobs.get_mut(&id),
            &[JobStatus::Dead, JobStatus::Failed],
            JobStatus::Queued,
            |job| {
                job.status = JobStatus::Queued;
                job.attempts = 0;
                job.next_run_at = None;
                job.updated_at = now;
            },
        ))
    }

    async fn get_job(&self, id: JobId) -> Result<Option<AsyncJob>, StoreError> {
        Ok(read(&self.jobs)?.get(&id).map(|v| v.row.clone()))
    }

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<AsyncJob>, StoreError> {
        let jobs = read(&self.jobs)?;
        let mut result: Vec<_> = jobs
            .values()
            .map(|v| &v.row)
            .filter(|j| status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();

        result.sort_by_key(|j| j.created_at);
        result.truncate(limit);
        Ok(result)
    }

    async fn job_stats(&self) -> Result<JobStats, StoreError> {
        let jobs = read(&self.jobs)?;
        let mut stats = JobStats::default();
        for entry in jobs.values() {
            stats.record(entry.row.status, 1);
        }
        Ok(stats)
    }
}
