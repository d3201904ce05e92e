//! `JobQueue`: the service façade over a [`JobStore`].

use std::sync::Arc;

use tracing::{error, info, warn};

use signpost_core::{Clock, DomainError, JobId, TransitionOutcome};

use super::store::{JobClaim, JobStore};
use super::types::{AsyncJob, JobPayload, JobStats, JobStatus, JobType};
use crate::config::JobQueueSettings;
use crate::error::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error(transparent)]
    Rejected(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Disposition of a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Re-queued; eligible again at `next_run_at`.
    Retrying(AsyncJob),
    /// Attempts exhausted; needs an operator.
    Dead(AsyncJob),
    /// The job was not in `processing` (completed elsewhere, or re-claimed).
    NotProcessing,
}

#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    settings: JobQueueSettings,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue").field("settings", &self.settings).finish()
    }
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>, settings: JobQueueSettings) -> Self {
        Self {
            store,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &JobQueueSettings {
        &self.settings
    }

    /// Enqueue an untyped `(job_type, payload)` pair.
    ///
    /// Unknown or empty job types are rejected before anything is stored.
    /// There is no dedup: callers that need it check first.
    pub async fn enqueue(
        &self,
        job_type: &str,
        payload: serde_json::Value,
    ) -> Result<JobId, EnqueueError> {
        let payload = JobPayload::from_parts(job_type, &payload)?;
        Ok(self.enqueue_payload(&payload).await?)
    }

    pub async fn enqueue_payload(&self, payload: &JobPayload) -> Result<JobId, StoreError> {
        let job = AsyncJob::new(payload, self.clock.now());
        self.store.insert_job(&job).await?;
        info!(job_id = %job.id, job_type = %job.job_type, "job enqueued");
        Ok(job.id)
    }

    /// Claim up to `limit` ready jobs for `worker_id`.
    pub async fn claim_batch(
        &self,
        job_types: Option<&[JobType]>,
        limit: usize,
        worker_id: &str,
    ) -> Result<Vec<AsyncJob>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let claim = JobClaim {
            job_types: job_types.map(|t| t.to_vec()),
            limit,
            worker_id: worker_id.to_string(),
            now: self.clock.now(),
            stale_after: self.settings.stale_after,
            stale_overrides: self.settings.stale_overrides.clone(),
            max_attempts: self.settings.retry.max_attempts,
        };
        self.store.claim_jobs(&claim).await
    }

    /// processing -> done. Calling twice is a no-op.
    pub async fn mark_done(&self, id: JobId) -> Result<TransitionOutcome, StoreError> {
        let outcome = self.store.complete_job(id, self.clock.now()).await?;
        if let TransitionOutcome::Rejected { current } = &outcome {
            warn!(job_id = %id, current = %current, "mark_done ignored");
        }
        Ok(outcome)
    }

    /// Record a failed attempt and schedule the retry (or bury the job).
    pub async fn mark_failed(&self, id: JobId, error: &str) -> Result<FailureOutcome, StoreError> {
        let updated = self
            .store
            .fail_job(id, error, &self.settings.retry, self.clock.now())
            .await?;

        Ok(match updated {
            Some(job) if job.status == JobStatus::Dead => {
                error!(
                    job_id = %id,
                    job_type = %job.job_type,
                    attempts = job.attempts,
                    error = %error,
                    "job exhausted retries"
                );
                FailureOutcome::Dead(job)
            }
            Some(job) => {
                warn!(
                    job_id = %id,
                    job_type = %job.job_type,
                    attempts = job.attempts,
                    next_run_at = ?job.next_run_at,
                    error = %error,
                    "job failed; retry scheduled"
                );
                FailureOutcome::Retrying(job)
            }
            None => FailureOutcome::NotProcessing,
        })
    }

    /// Bury a job without retry (policy rejection).
    pub async fn mark_dead(&self, id: JobId, error: &str) -> Result<TransitionOutcome, StoreError> {
        let outcome = self.store.bury_job(id, error, self.clock.now()).await?;
        if outcome.is_applied() {
            warn!(job_id = %id, error = %error, "job rejected");
        }
        Ok(outcome)
    }

    /// Operator retry: dead | failed -> queued with a fresh attempt budget.
    pub async fn retry(&self, id: JobId) -> Result<TransitionOutcome, StoreError> {
        let outcome = self.store.requeue_job(id, self.clock.now()).await?;
        if outcome.is_applied() {
            info!(job_id = %id, "job manually re-queued");
        }
        Ok(outcome)
    }

    pub async fn get(&self, id: JobId) -> Result<Option<AsyncJob>, StoreError> {
        self.store.get_job(id).await
    }

    pub async fn list(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<AsyncJob>, StoreError> {
        self.store.list_jobs(status, limit).await
    }

    pub async fn stats(&self) -> Result<JobStats, StoreError> {
        self.store.job_stats().await
    }
}
