use async_trait::async_trait;
use chrono::{DateTime, Utc};

use signpost_core::{OrderId, OrderStatus, PrintJobId, TransitionOutcome};

use super::types::{ClaimedPrintJob, PrintClaim, PrintJob, PrintJobStatus};
use crate::claim::{Versioned, claim_versioned};
use crate::db::MemoryStore;
use crate::db::memory::{read, write};
use crate::error::StoreError;

/// Print job persistence.
#[async_trait]
pub trait PrintJobStore: Send + Sync {
    /// Insert unless a job with the same idempotency key exists.
    ///
    /// Returns `false` (and writes nothing) on an idempotency-key conflict.
    async fn insert_print_job(&self, job: &PrintJob) -> Result<bool, StoreError>;

    async fn find_print_job_by_key(&self, key: &str) -> Result<Option<PrintJob>, StoreError>;

    async fn get_print_job(&self, id: PrintJobId) -> Result<Option<PrintJob>, StoreError>;

    async fn print_jobs_for_order(&self, order_id: OrderId) -> Result<Vec<PrintJob>, StoreError>;

    /// Atomically claim up to `claim.limit` ready jobs.
    async fn claim_print_jobs(&self, claim: &PrintClaim)
    -> Result<Vec<ClaimedPrintJob>, StoreError>;

    /// queued | claimed -> downloaded.
    async fn mark_print_job_downloaded(
        &self,
        id: PrintJobId,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError>;

    /// queued | claimed | downloaded -> printed, and the owning order -> fulfilled,
    /// in one unit of work.
    async fn mark_print_job_printed(
        &self,
        id: PrintJobId,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError>;

    /// Any non-terminal state -> cancelled.
    async fn cancel_print_job(
        &self,
        id: PrintJobId,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError>;
}

fn transition(
    entry: Option<&mut Versioned<PrintJob>>,
    allowed: &[PrintJobStatus],
    already: &[PrintJobStatus],
    apply: impl FnOnce(&mut PrintJob),
) -> TransitionOutcome {
    match entry {
        None => TransitionOutcome::NotFound,
        Some(entry) if allowed.contains(&entry.row.status) => {
            entry.update(apply);
            TransitionOutcome::Applied
        }
        Some(entry) if already.contains(&entry.row.status) => TransitionOutcome::AlreadyApplied,
        Some(entry) => TransitionOutcome::rejected(entry.row.status.as_str()),
    }
}

#[async_trait]
impl PrintJobStore for MemoryStore {
    async fn insert_print_job(&self, job: &PrintJob) -> Result<bool, StoreError> {
        let mut jobs = write(&self.print_jobs)?;
        if jobs
            .values()
            .any(|v| v.row.idempotency_key == job.idempotency_key)
        {
            return Ok(false);
        }
        if jobs.contains_key(&job.job_id) {
            return Err(StoreError::Conflict(format!("print job exists: {}", job.job_id)));
        }
        jobs.insert(job.job_id, Versioned::new(job.clone()));
        Ok(true)
    }

    async fn find_print_job_by_key(&self, key: &str) -> Result<Option<PrintJob>, StoreError> {
        Ok(read(&self.print_jobs)?
            .values()
            .find(|v| v.row.idempotency_key == key)
            .map(|v| v.row.clone()))
    }

    async fn get_print_job(&self, id: PrintJobId) -> Result<Option<PrintJob>, StoreError> {
        Ok(read(&self.print_jobs)?.get(&id).map(|v| v.row.clone()))
    }

    async fn print_jobs_for_order(&self, order_id: OrderId) -> Result<Vec<PrintJob>, StoreError> {
        let mut jobs: Vec<PrintJob> = read(&self.print_jobs)?
            .values()
            .filter(|v| v.row.order_id == order_id)
            .map(|v| v.row.clone())
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn claim_print_jobs(
        &self,
        claim: &PrintClaim,
    ) -> Result<Vec<ClaimedPrintJob>, StoreError> {
        let jobs = claim_versioned(
            &self.print_jobs,
            claim.limit,
            |job| job.is_claimable(claim.now, claim.stale_claim_after),
            |job| (job.created_at, job.job_id),
            |job| job.mark_claimed(claim.now, claim.retry_after),
        )?;

        let orders = read(&self.orders)?;
        Ok(jobs
            .into_iter()
            .map(|job| {
                let product = orders
                    .get(&job.order_id)
                    .map(|o| o.product.clone())
                    .unwrap_or_default();
                ClaimedPrintJob { job, product }
            })
            .collect())
    }

    async fn mark_print_job_downloaded(
        &self,
        id: PrintJobId,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut jobs = write(&self.print_jobs)?;
        Ok(transition(
            jobs.get_mut(&id),
            &[PrintJobStatus::Queued, PrintJobStatus::Claimed],
            &[PrintJobStatus::Downloaded, PrintJobStatus::Printed],
            |job| {
                job.status = PrintJobStatus::Downloaded;
                job.downloaded_at = Some(now);
                job.next_retry_at = None;
                job.updated_at = now;
            },
        ))
    }

    async fn mark_print_job_printed(
        &self,
        id: PrintJobId,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        // Lock order: print_jobs, then orders. Both guards are held until the
        // end so the two-row update is observed as one.
        let mut jobs = write(&self.print_jobs)?;
        let mut orders = write(&self.orders)?;

        let outcome = transition(
            jobs.get_mut(&id),
            &[
                PrintJobStatus::Queued,
                PrintJobStatus::Claimed,
                PrintJobStatus::Downloaded,
            ],
            &[PrintJobStatus::Printed],
            |job| {
                job.status = PrintJobStatus::Printed;
                job.printed_at = Some(now);
                job.next_retry_at = None;
                job.updated_at = now;
            },
        );

        if outcome.is_applied() {
            let order_id = jobs.get(&id).map(|v| v.row.order_id);
            if let Some(order) = order_id.and_then(|oid| orders.get_mut(&oid)) {
                if order.status != OrderStatus::Fulfilled {
                    order.status = OrderStatus::Fulfilled;
                    order.fulfilled_at = Some(now);
                    order.updated_at = now;
                }
            }
        }
        Ok(outcome)
    }

    async fn cancel_print_job(
        &self,
        id: PrintJobId,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut jobs = write(&self.print_jobs)?;
        Ok(transition(
            jobs.get_mut(&id),
            &[
                PrintJobStatus::Queued,
                PrintJobStatus::Claimed,
                PrintJobStatus::Downloaded,
            ],
            &[PrintJobStatus::Cancelled],
            |job| {
                job.status = PrintJobStatus::Cancelled;
                job.next_retry_at = None;
                job.updated_at = now;
            },
        ))
    }
}
