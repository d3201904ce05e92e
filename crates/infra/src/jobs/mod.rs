//! Durable background jobs with retry, backoff, and dead-lettering.
//!
//! - `JobQueue`: enqueue, claim, and the status transitions
//! - `JobStore`: persistence (memory or Postgres), claim with skip-locked semantics
//! - `JobWorker`: polls the queue and dispatches to a `JobHandler` per job type
//!
//! Jobs may run more than once (stale `processing` rows are reclaimed), so
//! handlers must be idempotent.

pub mod handlers;
pub mod postgres;
pub mod queue;
pub mod store;
pub mod types;
pub mod worker;

pub use handlers::{FulfillOrderHandler, ListingKitHandler};
pub use queue::{EnqueueError, FailureOutcome, JobQueue};
pub use store::{JobClaim, JobStore};
pub use types::{
    AsyncJob, BackoffStrategy, JobPayload, JobResult, JobStats, JobStatus, JobType, RetryPolicy,
};
pub use worker::{Execution, JobHandler, JobWorker, JobWorkerHandle, WorkerConfig, WorkerStats};
