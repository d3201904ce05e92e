//! Background worker: claims jobs, dispatches them to handlers, records the outcome.
//!
//! A handler error or panic never escapes the loop; it becomes a
//! `mark_failed` (transient) or `mark_dead` (policy) on the job row.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::queue::{FailureOutcome, JobQueue};
use super::types::{AsyncJob, JobPayload, JobResult, JobType};
use crate::error::StoreError;

/// Executes one job type.
///
/// Jobs can be re-delivered after a crash, so implementations must be safe
/// to run more than once for the same payload.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &AsyncJob, payload: JobPayload) -> JobResult;
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging and the `locked_by` column
    pub name: String,
    /// Jobs claimed per poll
    pub batch_size: usize,
    /// Sleep between polls when the queue is empty
    pub poll_interval: Duration,
    /// Restrict to these job types
    pub job_types: Option<Vec<JobType>>,
    /// Number of polling loops sharing this worker
    pub concurrency: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "job-worker".to_string(),
            batch_size: 10,
            poll_interval: Duration::from_secs(5),
            job_types: None,
            concurrency: 1,
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_job_types(mut self, job_types: Vec<JobType>) -> Self {
        self.job_types = Some(job_types);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_dead: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// What happened to one claimed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Execution {
    Succeeded,
    Retrying,
    Dead,
    /// The row moved under us (e.g. reclaimed after going stale); nothing recorded.
    Skipped,
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct JobWorkerHandle {
    shutdown: watch::Sender<bool>,
    loops: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl JobWorkerHandle {
    /// Request graceful shutdown and wait for in-flight batches to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.loops {
            let _ = handle.await;
        }
    }

    /// Get current worker statistics.
    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

pub struct JobWorker {
    queue: JobQueue,
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl JobWorker {
    pub fn new(queue: JobQueue) -> Self {
        Self {
            queue,
            handlers: HashMap::new(),
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    /// Register the handler for a job type (replacing any previous one).
    pub fn register_handler(&mut self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type, handler);
    }

    fn with_stats(&self, f: impl FnOnce(&mut WorkerStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }

    /// Claim one batch and execute it. Returns how many jobs were claimed.
    pub async fn run_once(&self, config: &WorkerConfig) -> Result<usize, StoreError> {
        let jobs = self
            .queue
            .claim_batch(config.job_types.as_deref(), config.batch_size, &config.name)
            .await?;
        let claimed = jobs.len();

        for job in jobs {
            debug!(
                worker = %config.name,
                job_id = %job.id,
                job_type = %job.job_type,
                attempts = job.attempts,
                "claimed job"
            );
            self.with_stats(|s| s.current_running += 1);
            let execution = self.execute(job).await;
            self.with_stats(|s| {
                s.current_running = s.current_running.saturating_sub(1);
                s.jobs_processed += 1;
                match execution {
                    Ok(Execution::Succeeded) => s.jobs_succeeded += 1,
                    Ok(Execution::Retrying) => s.jobs_failed += 1,
                    Ok(Execution::Dead) => {
                        s.jobs_failed += 1;
                        s.jobs_dead += 1;
                    }
                    Ok(Execution::Skipped) | Err(_) => {}
                }
            });
            if let Err(e) = execution {
                error!(worker = %config.name, error = %e, "failed to record job outcome");
            }
        }

        Ok(claimed)
    }

    /// Execute one already-claimed job and record its outcome.
    pub async fn execute(&self, job: AsyncJob) -> Result<Execution, StoreError> {
        let id = job.id;

        let payload = match job.payload() {
            Ok(payload) => payload,
            Err(e) => {
                self.queue.mark_dead(id, &e.to_string()).await?;
                return Ok(Execution::Dead);
            }
        };

        let Some(handler) = self.handlers.get(&job.job_type).cloned() else {
            let reason = format!("no handler registered for {}", job.job_type);
            self.queue.mark_dead(id, &reason).await?;
            return Ok(Execution::Dead);
        };

        // Run on its own task so a panicking handler is contained.
        let result = tokio::spawn(async move { handler.handle(&job, payload).await })
            .await
            .unwrap_or_else(|e| JobResult::Retry(format!("handler panicked: {e}")));

        match result {
            JobResult::Success => {
                let outcome = self.queue.mark_done(id).await?;
                Ok(if outcome.is_success() {
                    Execution::Succeeded
                } else {
                    Execution::Skipped
                })
            }
            JobResult::Retry(reason) => Ok(match self.queue.mark_failed(id, &reason).await? {
                FailureOutcome::Retrying(_) => Execution::Retrying,
                FailureOutcome::Dead(_) => Execution::Dead,
                FailureOutcome::NotProcessing => Execution::Skipped,
            }),
            JobResult::Reject(reason) => {
                let outcome = self.queue.mark_dead(id, &reason).await?;
                Ok(if outcome.is_applied() {
                    Execution::Dead
                } else {
                    Execution::Skipped
                })
            }
        }
    }

    /// Spawn `config.concurrency` polling loops on the current runtime.
    pub fn spawn(self, config: WorkerConfig) -> JobWorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let worker = Arc::new(self);

        let loops = (0..config.concurrency)
            .map(|n| {
                let worker = worker.clone();
                let mut config = config.clone();
                if config.concurrency > 1 {
                    config.name = format!("{}-{}", config.name, n);
                }
                tokio::spawn(worker_loop(worker, config, shutdown_rx.clone()))
            })
            .collect();

        JobWorkerHandle {
            shutdown: shutdown_tx,
            loops,
            stats,
        }
    }
}

async fn worker_loop(worker: Arc<JobWorker>, config: WorkerConfig, mut shutdown: watch::Receiver<bool>) {
    info!(worker = %config.name, "job worker started");
    let start_time = Instant::now();

    loop {
        if *shutdown.borrow() {
            break;
        }

        worker.with_stats(|s| s.uptime_secs = start_time.elapsed().as_secs());

        let idle = match worker.run_once(&config).await {
            Ok(claimed) => claimed == 0,
            Err(e) => {
                warn!(worker = %config.name, error = %e, "claim failed");
                true
            }
        };

        if idle {
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(config.poll_interval) => {}
            }
        }
    }

    info!(worker = %config.name, "job worker stopped");
}
