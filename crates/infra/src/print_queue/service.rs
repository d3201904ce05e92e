//! `PrintQueue`: the operations behind the print-worker HTTP surface.
//!
//! The consumer is an external process, so every call here is a discrete,
//! independently authenticated request rather than a pull loop.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use signpost_auth::{AuthError, DownloadUrlSigner};
use signpost_core::{Clock, Order, OrderId, PrintJobId, ProductMetadata, TransitionOutcome};

use super::store::PrintJobStore;
use super::types::{PrintClaim, PrintJob};
use crate::config::PrintQueueSettings;
use crate::error::StoreError;
use crate::storage::{BlobStore, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum PrintQueueError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// What a print worker receives per claimed job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrintJobView {
    pub job_id: PrintJobId,
    pub order_id: OrderId,
    pub download_url: String,
    pub shipping_json: serde_json::Value,
    pub product_metadata: ProductMetadata,
    pub attempts: u32,
}

#[derive(Clone)]
pub struct PrintQueue {
    store: Arc<dyn PrintJobStore>,
    blobs: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    signer: DownloadUrlSigner,
    public_base_url: String,
    settings: PrintQueueSettings,
}

impl std::fmt::Debug for PrintQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrintQueue")
            .field("public_base_url", &self.public_base_url)
            .field("settings", &self.settings)
            .finish()
    }
}

/// Path of the artifact endpoint for `job_id`.
pub fn download_path(job_id: PrintJobId) -> String {
    format!("/api/print-jobs/{job_id}/pdf")
}

impl PrintQueue {
    pub fn new(
        store: Arc<dyn PrintJobStore>,
        blobs: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
        signer: DownloadUrlSigner,
        public_base_url: impl Into<String>,
        settings: PrintQueueSettings,
    ) -> Self {
        Self {
            store,
            blobs,
            clock,
            signer,
            public_base_url: public_base_url.into(),
            settings,
        }
    }

    pub fn settings(&self) -> &PrintQueueSettings {
        &self.settings
    }

    /// Create the print job for `order_id`, or return the one that exists.
    ///
    /// The artifact is copied to a job-scoped key before the insert. When a
    /// concurrent caller wins the insert, the copy is removed and the
    /// winner's id is returned.
    pub async fn create(
        &self,
        order_id: OrderId,
        shipping: serde_json::Value,
        artifact_key: &str,
    ) -> Result<PrintJobId, PrintQueueError> {
        let key = Order::print_idempotency_key_for(order_id);
        if let Some(existing) = self.store.find_print_job_by_key(&key).await? {
            info!(order_id = %order_id, job_id = %existing.job_id, "print job already exists");
            return Ok(existing.job_id);
        }

        let job = PrintJob::new(order_id, shipping, self.clock.now());
        let bytes = self.blobs.copy(artifact_key, &job.filename).await?;

        if self.store.insert_print_job(&job).await? {
            info!(order_id = %order_id, job_id = %job.job_id, bytes, "print job queued");
            return Ok(job.job_id);
        }

        if let Err(err) = self.blobs.delete(&job.filename).await {
            warn!(key = %job.filename, error = %err, "failed to remove orphaned print artifact");
        }
        let winner = self.store.find_print_job_by_key(&key).await?.ok_or_else(|| {
            StoreError::Backend(format!("print job for {key} vanished after conflict"))
        })?;
        info!(order_id = %order_id, job_id = %winner.job_id, "lost print job create race");
        Ok(winner.job_id)
    }

    /// Claim up to `limit` jobs (capped at the configured maximum).
    pub async fn claim(&self, limit: usize) -> Result<Vec<PrintJobView>, PrintQueueError> {
        let limit = limit.min(self.settings.max_claim);
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let claim = PrintClaim {
            limit,
            now,
            stale_claim_after: self.settings.stale_claim_after,
            retry_after: self.settings.retry_after,
        };
        let claimed = self.store.claim_print_jobs(&claim).await?;

        let mut views = Vec::with_capacity(claimed.len());
        for c in claimed {
            let download_url =
                self.signer
                    .sign(&self.public_base_url, &download_path(c.job.job_id), now)?;
            views.push(PrintJobView {
                job_id: c.job.job_id,
                order_id: c.job.order_id,
                download_url,
                shipping_json: c.job.shipping_json,
                product_metadata: c.product,
                attempts: c.job.attempts,
            });
        }
        if !views.is_empty() {
            info!(count = views.len(), "print jobs claimed");
        }
        Ok(views)
    }

    pub async fn ack_downloaded(&self, id: PrintJobId) -> Result<TransitionOutcome, StoreError> {
        let outcome = self.store.mark_print_job_downloaded(id, self.clock.now()).await?;
        log_ack("downloaded", id, &outcome);
        Ok(outcome)
    }

    /// Mark printed and fulfil the owning order.
    pub async fn ack_printed(&self, id: PrintJobId) -> Result<TransitionOutcome, StoreError> {
        let outcome = self.store.mark_print_job_printed(id, self.clock.now()).await?;
        log_ack("printed", id, &outcome);
        Ok(outcome)
    }

    pub async fn cancel(&self, id: PrintJobId) -> Result<TransitionOutcome, StoreError> {
        let outcome = self.store.cancel_print_job(id, self.clock.now()).await?;
        if outcome.is_applied() {
            info!(job_id = %id, "print job cancelled");
        }
        Ok(outcome)
    }

    pub async fn status(&self, id: PrintJobId) -> Result<Option<PrintJob>, StoreError> {
        self.store.get_print_job(id).await
    }

    pub async fn jobs_for_order(&self, order_id: OrderId) -> Result<Vec<PrintJob>, StoreError> {
        self.store.print_jobs_for_order(order_id).await
    }

    /// Artifact bytes for `id`; `None` when the job or its blob is missing.
    pub async fn artifact(&self, id: PrintJobId) -> Result<Option<Vec<u8>>, PrintQueueError> {
        let Some(job) = self.store.get_print_job(id).await? else {
            return Ok(None);
        };
        match self.blobs.get(&job.filename).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Check a signed download link issued by [`PrintQueue::claim`].
    pub fn verify_download(
        &self,
        id: PrintJobId,
        expires: i64,
        sig: &str,
    ) -> Result<(), AuthError> {
        self.signer
            .verify(&download_path(id), expires, sig, self.clock.now())
    }
}

fn log_ack(ack: &str, id: PrintJobId, outcome: &TransitionOutcome) {
    match outcome {
        TransitionOutcome::Applied => info!(job_id = %id, ack, "print job acknowledged"),
        TransitionOutcome::AlreadyApplied => {
            info!(job_id = %id, ack, "print job ack repeated; already processed")
        }
        TransitionOutcome::Rejected { current } => {
            warn!(job_id = %id, ack, current = %current, "print job ack rejected")
        }
        TransitionOutcome::NotFound => warn!(job_id = %id, ack, "print job ack for unknown job"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use chrono::{Duration, Utc};
    use signpost_core::{ManualClock, OrderStatus};

    use crate::db::MemoryStore;
    use crate::orders::OrderStore;
    use crate::print_queue::types::PrintJobStatus;
    use crate::storage::MemoryBlobStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        blobs: Arc<MemoryBlobStore>,
        clock: Arc<ManualClock>,
        queue: PrintQueue,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::arc();
        let blobs = Arc::new(MemoryBlobStore::new());
        let clock = ManualClock::arc(Utc::now());
        let queue = PrintQueue::new(
            store.clone(),
            blobs.clone(),
            clock.clone(),
            DownloadUrlSigner::new("test-secret", Duration::minutes(15)),
            "https://signs.example.com",
            PrintQueueSettings::default(),
        );
        Fixture {
            store,
            blobs,
            clock,
            queue,
        }
    }

    async fn submitted_order(f: &Fixture, id: i64) -> OrderId {
        let order_id = OrderId::new(id);
        let mut order = Order::new(order_id, "sign", f.clock.now());
        order.status = OrderStatus::SubmittedToPrinter;
        order.product.material = Some("aluminum".into());
        order.product.sides = Some("double".into());
        f.store.insert_order(&order).await.unwrap();
        f.blobs
            .put(&format!("renders/order_{id}.pdf"), b"%PDF-1.7".to_vec())
            .await
            .unwrap();
        order_id
    }

    #[tokio::test]
    async fn create_is_idempotent_per_order() {
        let f = fixture();
        let order_id = submitted_order(&f, 42).await;

        let first = f
            .queue
            .create(order_id, serde_json::json!({"name": "A"}), "renders/order_42.pdf")
            .await
            .unwrap();
        let second = f
            .queue
            .create(order_id, serde_json::json!({"name": "A"}), "renders/order_42.pdf")
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(f.queue.jobs_for_order(order_id).await.unwrap().len(), 1);
        let job = f.queue.status(first).await.unwrap().unwrap();
        assert_eq!(job.idempotency_key, "order_42");
        assert!(f.blobs.exists(&job.filename).await.unwrap());
    }

    #[tokio::test]
    async fn create_fails_when_artifact_missing() {
        let f = fixture();
        let err = f
            .queue
            .create(OrderId::new(7), serde_json::json!({}), "renders/missing.pdf")
            .await
            .unwrap_err();
        assert!(matches!(err, PrintQueueError::Storage(StorageError::NotFound(_))));
        assert!(f.queue.jobs_for_order(OrderId::new(7)).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_leave_one_job_and_one_blob() {
        let f = fixture();
        let order_id = submitted_order(&f, 9).await;
        let before = f.blobs.len();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let queue = f.queue.clone();
                tokio::spawn(async move {
                    queue
                        .create(order_id, serde_json::json!({}), "renders/order_9.pdf")
                        .await
                        .unwrap()
                })
            })
            .collect();
        let mut ids = HashSet::new();
        for h in handles {
            ids.insert(h.await.unwrap());
        }

        assert_eq!(ids.len(), 1);
        assert_eq!(f.queue.jobs_for_order(order_id).await.unwrap().len(), 1);
        assert_eq!(f.blobs.len(), before + 1);
    }

    #[tokio::test]
    async fn successive_single_claims_return_distinct_jobs() {
        let f = fixture();
        let a = submitted_order(&f, 1).await;
        let b = submitted_order(&f, 2).await;
        f.queue.create(a, serde_json::json!({}), "renders/order_1.pdf").await.unwrap();
        f.clock.advance(Duration::seconds(1));
        f.queue.create(b, serde_json::json!({}), "renders/order_2.pdf").await.unwrap();

        let first = f.queue.claim(1).await.unwrap();
        let second = f.queue.claim(1).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_ne!(first[0].job_id, second[0].job_id);
        assert_eq!(first[0].order_id, a);
        assert!(f.queue.claim(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_joins_product_metadata_and_signs_download_url() {
        let f = fixture();
        let order_id = submitted_order(&f, 5).await;
        let job_id = f
            .queue
            .create(order_id, serde_json::json!({"city": "Austin"}), "renders/order_5.pdf")
            .await
            .unwrap();

        let views = f.queue.claim(10).await.unwrap();
        let view = &views[0];
        assert_eq!(view.product_metadata.material.as_deref(), Some("aluminum"));
        assert_eq!(view.shipping_json["city"], "Austin");
        assert_eq!(view.attempts, 1);
        assert!(view.download_url.starts_with(&format!(
            "https://signs.example.com/api/print-jobs/{job_id}/pdf?expires="
        )));

        let query = view.download_url.split_once('?').unwrap().1;
        let mut expires = 0;
        let mut sig = "";
        for kv in query.split('&') {
            if let Some(v) = kv.strip_prefix("expires=") {
                expires = v.parse().unwrap();
            } else if let Some(v) = kv.strip_prefix("sig=") {
                sig = v;
            }
        }
        assert!(f.queue.verify_download(job_id, expires, sig).is_ok());
        f.clock.advance(Duration::minutes(16));
        assert!(f.queue.verify_download(job_id, expires, sig).is_err());
    }

    #[tokio::test]
    async fn unacked_claim_is_returned_again_after_stale_window() {
        let f = fixture();
        let order_id = submitted_order(&f, 3).await;
        let job_id = f
            .queue
            .create(order_id, serde_json::json!({}), "renders/order_3.pdf")
            .await
            .unwrap();

        assert_eq!(f.queue.claim(5).await.unwrap().len(), 1);
        f.clock.advance(Duration::minutes(9));
        assert!(f.queue.claim(5).await.unwrap().is_empty());

        f.clock.advance(Duration::minutes(2));
        let again = f.queue.claim(5).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].job_id, job_id);
        assert_eq!(again[0].attempts, 2);
    }

    #[tokio::test]
    async fn downloaded_ack_is_idempotent() {
        let f = fixture();
        let order_id = submitted_order(&f, 4).await;
        let job_id = f
            .queue
            .create(order_id, serde_json::json!({}), "renders/order_4.pdf")
            .await
            .unwrap();
        f.queue.claim(1).await.unwrap();

        assert_eq!(f.queue.ack_downloaded(job_id).await.unwrap(), TransitionOutcome::Applied);
        assert_eq!(
            f.queue.ack_downloaded(job_id).await.unwrap(),
            TransitionOutcome::AlreadyApplied
        );
        let job = f.queue.status(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, PrintJobStatus::Downloaded);
        assert!(job.next_retry_at.is_none());
        assert!(job.downloaded_at.is_some());
    }

    #[tokio::test]
    async fn printed_ack_twice_fulfils_order_once() {
        let f = fixture();
        let order_id = submitted_order(&f, 8).await;
        let job_id = f
            .queue
            .create(order_id, serde_json::json!({}), "renders/order_8.pdf")
            .await
            .unwrap();
        f.queue.claim(1).await.unwrap();

        assert_eq!(f.queue.ack_printed(job_id).await.unwrap(), TransitionOutcome::Applied);
        let fulfilled_at = f.store.get_order(order_id).await.unwrap().unwrap().fulfilled_at;
        assert!(fulfilled_at.is_some());

        f.clock.advance(Duration::minutes(1));
        assert_eq!(
            f.queue.ack_printed(job_id).await.unwrap(),
            TransitionOutcome::AlreadyApplied
        );
        let order = f.store.get_order(order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Fulfilled);
        assert_eq!(order.fulfilled_at, fulfilled_at);
        assert_eq!(
            f.queue.ack_downloaded(job_id).await.unwrap(),
            TransitionOutcome::AlreadyApplied
        );
    }

    #[tokio::test]
    async fn cancelled_job_rejects_acks_and_is_not_claimed() {
        let f = fixture();
        let order_id = submitted_order(&f, 6).await;
        let job_id = f
            .queue
            .create(order_id, serde_json::json!({}), "renders/order_6.pdf")
            .await
            .unwrap();

        assert_eq!(f.queue.cancel(job_id).await.unwrap(), TransitionOutcome::Applied);
        assert_eq!(f.queue.cancel(job_id).await.unwrap(), TransitionOutcome::AlreadyApplied);
        assert!(f.queue.claim(10).await.unwrap().is_empty());
        assert_eq!(
            f.queue.ack_printed(job_id).await.unwrap(),
            TransitionOutcome::rejected("cancelled")
        );
        let order = f.store.get_order(order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::SubmittedToPrinter);
    }

    #[tokio::test]
    async fn unknown_job_ack_is_not_found() {
        let f = fixture();
        assert_eq!(
            f.queue.ack_downloaded(PrintJobId::new()).await.unwrap(),
            TransitionOutcome::NotFound
        );
        assert!(f.queue.artifact(PrintJobId::new()).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claimers_receive_disjoint_jobs() {
        let f = fixture();
        for id in 1..=30 {
            let order_id = OrderId::new(id);
            f.blobs
                .put(&format!("renders/order_{id}.pdf"), vec![1])
                .await
                .unwrap();
            f.queue
                .create(order_id, serde_json::json!({}), &format!("renders/order_{id}.pdf"))
                .await
                .unwrap();
        }

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let queue = f.queue.clone();
                tokio::spawn(async move {
                    let mut mine = Vec::new();
                    loop {
                        let batch = queue.claim(2).await.unwrap();
                        if batch.is_empty() {
                            break mine;
                        }
                        mine.extend(batch.into_iter().map(|v| v.job_id));
                    }
                })
            })
            .collect();

        let mut all = Vec::new();
        for h in handles {
            all.extend(h.await.unwrap());
        }
        let unique: HashSet<_> = all.iter().copied().collect();
        assert_eq!(all.len(), 30);
        assert_eq!(unique.len(), 30);
    }
}
