//! Order fulfillment orchestrator.
//!
//! `fulfill_order` is invoked from the payment webhook, the `fulfill_order`
//! background job and the admin retry route, possibly all at once. It never
//! raises: every failure is recorded on the order and reported through
//! [`FulfillmentOutcome`] so callers can retry later.
//!
//! At most one print job exists per order (the print queue dedups on the
//! order-derived idempotency key) and only one caller observes the
//! `submitted_to_printer` transition as `Submitted`.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, instrument, warn};

use signpost_core::{Clock, Order, OrderId, PrintJobId, TransitionOutcome};

use crate::external::Renderer;
use crate::orders::OrderStore;
use crate::print_queue::PrintQueue;
use crate::storage::BlobStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FulfillmentOutcome {
    /// This call created (or adopted) the print job and moved the order.
    Submitted { job_id: PrintJobId },
    /// The order was already submitted or fulfilled.
    AlreadySubmitted,
    /// Not a physical product; nothing to print.
    Skipped,
    /// Policy refusal (unknown order, wrong status). Never retried automatically.
    Rejected { reason: String },
    /// Transient failure recorded as `print_failed`; safe to retry.
    Failed { reason: String },
}

impl FulfillmentOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(
            self,
            Self::Submitted { .. } | Self::AlreadySubmitted | Self::Skipped
        )
    }

    fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }
}

#[derive(Clone)]
pub struct FulfillmentService {
    orders: Arc<dyn OrderStore>,
    print_queue: PrintQueue,
    renderer: Arc<dyn Renderer>,
    blobs: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    render_timeout: Duration,
}

impl std::fmt::Debug for FulfillmentService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FulfillmentService")
            .field("render_timeout", &self.render_timeout)
            .finish_non_exhaustive()
    }
}

impl FulfillmentService {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        print_queue: PrintQueue,
        renderer: Arc<dyn Renderer>,
        blobs: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
        render_timeout: Duration,
    ) -> Self {
        Self {
            orders,
            print_queue,
            renderer,
            blobs,
            clock,
            render_timeout,
        }
    }

    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn fulfill_order(&self, order_id: OrderId) -> FulfillmentOutcome {
        let order = match self.orders.get_order(order_id).await {
            Ok(Some(order)) => order,
            Ok(None) => {
                warn!("fulfillment refused: order not found");
                return FulfillmentOutcome::rejected(format!("order {order_id} not found"));
            }
            Err(err) => {
                error!(error = %err, "fulfillment could not load order");
                return FulfillmentOutcome::Failed {
                    reason: err.to_string(),
                };
            }
        };

        if order.is_submitted() {
            info!(status = %order.status, "order already submitted");
            return FulfillmentOutcome::AlreadySubmitted;
        }

        if !order.status.is_fulfillable() {
            warn!(status = %order.status, "fulfillment refused: order not paid");
            return FulfillmentOutcome::rejected(format!(
                "order {order_id} is {}, not paid",
                order.status
            ));
        }

        if !order.order_type.is_physical() {
            info!(order_type = %order.order_type, "order type is not printed; skipping");
            return FulfillmentOutcome::Skipped;
        }

        match self.submit(&order).await {
            Ok(outcome) => outcome,
            Err(reason) => self.record_failure(order_id, reason).await,
        }
    }

    async fn submit(&self, order: &Order) -> Result<FulfillmentOutcome, String> {
        let artifact_key = self.prepare_artifact(order).await?;

        let job_id = self
            .print_queue
            .create(order.id, order.shipping_payload(), &artifact_key)
            .await
            .map_err(|e| format!("print job creation failed: {e}"))?;

        let idempotency_key = Order::print_idempotency_key_for(order.id);
        let outcome = self
            .orders
            .mark_order_submitted(order.id, &job_id.to_string(), &idempotency_key, self.clock.now())
            .await
            .map_err(|e| format!("could not record submission: {e}"))?;

        Ok(match outcome {
            TransitionOutcome::Applied => {
                info!(job_id = %job_id, "order submitted to printer");
                FulfillmentOutcome::Submitted { job_id }
            }
            TransitionOutcome::AlreadyApplied => FulfillmentOutcome::AlreadySubmitted,
            TransitionOutcome::Rejected { current } => {
                warn!(current = %current, "order changed state during fulfillment");
                FulfillmentOutcome::rejected(format!("order {} is {current}", order.id))
            }
            TransitionOutcome::NotFound => {
                FulfillmentOutcome::rejected(format!("order {} not found", order.id))
            }
        })
    }

    /// Render when the product has a configuration, then confirm the artifact exists.
    async fn prepare_artifact(&self, order: &Order) -> Result<String, String> {
        let artifact_key = if order.has_render_config() {
            let key = tokio::time::timeout(self.render_timeout, self.renderer.render(order))
                .await
                .map_err(|_| format!("render timed out after {:?}", self.render_timeout))?
                .map_err(|e| format!("render failed: {e}"))?;
            self.orders
                .record_artifact(order.id, &key, self.clock.now())
                .await
                .map_err(|e| format!("could not record artifact: {e}"))?;
            key
        } else {
            order
                .artifact_key
                .clone()
                .ok_or_else(|| "no artifact recorded for order".to_string())?
        };

        let exists = self
            .blobs
            .exists(&artifact_key)
            .await
            .map_err(|e| format!("artifact check failed: {e}"))?;
        if !exists {
            return Err(format!("artifact missing: {artifact_key}"));
        }
        Ok(artifact_key)
    }

    async fn record_failure(&self, order_id: OrderId, reason: String) -> FulfillmentOutcome {
        error!(error = %reason, "fulfillment failed");
        if let Err(err) = self
            .orders
            .mark_order_print_failed(order_id, &reason, self.clock.now())
            .await
        {
            error!(error = %err, "could not record fulfillment failure");
        }
        FulfillmentOutcome::Failed { reason }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use chrono::Utc;
    use signpost_auth::DownloadUrlSigner;
    use signpost_core::{ManualClock, OrderStatus, PaymentDetails};

    use crate::config::PrintQueueSettings;
    use crate::db::MemoryStore;
    use crate::external::fakes::FakeRenderer;
    use crate::storage::MemoryBlobStore;

    pub(crate) struct Harness {
        pub store: Arc<MemoryStore>,
        pub blobs: Arc<MemoryBlobStore>,
        pub renderer: Arc<FakeRenderer>,
        pub print_queue: PrintQueue,
        pub service: FulfillmentService,
    }

    pub(crate) fn harness() -> Harness {
        let store = MemoryStore::arc();
        let blobs = Arc::new(MemoryBlobStore::new());
        let clock = ManualClock::arc(Utc::now());
        let renderer = Arc::new(FakeRenderer::new(blobs.clone()));
        let print_queue = PrintQueue::new(
            store.clone(),
            blobs.clone(),
            clock.clone(),
            DownloadUrlSigner::new("secret", chrono::Duration::minutes(15)),
            "http://localhost:8080",
            PrintQueueSettings::default(),
        );
        let service = FulfillmentService::new(
            store.clone(),
            print_queue.clone(),
            renderer.clone(),
            blobs.clone(),
            clock,
            Duration::from_secs(5),
        );
        Harness {
            store,
            blobs,
            renderer,
            print_queue,
            service,
        }
    }

    pub(crate) async fn paid_sign(h: &Harness, id: i64) -> OrderId {
        let order_id = OrderId::new(id);
        let mut order = Order::new(order_id, "sign", Utc::now());
        order.product.print_product = Some("yard_sign".into());
        h.store.insert_order(&order).await.unwrap();
        h.store
            .mark_order_paid(order_id, &PaymentDetails::default(), Utc::now())
            .await
            .unwrap();
        order_id
    }

    #[tokio::test]
    async fn repeated_fulfillment_creates_one_print_job() {
        let h = harness();
        let order_id = paid_sign(&h, 42).await;

        let first = h.service.fulfill_order(order_id).await;
        assert!(matches!(first, FulfillmentOutcome::Submitted { .. }));
        assert_eq!(h.service.fulfill_order(order_id).await, FulfillmentOutcome::AlreadySubmitted);
        assert_eq!(h.service.fulfill_order(order_id).await, FulfillmentOutcome::AlreadySubmitted);

        let jobs = h.print_queue.jobs_for_order(order_id).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].idempotency_key, "order_42");

        let order = h.store.get_order(order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::SubmittedToPrinter);
        assert!(order.submitted_at.is_some());
        assert_eq!(order.provider_job_id, Some(jobs[0].job_id.to_string()));
        assert_eq!(h.renderer.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_fulfillment_submits_once() {
        let h = harness();
        let order_id = paid_sign(&h, 7).await;

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let svc = h.service.clone();
                tokio::spawn(async move { svc.fulfill_order(order_id).await })
            })
            .collect();
        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.unwrap());
        }

        assert!(outcomes.iter().all(FulfillmentOutcome::succeeded));
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, FulfillmentOutcome::Submitted { .. }))
                .count(),
            1
        );
        assert_eq!(h.print_queue.jobs_for_order(order_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn render_failure_marks_print_failed_and_creates_no_job() {
        let h = harness();
        let order_id = paid_sign(&h, 5).await;
        h.renderer.fail.store(true, Ordering::SeqCst);

        let outcome = h.service.fulfill_order(order_id).await;
        assert!(matches!(outcome, FulfillmentOutcome::Failed { ref reason } if reason.contains("render failed")));
        assert!(h.print_queue.jobs_for_order(order_id).await.unwrap().is_empty());

        let order = h.store.get_order(order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::PrintFailed);
        assert!(order.fulfillment_error.unwrap().contains("layout engine crashed"));

        h.renderer.fail.store(false, Ordering::SeqCst);
        assert!(matches!(
            h.service.fulfill_order(order_id).await,
            FulfillmentOutcome::Submitted { .. }
        ));
        let order = h.store.get_order(order_id).await.unwrap().unwrap();
        assert!(order.fulfillment_error.is_none());
    }

    #[tokio::test]
    async fn missing_artifact_is_a_transient_failure() {
        let h = harness();
        let order_id = paid_sign(&h, 6).await;
        h.renderer.skip_write.store(true, Ordering::SeqCst);

        let outcome = h.service.fulfill_order(order_id).await;
        assert!(matches!(outcome, FulfillmentOutcome::Failed { ref reason } if reason.contains("artifact missing")));
        assert_eq!(
            h.store.get_order(order_id).await.unwrap().unwrap().status,
            OrderStatus::PrintFailed
        );
    }

    #[tokio::test]
    async fn unpaid_order_is_refused_without_side_effects() {
        let h = harness();
        let order_id = OrderId::new(11);
        h.store
            .insert_order(&Order::new(order_id, "sign", Utc::now()))
            .await
            .unwrap();

        let outcome = h.service.fulfill_order(order_id).await;
        assert!(matches!(outcome, FulfillmentOutcome::Rejected { .. }));
        assert!(!outcome.succeeded());
        assert_eq!(h.renderer.calls(), 0);
        assert_eq!(
            h.store.get_order(order_id).await.unwrap().unwrap().status,
            OrderStatus::PendingPayment
        );
        assert!(matches!(
            h.service.fulfill_order(OrderId::new(999)).await,
            FulfillmentOutcome::Rejected { .. }
        ));
    }

    #[tokio::test]
    async fn non_physical_order_is_a_successful_no_op() {
        let h = harness();
        let order_id = OrderId::new(12);
        h.store
            .insert_order(&Order::new(order_id, "listing_unlock", Utc::now()))
            .await
            .unwrap();
        h.store
            .mark_order_paid(order_id, &PaymentDetails::default(), Utc::now())
            .await
            .unwrap();

        let outcome = h.service.fulfill_order(order_id).await;
        assert_eq!(outcome, FulfillmentOutcome::Skipped);
        assert!(outcome.succeeded());
        assert!(h.blobs.is_empty());
    }

    #[tokio::test]
    async fn order_without_render_config_uses_recorded_artifact() {
        let h = harness();
        let order_id = OrderId::new(13);
        let mut order = Order::new(order_id, "smart_sign", Utc::now());
        order.artifact_key = Some("previews/order_13.pdf".into());
        h.store.insert_order(&order).await.unwrap();
        h.store
            .mark_order_paid(order_id, &PaymentDetails::default(), Utc::now())
            .await
            .unwrap();
        h.blobs
            .put("previews/order_13.pdf", b"%PDF".to_vec())
            .await
            .unwrap();

        assert!(matches!(
            h.service.fulfill_order(order_id).await,
            FulfillmentOutcome::Submitted { .. }
        ));
        assert_eq!(h.renderer.calls(), 0);
    }
}
