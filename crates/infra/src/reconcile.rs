//! Repair orders whose paid-checkout webhook never arrived.

use std::sync::Arc;

use serde::Serialize;
use signpost_core::{Clock, OrderId};
use tracing::{info, warn};

use crate::error::StoreError;
use crate::external::PaymentProvider;
use crate::orders::OrderStore;
use crate::webhooks::PaymentEventHandler;

const BATCH_LIMIT: usize = 200;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub dry_run: bool,
    pub checked: usize,
    /// Orders whose session is paid (replayed unless `dry_run`).
    pub repaired: Vec<OrderId>,
    pub skipped: Vec<OrderId>,
    pub errors: Vec<String>,
}

#[derive(Clone)]
pub struct Reconciler {
    orders: Arc<dyn OrderStore>,
    provider: Arc<dyn PaymentProvider>,
    handler: PaymentEventHandler,
    clock: Arc<dyn Clock>,
}

impl Reconciler {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        provider: Arc<dyn PaymentProvider>,
        handler: PaymentEventHandler,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            orders,
            provider,
            handler,
            clock,
        }
    }

    /// Check `pending_payment` orders older than `older_than` against the provider
    /// and replay the paid-checkout path for the ones that were actually paid.
    pub async fn reconcile_stuck_orders(
        &self,
        older_than: chrono::Duration,
        dry_run: bool,
    ) -> Result<ReconcileReport, StoreError> {
        let before = self.clock.now() - older_than;
        let stuck = self.orders.stuck_pending_orders(before, BATCH_LIMIT).await?;
        let mut report = ReconcileReport {
            dry_run,
            checked: stuck.len(),
            ..ReconcileReport::default()
        };

        for order in stuck {
            let Some(session_id) = order.checkout_session_id.as_deref() else {
                report.skipped.push(order.id);
                continue;
            };
            let session = match self.provider.retrieve_session(session_id).await {
                Ok(session) => session,
                Err(err) => {
                    warn!(order_id = %order.id, session_id, error = %err, "session lookup failed");
                    report.errors.push(format!("order {}: {err}", order.id));
                    continue;
                }
            };
            if !session.is_paid() {
                report.skipped.push(order.id);
                continue;
            }
            if !dry_run {
                if let Err(err) = self.handler.apply_paid_checkout(&session).await {
                    warn!(order_id = %order.id, error = %err, "replaying paid checkout failed");
                    report.errors.push(format!("order {}: {err}", order.id));
                    continue;
                }
            }
            report.repaired.push(order.id);
        }

        info!(
            dry_run,
            checked = report.checked,
            repaired = report.repaired.len(),
            errors = report.errors.len(),
            "stuck order reconciliation finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{Duration, Utc};
    use serde_json::json;
    use signpost_core::{Order, OrderStatus};

    use crate::external::CheckoutSession;
    use crate::external::fakes::FakePayments;
    use crate::webhooks::payments::tests::{paid_session, setup};

    async fn stuck_order(store: &dyn OrderStore, id: i64, session: &str, age_hours: i64) -> OrderId {
        let order_id = OrderId::new(id);
        let mut order = Order::new(order_id, "sign", Utc::now() - Duration::hours(age_hours));
        order.product.print_product = Some("yard_sign".into());
        order.checkout_session_id = Some(session.into());
        store.insert_order(&order).await.unwrap();
        order_id
    }

    fn payments() -> FakePayments {
        let unpaid = json!({"id": "cs_2", "mode": "payment", "payment_status": "unpaid"});
        FakePayments::default()
            .with_session(CheckoutSession::from_object(&paid_session(1)).unwrap())
            .with_session(CheckoutSession::from_object(&unpaid).unwrap())
    }

    #[tokio::test]
    async fn paid_sessions_are_replayed_and_unpaid_skipped() {
        let s = setup(FakePayments::default());
        let provider = Arc::new(payments());
        let paid = stuck_order(s.h.store.as_ref(), 1, "cs_1", 3).await;
        let unpaid = stuck_order(s.h.store.as_ref(), 2, "cs_2", 3).await;
        let missing = stuck_order(s.h.store.as_ref(), 3, "cs_gone", 3).await;
        let fresh = stuck_order(s.h.store.as_ref(), 4, "cs_1", 0).await;

        let reconciler =
            Reconciler::new(s.h.store.clone(), provider, s.handler.clone(), s.clock.clone());
        let report = reconciler
            .reconcile_stuck_orders(Duration::hours(1), false)
            .await
            .unwrap();

        assert_eq!(report.checked, 3);
        assert_eq!(report.repaired, vec![paid]);
        assert_eq!(report.skipped, vec![unpaid]);
        assert_eq!(report.errors.len(), 1);

        let order = s.h.store.get_order(paid).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::SubmittedToPrinter);
        for id in [unpaid, missing, fresh] {
            let order = s.h.store.get_order(id).await.unwrap().unwrap();
            assert_eq!(order.status, OrderStatus::PendingPayment);
        }

        // The order is no longer pending, so a second pass finds nothing to repair.
        let again = reconciler
            .reconcile_stuck_orders(Duration::hours(1), false)
            .await
            .unwrap();
        assert!(again.repaired.is_empty());
        assert_eq!(s.h.print_queue.jobs_for_order(paid).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dry_run_reports_without_writing() {
        let s = setup(FakePayments::default());
        let paid = stuck_order(s.h.store.as_ref(), 1, "cs_1", 5).await;
        let reconciler = Reconciler::new(
            s.h.store.clone(),
            Arc::new(payments()),
            s.handler.clone(),
            s.clock.clone(),
        );

        let report = reconciler
            .reconcile_stuck_orders(Duration::hours(1), true)
            .await
            .unwrap();
        assert!(report.dry_run);
        assert_eq!(report.repaired, vec![paid]);
        let order = s.h.store.get_order(paid).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::PendingPayment);
    }
}
