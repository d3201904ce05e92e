use async_trait::async_trait;
use chrono::{DateTime, Utc};

use signpost_core::{Order, OrderId, OrderStatus, PaymentDetails, TransitionOutcome};

use crate::db::MemoryStore;
use crate::db::memory::{read, write};
use crate::error::StoreError;

/// Order persistence used by the orchestrator and the payment handlers.
///
/// Status writes are conditional: `submitted_to_printer` and `fulfilled` are
/// never moved back to `paid` by a replayed event or duplicate call.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn insert_order(&self, order: &Order) -> Result<(), StoreError>;

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>, StoreError>;

    /// Remember the latest render artifact for an order.
    async fn record_artifact(
        &self,
        id: OrderId,
        artifact_key: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// pending_payment -> paid, recording the payment facts.
    async fn mark_order_paid(
        &self,
        id: OrderId,
        payment: &PaymentDetails,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError>;

    /// paid | print_failed -> submitted_to_printer.
    async fn mark_order_submitted(
        &self,
        id: OrderId,
        provider_job_id: &str,
        idempotency_key: &str,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError>;

    /// paid | print_failed -> print_failed with the error recorded.
    async fn mark_order_print_failed(
        &self,
        id: OrderId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError>;

    /// print_failed -> paid, clearing the error (operator retry).
    async fn reset_order_for_retry(
        &self,
        id: OrderId,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError>;

    /// Orders still awaiting payment, with a checkout session, created before `before`.
    async fn stuck_pending_orders(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Order>, StoreError>;
}

fn transition(
    order: Option<&mut Order>,
    allowed: &[OrderStatus],
    already: &[OrderStatus],
    apply: impl FnOnce(&mut Order),
) -> TransitionOutcome {
    match order {
        None => TransitionOutcome::NotFound,
        Some(order) if allowed.contains(&order.status) => {
            apply(order);
            TransitionOutcome::Applied
        }
        Some(order) if already.contains(&order.status) => TransitionOutcome::AlreadyApplied,
        Some(order) => TransitionOutcome::rejected(order.status.as_str()),
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn insert_order(&self, order: &Order) -> Result<(), StoreError> {
        let mut orders = write(&self.orders)?;
        if orders.contains_key(&order.id) {
            return Err(StoreError::Conflict(format!("order already exists: {}", order.id)));
        }
        orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        Ok(read(&self.orders)?.get(&id).cloned())
    }

    async fn record_artifact(
        &self,
        id: OrderId,
        artifact_key: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(order) = write(&self.orders)?.get_mut(&id) {
            order.artifact_key = Some(artifact_key.to_string());
            order.updated_at = now;
        }
        Ok(())
    }

    async fn mark_order_paid(
        &self,
        id: OrderId,
        payment: &PaymentDetails,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut orders = write(&self.orders)?;
        Ok(transition(
            orders.get_mut(&id),
            &[OrderStatus::PendingPayment],
            &[
                OrderStatus::Paid,
                OrderStatus::PrintFailed,
                OrderStatus::SubmittedToPrinter,
                OrderStatus::Fulfilled,
            ],
            |order| {
                order.status = OrderStatus::Paid;
                order.paid_at = Some(now);
                order.updated_at = now;
                if payment.checkout_session_id.is_some() {
                    order.checkout_session_id = payment.checkout_session_id.clone();
                }
                order.payment_intent_id = payment.payment_intent_id.clone();
                order.amount_total_cents = payment.amount_total_cents;
                order.currency = payment.currency.clone();
                if let Some(shipping) = &payment.shipping {
                    order.shipping = shipping.clone();
                }
            },
        ))
    }

    async fn mark_order_submitted(
        &self,
        id: OrderId,
        provider_job_id: &str,
        idempotency_key: &str,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut orders = write(&self.orders)?;
        Ok(transition(
            orders.get_mut(&id),
            &[OrderStatus::Paid, OrderStatus::PrintFailed],
            &[OrderStatus::SubmittedToPrinter, OrderStatus::Fulfilled],
            |order| {
                order.status = OrderStatus::SubmittedToPrinter;
                order.submitted_at = Some(now);
                order.provider_job_id = Some(provider_job_id.to_string());
                order.print_idempotency_key = Some(idempotency_key.to_string());
                order.fulfillment_error = None;
                order.updated_at = now;
            },
        ))
    }

    async fn mark_order_print_failed(
        &self,
        id: OrderId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut orders = write(&self.orders)?;
        Ok(transition(
            orders.get_mut(&id),
            &[OrderStatus::Paid, OrderStatus::PrintFailed],
            &[],
            |order| {
                order.status = OrderStatus::PrintFailed;
                order.fulfillment_error = Some(signpost_core::truncate_error(error));
                order.updated_at = now;
            },
        ))
    }

    async fn reset_order_for_retry(
        &self,
        id: OrderId,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut orders = write(&self.orders)?;
        Ok(transition(
            orders.get_mut(&id),
            &[OrderStatus::PrintFailed],
            &[OrderStatus::Paid],
            |order| {
                order.status = OrderStatus::Paid;
                order.fulfillment_error = None;
                order.updated_at = now;
            },
        ))
    }

    async fn stuck_pending_orders(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Order>, StoreError> {
        let orders = read(&self.orders)?;
        let mut stuck: Vec<Order> = orders
            .values()
            .filter(|o| {
                o.status == OrderStatus::PendingPayment
                    && o.checkout_session_id.is_some()
                    && o.created_at < before
            })
            .cloned()
            .collect();
        stuck.sort_by_key(|o| o.created_at);
        stuck.truncate(limit);
        Ok(stuck)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paid_order(store: &MemoryStore, id: i64) -> OrderId {
        let id = OrderId::new(id);
        let mut order = Order::new(id, "sign", Utc::now());
        order.status = OrderStatus::Paid;
        order.paid_at = Some(Utc::now());
        write(&store.orders).unwrap().insert(id, order);
        id
    }

    #[tokio::test]
    async fn submitted_orders_never_regress_to_paid() {
        let store = MemoryStore::new();
        let id = paid_order(&store, 1);
        let now = Utc::now();

        assert!(store.mark_order_submitted(id, "job", "order_1", now).await.unwrap().is_applied());
        assert_eq!(
            store.mark_order_paid(id, &PaymentDetails::default(), now).await.unwrap(),
            TransitionOutcome::AlreadyApplied
        );
        assert_eq!(
            store.mark_order_print_failed(id, "late failure", now).await.unwrap(),
            TransitionOutcome::rejected("submitted_to_printer")
        );
        assert_eq!(
            store.get_order(id).await.unwrap().unwrap().status,
            OrderStatus::SubmittedToPrinter
        );
    }

    #[tokio::test]
    async fn print_failed_can_be_reset_by_operator() {
        let store = MemoryStore::new();
        let id = paid_order(&store, 2);
        let now = Utc::now();

        store.mark_order_print_failed(id, "render failed", now).await.unwrap();
        let order = store.get_order(id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::PrintFailed);
        assert_eq!(order.fulfillment_error.as_deref(), Some("render failed"));

        assert!(store.reset_order_for_retry(id, now).await.unwrap().is_applied());
        let order = store.get_order(id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Paid);
        assert!(order.fulfillment_error.is_none());
    }
}
