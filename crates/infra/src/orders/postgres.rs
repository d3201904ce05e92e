//! Postgres implementation of [`OrderStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, Row};
use tracing::instrument;

use signpost_core::{
    Order, OrderId, OrderType, PaymentDetails, ProductMetadata, ShippingAddress, TransitionOutcome,
    UserId,
};

use super::store::OrderStore;
use crate::db::{PgStore, settle_transition, transition_sql};
use crate::error::{StoreError, map_sqlx_error};

pub(crate) const ORDER_COLUMNS: &str = "id, user_id, order_type, status, print_size, quantity, \
     print_product, material, sides, layout_id, artifact_key, shipping_name, shipping_address, \
     shipping_city, shipping_state, shipping_zip, checkout_session_id, payment_intent_id, \
     amount_total_cents, currency, fulfillment_error, provider_job_id, print_idempotency_key, \
     paid_at, submitted_at, fulfilled_at, created_at, updated_at";

#[derive(Debug, FromRow)]
pub(crate) struct OrderRow {
    id: i64,
    user_id: Option<i64>,
    order_type: String,
    status: String,
    print_size: Option<String>,
    quantity: i32,
    print_product: Option<String>,
    material: Option<String>,
    sides: Option<String>,
    layout_id: Option<String>,
    artifact_key: Option<String>,
    shipping_name: Option<String>,
    shipping_address: Option<String>,
    shipping_city: Option<String>,
    shipping_state: Option<String>,
    shipping_zip: Option<String>,
    checkout_session_id: Option<String>,
    payment_intent_id: Option<String>,
    amount_total_cents: Option<i64>,
    currency: Option<String>,
    fulfillment_error: Option<String>,
    provider_job_id: Option<String>,
    print_idempotency_key: Option<String>,
    paid_at: Option<DateTime<Utc>>,
    submitted_at: Option<DateTime<Utc>>,
    fulfilled_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for Order {
    type Error = StoreError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        Ok(Order {
            id: OrderId::new(row.id),
            user_id: row.user_id.map(UserId::new),
            order_type: OrderType::from(row.order_type),
            status: row.status.parse()?,
            print_size: row.print_size,
            quantity: row.quantity,
            product: ProductMetadata {
                print_product: row.print_product,
                material: row.material,
                sides: row.sides,
                layout_id: row.layout_id,
            },
            artifact_key: row.artifact_key,
            shipping: ShippingAddress {
                name: row.shipping_name,
                line1: row.shipping_address,
                city: row.shipping_city,
                state: row.shipping_state,
                postal_code: row.shipping_zip,
            },
            checkout_session_id: row.checkout_session_id,
            payment_intent_id: row.payment_intent_id,
            amount_total_cents: row.amount_total_cents,
            currency: row.currency,
            fulfillment_error: row.fulfillment_error,
            provider_job_id: row.provider_job_id,
            print_idempotency_key: row.print_idempotency_key,
            paid_at: row.paid_at,
            submitted_at: row.submitted_at,
            fulfilled_at: row.fulfilled_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[async_trait]
impl OrderStore for PgStore {
    #[instrument(skip(self, order), fields(order_id = %order.id), err)]
    async fn insert_order(&self, order: &Order) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO orders ({ORDER_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, \
              $19, $20, $21, $22, $23, $24, $25, $26, $27, $28)"
        ))
        .bind(order.id.get())
        .bind(order.user_id.map(UserId::get))
        .bind(order.order_type.as_str())
        .bind(order.status.as_str())
        .bind(&order.print_size)
        .bind(order.quantity)
        .bind(&order.product.print_product)
        .bind(&order.product.material)
        .bind(&order.product.sides)
        .bind(&order.product.layout_id)
        .bind(&order.artifact_key)
        .bind(&order.shipping.name)
        .bind(&order.shipping.line1)
        .bind(&order.shipping.city)
        .bind(&order.shipping.state)
        .bind(&order.shipping.postal_code)
        .bind(&order.checkout_session_id)
        .bind(&order.payment_intent_id)
        .bind(order.amount_total_cents)
        .bind(&order.currency)
        .bind(&order.fulfillment_error)
        .bind(&order.provider_job_id)
        .bind(&order.print_idempotency_key)
        .bind(order.paid_at)
        .bind(order.submitted_at)
        .bind(order.fulfilled_at)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(self.pool())
        .await
        .map_err(|e| map_sqlx_error("insert_order", e))?;
        Ok(())
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        let row: Option<OrderRow> =
            sqlx::query_as(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
                .bind(id.get())
                .fetch_optional(self.pool())
                .await
                .map_err(|e| map_sqlx_error("get_order", e))?;
        row.map(Order::try_from).transpose()
    }

    async fn record_artifact(
        &self,
        id: OrderId,
        artifact_key: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE orders SET artifact_key = $2, updated_at = $3 WHERE id = $1")
            .bind(id.get())
            .bind(artifact_key)
            .bind(now)
            .execute(self.pool())
            .await
            .map_err(|e| map_sqlx_error("record_artifact", e))?;
        Ok(())
    }

    #[instrument(skip(self, payment), fields(order_id = %id), err)]
    async fn mark_order_paid(
        &self,
        id: OrderId,
        payment: &PaymentDetails,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let shipping = payment.shipping.clone();
        let has_shipping = shipping.is_some();
        let shipping = shipping.unwrap_or_default();
        let sql = transition_sql(
            "orders",
            "id",
            r#"status = 'paid',
               paid_at = $2,
               updated_at = $2,
               checkout_session_id = COALESCE($3, checkout_session_id),
               payment_intent_id = $4,
               amount_total_cents = $5,
               currency = $6,
               shipping_name = CASE WHEN $7 THEN $8 ELSE shipping_name END,
               shipping_address = CASE WHEN $7 THEN $9 ELSE shipping_address END,
               shipping_city = CASE WHEN $7 THEN $10 ELSE shipping_city END,
               shipping_state = CASE WHEN $7 THEN $11 ELSE shipping_state END,
               shipping_zip = CASE WHEN $7 THEN $12 ELSE shipping_zip END"#,
            "'pending_payment'",
        );
        let row = sqlx::query(&sql)
            .bind(id.get())
            .bind(now)
            .bind(&payment.checkout_session_id)
            .bind(&payment.payment_intent_id)
            .bind(payment.amount_total_cents)
            .bind(&payment.currency)
            .bind(has_shipping)
            .bind(shipping.name)
            .bind(shipping.line1)
            .bind(shipping.city)
            .bind(shipping.state)
            .bind(shipping.postal_code)
            .fetch_one(self.pool())
            .await
            .map_err(|e| map_sqlx_error("mark_order_paid", e))?;
        settle_transition(
            self.pool(),
            "orders",
            "id",
            id.get(),
            row.get("applied"),
            &["paid", "print_failed", "submitted_to_printer", "fulfilled"],
        )
        .await
    }

    #[instrument(skip(self), fields(order_id = %id), err)]
    async fn mark_order_submitted(
        &self,
        id: OrderId,
        provider_job_id: &str,
        idempotency_key: &str,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let sql = transition_sql(
            "orders",
            "id",
            "status = 'submitted_to_printer', submitted_at = $2, provider_job_id = $3, \
             print_idempotency_key = $4, fulfillment_error = NULL, updated_at = $2",
            "'paid', 'print_failed'",
        );
        let row = sqlx::query(&sql)
            .bind(id.get())
            .bind(now)
            .bind(provider_job_id)
            .bind(idempotency_key)
            .fetch_one(self.pool())
            .await
            .map_err(|e| map_sqlx_error("mark_order_submitted", e))?;
        settle_transition(
            self.pool(),
            "orders",
            "id",
            id.get(),
            row.get("applied"),
            &["submitted_to_printer", "fulfilled"],
        )
        .await
    }

    #[instrument(skip(self, error), fields(order_id = %id), err)]
    async fn mark_order_print_failed(
        &self,
        id: OrderId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let sql = transition_sql(
            "orders",
            "id",
            "status = 'print_failed', fulfillment_error = $3, updated_at = $2",
            "'paid', 'print_failed'",
        );
        let row = sqlx::query(&sql)
            .bind(id.get())
            .bind(now)
            .bind(signpost_core::truncate_error(error))
            .fetch_one(self.pool())
            .await
            .map_err(|e| map_sqlx_error("mark_order_print_failed", e))?;
        settle_transition(
            self.pool(),
            "orders",
            "id",
            id.get(),
            row.get("applied"),
            &[],
        )
        .await
    }

    #[instrument(skip(self), fields(order_id = %id), err)]
    async fn reset_order_for_retry(
        &self,
        id: OrderId,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let sql = transition_sql(
            "orders",
            "id",
            "status = 'paid', fulfillment_error = NULL, updated_at = $2",
            "'print_failed'",
        );
        let row = sqlx::query(&sql)
            .bind(id.get())
            .bind(now)
            .fetch_one(self.pool())
            .await
            .map_err(|e| map_sqlx_error("reset_order_for_retry", e))?;
        settle_transition(
            self.pool(),
            "orders",
            "id",
            id.get(),
            row.get("applied"),
            &["paid"],
        )
        .await
    }

    async fn stuck_pending_orders(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Order>, StoreError> {
        let rows: Vec<OrderRow> = sqlx::query_as(&format!(
            r#"
            SELECT {ORDER_COLUMNS} FROM orders
            WHERE status = 'pending_payment'
              AND checkout_session_id IS NOT NULL
              AND created_at < $1
            ORDER BY created_at ASC
            LIMIT $2
            "#
        ))
        .bind(before)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_sqlx_error("stuck_pending_orders", e))?;
        rows.into_iter().map(Order::try_from).collect()
    }
}
