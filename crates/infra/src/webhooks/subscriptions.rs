//! User subscription state kept in sync from payment-provider events.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tracing::instrument;

use signpost_core::UserId;

use crate::db::memory::{read, write};
use crate::db::{MemoryStore, PgStore};
use crate::error::{StoreError, map_sqlx_error};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub user_id: UserId,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub status: String,
    pub current_period_end: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// A status change addressed by provider identifiers.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionUpdate<'a> {
    pub status: &'a str,
    pub current_period_end: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Upsert the user -> customer/subscription link.
    async fn link_subscription(&self, record: &SubscriptionRecord) -> Result<(), StoreError>;

    /// Update every record carrying `subscription_id`. Returns rows touched.
    async fn update_by_subscription(
        &self,
        subscription_id: &str,
        update: &SubscriptionUpdate<'_>,
    ) -> Result<u64, StoreError>;

    /// Update every record carrying `customer_id`, optionally (re)linking
    /// `subscription_id`. Returns rows touched.
    async fn update_by_customer(
        &self,
        customer_id: &str,
        link_subscription: Option<&str>,
        update: &SubscriptionUpdate<'_>,
    ) -> Result<u64, StoreError>;

    async fn get_subscription(
        &self,
        user_id: UserId,
    ) -> Result<Option<SubscriptionRecord>, StoreError>;
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn link_subscription(&self, record: &SubscriptionRecord) -> Result<(), StoreError> {
        write(&self.subscriptions)?.insert(record.user_id, record.clone());
        Ok(())
    }

    async fn update_by_subscription(
        &self,
        subscription_id: &str,
        update: &SubscriptionUpdate<'_>,
    ) -> Result<u64, StoreError> {
        let mut subs = write(&self.subscriptions)?;
        let mut touched = 0;
        for record in subs
            .values_mut()
            .filter(|r| r.subscription_id.as_deref() == Some(subscription_id))
        {
            record.status = update.status.to_string();
            record.current_period_end = update.current_period_end;
            record.updated_at = update.now;
            touched += 1;
        }
        Ok(touched)
    }

    async fn update_by_customer(
        &self,
        customer_id: &str,
        link_subscription: Option<&str>,
        update: &SubscriptionUpdate<'_>,
    ) -> Result<u64, StoreError> {
        let mut subs = write(&self.subscriptions)?;
        let mut touched = 0;
        for record in subs
            .values_mut()
            .filter(|r| r.customer_id.as_deref() == Some(customer_id))
        {
            record.status = update.status.to_string();
            record.current_period_end = update.current_period_end;
            if let Some(sub_id) = link_subscription {
                record.subscription_id = Some(sub_id.to_string());
            }
            record.updated_at = update.now;
            touched += 1;
        }
        Ok(touched)
    }

    async fn get_subscription(
        &self,
        user_id: UserId,
    ) -> Result<Option<SubscriptionRecord>, StoreError> {
        Ok(read(&self.subscriptions)?.get(&user_id).cloned())
    }
}

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    user_id: i64,
    customer_id: Option<String>,
    subscription_id: Option<String>,
    status: String,
    current_period_end: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

#[async_trait]
impl SubscriptionStore for PgStore {
    #[instrument(skip(self, record), fields(user_id = %record.user_id), err)]
    async fn link_subscription(&self, record: &SubscriptionRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions
                (user_id, customer_id, subscription_id, status, current_period_end, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id) DO UPDATE SET
                customer_id = EXCLUDED.customer_id,
                subscription_id = EXCLUDED.subscription_id,
                status = EXCLUDED.status,
                current_period_end = EXCLUDED.current_period_end,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(record.user_id.get())
        .bind(&record.customer_id)
        .bind(&record.subscription_id)
        .bind(&record.status)
        .bind(record.current_period_end)
        .bind(record.updated_at)
        .execute(self.pool())
        .await
        .map_err(|e| map_sqlx_error("link_subscription", e))?;
        Ok(())
    }

    async fn update_by_subscription(
        &self,
        subscription_id: &str,
        update: &SubscriptionUpdate<'_>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE subscriptions SET status = $2, current_period_end = $3, updated_at = $4 \
             WHERE subscription_id = $1",
        )
        .bind(subscription_id)
        .bind(update.status)
        .bind(update.current_period_end)
        .bind(update.now)
        .execute(self.pool())
        .await
        .map_err(|e| map_sqlx_error("update_by_subscription", e))?;
        Ok(result.rows_affected())
    }

    async fn update_by_customer(
        &self,
        customer_id: &str,
        link_subscription: Option<&str>,
        update: &SubscriptionUpdate<'_>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE subscriptions SET status = $2, current_period_end = $3, updated_at = $4, \
             subscription_id = COALESCE($5, subscription_id) WHERE customer_id = $1",
        )
        .bind(customer_id)
        .bind(update.status)
        .bind(update.current_period_end)
        .bind(update.now)
        .bind(link_subscription)
        .execute(self.pool())
        .await
        .map_err(|e| map_sqlx_error("update_by_customer", e))?;
        Ok(result.rows_affected())
    }

    async fn get_subscription(
        &self,
        user_id: UserId,
    ) -> Result<Option<SubscriptionRecord>, StoreError> {
        let row: Option<SubscriptionRow> = sqlx::query_as(
            "SELECT user_id, customer_id, subscription_id, status, current_period_end, updated_at \
             FROM subscriptions WHERE user_id = $1",
        )
        .bind(user_id.get())
        .fetch_optional(self.pool())
        .await
        .map_err(|e| map_sqlx_error("get_subscription", e))?;
        Ok(row.map(|r| SubscriptionRecord {
            user_id: UserId::new(r.user_id),
            customer_id: r.customer_id,
            subscription_id: r.subscription_id,
            status: r.status,
            current_period_end: r.current_period_end,
            updated_at: r.updated_at,
        }))
    }
}
