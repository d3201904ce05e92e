//! Postgres implementation of [`WebhookEventStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use tracing::instrument;

use signpost_core::{EventId, truncate_error};

use super::store::WebhookEventStore;
use super::types::WebhookEvent;
use crate::db::PgStore;
use crate::error::{StoreError, map_sqlx_error};

#[derive(Debug, FromRow)]
struct WebhookEventRow {
    event_id: String,
    event_type: String,
    status: String,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<WebhookEventRow> for WebhookEvent {
    type Error = StoreError;

    fn try_from(row: WebhookEventRow) -> Result<Self, Self::Error> {
        Ok(WebhookEvent {
            event_id: EventId::new(row.event_id)?,
            event_type: row.event_type,
            status: row.status.parse()?,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[async_trait]
impl WebhookEventStore for PgStore {
    #[instrument(skip(self, event), fields(event_id = %event.event_id), err)]
    async fn record_event(&self, event: &WebhookEvent) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO webhook_events (event_id, event_type, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $4)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event.event_id.as_str())
        .bind(&event.event_type)
        .bind(event.status.as_str())
        .bind(event.created_at)
        .execute(self.pool())
        .await
        .map_err(|e| map_sqlx_error("record_event", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn claim_event(&self, id: &EventId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = 'processing', updated_at = $2
            WHERE event_id = $1 AND status IN ('received', 'failed')
            "#,
        )
        .bind(id.as_str())
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(|e| map_sqlx_error("claim_event", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_event_processed(
        &self,
        id: &EventId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE webhook_events SET status = 'processed', last_error = NULL, updated_at = $2 \
             WHERE event_id = $1",
        )
        .bind(id.as_str())
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(|e| map_sqlx_error("mark_event_processed", e))?;
        Ok(())
    }

    async fn mark_event_failed(
        &self,
        id: &EventId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE webhook_events SET status = 'failed', last_error = $2, updated_at = $3 \
             WHERE event_id = $1",
        )
        .bind(id.as_str())
        .bind(truncate_error(error))
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(|e| map_sqlx_error("mark_event_failed", e))?;
        Ok(())
    }

    async fn get_event(&self, id: &EventId) -> Result<Option<WebhookEvent>, StoreError> {
        let row: Option<WebhookEventRow> = sqlx::query_as(
            "SELECT event_id, event_type, status, last_error, created_at, updated_at \
             FROM webhook_events WHERE event_id = $1",
        )
        .bind(id.as_str())
        .fetch_optional(self.pool())
        .await
        .map_err(|e| map_sqlx_error("get_event", e))?;
        row.map(WebhookEvent::try_from).transpose()
    }
}
