use async_trait::async_trait;
use chrono::{DateTime, Utc};

use signpost_core::{EventId, truncate_error};

use super::types::{WebhookEvent, WebhookEventStatus};
use crate::db::MemoryStore;
use crate::db::memory::{read, write};
use crate::error::StoreError;

/// Persistence for event idempotency rows.
#[async_trait]
pub trait WebhookEventStore: Send + Sync {
    /// Insert a `received` row. An existing row with the same id is left
    /// untouched; returns whether a row was inserted.
    async fn record_event(&self, event: &WebhookEvent) -> Result<bool, StoreError>;

    /// received | failed -> processing. `false` means another delivery holds
    /// it or it is already processed.
    async fn claim_event(&self, id: &EventId, now: DateTime<Utc>) -> Result<bool, StoreError>;

    async fn mark_event_processed(&self, id: &EventId, now: DateTime<Utc>)
    -> Result<(), StoreError>;

    async fn mark_event_failed(
        &self,
        id: &EventId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn get_event(&self, id: &EventId) -> Result<Option<WebhookEvent>, StoreError>;
}

#[async_trait]
impl WebhookEventStore for MemoryStore {
    async fn record_event(&self, event: &WebhookEvent) -> Result<bool, StoreError> {
        let mut events = write(&self.webhook_events)?;
        if events.contains_key(&event.event_id) {
            return Ok(false);
        }
        events.insert(event.event_id.clone(), event.clone());
        Ok(true)
    }

    async fn claim_event(&self, id: &EventId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut events = write(&self.webhook_events)?;
        match events.get_mut(id) {
            Some(event) if event.status.is_claimable() => {
                event.status = WebhookEventStatus::Processing;
                event.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_event_processed(
        &self,
        id: &EventId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(event) = write(&self.webhook_events)?.get_mut(id) {
            event.status = WebhookEventStatus::Processed;
            event.last_error = None;
            event.updated_at = now;
        }
        Ok(())
    }

    async fn mark_event_failed(
        &self,
        id: &EventId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(event) = write(&self.webhook_events)?.get_mut(id) {
            event.status = WebhookEventStatus::Failed;
            event.last_error = Some(truncate_error(error));
            event.updated_at = now;
        }
        Ok(())
    }

    async fn get_event(&self, id: &EventId) -> Result<Option<WebhookEvent>, StoreError> {
        Ok(read(&self.webhook_events)?.get(id).cloned())
    }
}
