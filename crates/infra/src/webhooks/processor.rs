//! Exactly-once application of provider events.
//!
//! ```text
//! record(received) ──► claim(received|failed → processing) ──► handler
//!                         │ lost                                │
//!                         ▼                                     ├─ ok  → processed
//!                      Duplicate                                └─ err → failed (redeliverable)
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, instrument};

use signpost_core::{Clock, DomainError};

use super::store::WebhookEventStore;
use super::types::{ProviderEvent, WebhookEvent};
use crate::error::StoreError;

/// Side effects for one claimed event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &ProviderEvent) -> anyhow::Result<()>;
}

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// This delivery ran the side effects.
    Processed,
    /// Another delivery holds or already finished the event.
    Duplicate,
    /// Side effects failed; the event is `failed` and will be re-claimed on
    /// the next delivery.
    Failed(String),
}

impl WebhookOutcome {
    /// Whether the transport should acknowledge with 2xx.
    pub fn is_acknowledged(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error(transparent)]
    Invalid(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct WebhookProcessor {
    store: Arc<dyn WebhookEventStore>,
    handler: Arc<dyn EventHandler>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for WebhookProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookProcessor").finish_non_exhaustive()
    }
}

impl WebhookProcessor {
    pub fn new(
        store: Arc<dyn WebhookEventStore>,
        handler: Arc<dyn EventHandler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            handler,
            clock,
        }
    }

    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type))]
    pub async fn process(&self, event: &ProviderEvent) -> Result<WebhookOutcome, WebhookError> {
        let event_id = event.event_id()?;
        let row = WebhookEvent::received(event_id.clone(), &event.event_type, self.clock.now());
        self.store.record_event(&row).await?;

        if !self.store.claim_event(&event_id, self.clock.now()).await? {
            let status = self
                .store
                .get_event(&event_id)
                .await?
                .map(|e| e.status.as_str());
            info!(status = ?status, "webhook event already claimed; skipping");
            return Ok(WebhookOutcome::Duplicate);
        }

        match self.handler.handle(event).await {
            Ok(()) => {
                self.store
                    .mark_event_processed(&event_id, self.clock.now())
                    .await?;
                info!("webhook event processed");
                Ok(WebhookOutcome::Processed)
            }
            Err(err) => {
                let message = format!("{err:#}");
                error!(error = %message, "webhook event handling failed");
                self.store
                    .mark_event_failed(&event_id, &message, self.clock.now())
                    .await?;
                Ok(WebhookOutcome::Failed(message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use signpost_core::{EventId, ManualClock};

    use crate::db::MemoryStore;
    use crate::webhooks::types::{EventData, WebhookEventStatus};

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait]
    impl EventHandler for Counting {
        async fn handle(&self, _event: &ProviderEvent) -> anyhow::Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            // Hold the claim long enough for a racing delivery to observe it.
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if self.fail_first && n == 0 {
                anyhow::bail!("provider timeout");
            }
            Ok(())
        }
    }

    fn event(id: &str) -> ProviderEvent {
        ProviderEvent {
            id: id.to_string(),
            event_type: "checkout.session.completed".into(),
            data: EventData {
                object: serde_json::json!({}),
            },
        }
    }

    fn processor(handler: Arc<Counting>) -> (Arc<MemoryStore>, WebhookProcessor) {
        let store = MemoryStore::arc();
        let p = WebhookProcessor::new(store.clone(), handler, ManualClock::arc(Utc::now()));
        (store, p)
    }

    #[tokio::test]
    async fn sequential_redelivery_applies_once() {
        let handler = Arc::new(Counting::default());
        let (store, p) = processor(handler.clone());

        assert_eq!(p.process(&event("evt_1")).await.unwrap(), WebhookOutcome::Processed);
        assert_eq!(p.process(&event("evt_1")).await.unwrap(), WebhookOutcome::Duplicate);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        let row = store
            .get_event(&EventId::new("evt_1").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, WebhookEventStatus::Processed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_deliveries_apply_once_and_all_acknowledge() {
        let handler = Arc::new(Counting::default());
        let (_, p) = processor(handler.clone());

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let p = p.clone();
                tokio::spawn(async move { p.process(&event("evt_1")).await.unwrap() })
            })
            .collect();
        let mut outcomes = Vec::new();
        for h in handles {
            outcomes.push(h.await.unwrap());
        }

        assert!(outcomes.iter().all(WebhookOutcome::is_acknowledged));
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| **o == WebhookOutcome::Processed)
                .count(),
            1
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_event_is_reclaimed_on_next_delivery() {
        let handler = Arc::new(Counting {
            fail_first: true,
            ..Default::default()
        });
        let (store, p) = processor(handler.clone());
        let id = EventId::new("evt_9").unwrap();

        let first = p.process(&event("evt_9")).await.unwrap();
        assert!(matches!(first, WebhookOutcome::Failed(ref m) if m.contains("provider timeout")));
        let row = store.get_event(&id).await.unwrap().unwrap();
        assert_eq!(row.status, WebhookEventStatus::Failed);
        assert!(row.last_error.is_some());

        assert_eq!(p.process(&event("evt_9")).await.unwrap(), WebhookOutcome::Processed);
        let row = store.get_event(&id).await.unwrap().unwrap();
        assert_eq!(row.status, WebhookEventStatus::Processed);
        assert!(row.last_error.is_none());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }
}
