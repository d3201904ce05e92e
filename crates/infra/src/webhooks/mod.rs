//! Payment-provider webhook processing with event-level idempotency.

pub mod payments;
pub mod postgres;
pub mod processor;
pub mod store;
pub mod subscriptions;
pub mod types;

pub use payments::PaymentEventHandler;
pub use processor::{EventHandler, WebhookError, WebhookOutcome, WebhookProcessor};
pub use store::WebhookEventStore;
pub use subscriptions::{SubscriptionRecord, SubscriptionStore, SubscriptionUpdate};
pub use types::{ProviderEvent, WebhookEvent, WebhookEventStatus};
