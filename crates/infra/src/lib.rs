//! Infrastructure layer: stores, queues, webhook processing, fulfillment,
//! configuration, and external service clients.

pub mod checkout;
pub mod claim;
pub mod config;
pub mod db;
pub mod error;
pub mod external;
pub mod fulfillment;
pub mod jobs;
pub mod orders;
pub mod print_queue;
pub mod reconcile;
pub mod storage;
pub mod webhooks;

pub use config::Settings;
pub use db::{MemoryStore, PgStore};
pub use error::StoreError;
pub use fulfillment::{FulfillmentOutcome, FulfillmentService};
pub use reconcile::{ReconcileReport, Reconciler};
