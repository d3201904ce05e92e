//! Checkout attempt idempotency and price lookups.

pub mod hash;
pub mod postgres;
pub mod prices;
pub mod service;
pub mod store;
pub mod types;

pub use hash::params_hash;
pub use prices::PriceCache;
pub use service::{BeginCheckout, CheckoutAttempts, CheckoutError, validate_attempt_params};
pub use store::CheckoutAttemptStore;
pub use types::{AttemptStatus, CheckoutAttempt};
