//! `signpost-core`: domain building blocks for the print fulfillment pipeline.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod clock;
pub mod error;
pub mod id;
pub mod order;
pub mod outcome;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{EventId, JobId, OrderId, PrintJobId, UserId};
pub use order::{
    truncate_error, Order, OrderStatus, OrderType, PaymentDetails, ProductMetadata,
    ShippingAddress, MAX_ERROR_LEN,
};
pub use outcome::TransitionOutcome;
