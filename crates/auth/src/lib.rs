//! `signpost-auth`: credential checks at the edge of the pipeline.
//!
//! This crate is intentionally decoupled from HTTP and storage: callers hand
//! in raw header values and body bytes, and get a typed verdict back.

pub mod bearer;
pub mod download;
pub mod error;
pub mod signature;

pub use bearer::{StaticTokenVerifier, TokenVerifier};
pub use download::DownloadUrlSigner;
pub use error::AuthError;
pub use signature::{WebhookSignatureVerifier, DEFAULT_TOLERANCE_SECS};
