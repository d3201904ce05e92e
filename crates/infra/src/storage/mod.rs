//! Blob storage for render artifacts.
//!
//! Keys are slash-separated relative paths (`renders/order_42.pdf`,
//! `print-jobs/<job_id>.pdf`).

pub mod local;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

pub use local::LocalBlobStore;
pub use memory::MemoryBlobStore;

#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("storage io error: {0}")]
    Io(String),
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Write (or overwrite) `key`.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError>;

    /// Copy `src` to `dst`, returning the number of bytes copied.
    async fn copy(&self, src: &str, dst: &str) -> Result<u64, StorageError>;

    /// Delete `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Reject keys that could escape the storage namespace.
pub(crate) fn validate_key(key: &str) -> Result<(), StorageError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traversal_keys_are_rejected() {
        assert!(validate_key("print-jobs/abc.pdf").is_ok());
        for key in ["", "/etc/passwd", "a/../b", "a//b", "./a", "a\\b"] {
            assert!(validate_key(key).is_err(), "{key} should be rejected");
        }
    }
}
