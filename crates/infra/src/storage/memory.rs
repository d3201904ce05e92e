use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::{BlobStore, StorageError, validate_key};

/// Process-local blob store for tests and dev.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> StorageError {
    StorageError::Io("lock poisoned".to_string())
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        validate_key(key)?;
        Ok(self.blobs.read().map_err(|_| poisoned())?.contains_key(key))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        validate_key(key)?;
        self.blobs
            .read()
            .map_err(|_| poisoned())?
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        validate_key(key)?;
        self.blobs
            .write()
            .map_err(|_| poisoned())?
            .insert(key.to_string(), bytes);
        Ok(())
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<u64, StorageError> {
        validate_key(src)?;
        validate_key(dst)?;
        let mut blobs = self.blobs.write().map_err(|_| poisoned())?;
        let bytes = blobs
            .get(src)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(src.to_string()))?;
        let len = bytes.len() as u64;
        blobs.insert(dst.to_string(), bytes);
        Ok(len)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        self.blobs.write().map_err(|_| poisoned())?.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copy_duplicates_bytes() {
        let store = MemoryBlobStore::new();
        store.put("renders/1.pdf", b"%PDF".to_vec()).await.unwrap();

        assert_eq!(store.copy("renders/1.pdf", "print-jobs/x.pdf").await.unwrap(), 4);
        assert_eq!(store.get("print-jobs/x.pdf").await.unwrap(), b"%PDF");
        assert!(matches!(
            store.copy("renders/missing.pdf", "print-jobs/y.pdf").await,
            Err(StorageError::NotFound(_))
        ));
    }
}
