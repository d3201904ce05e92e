use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{BlobStore, StorageError, validate_key};

/// Filesystem-backed blob store rooted at a directory.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

fn io(e: std::io::Error) -> StorageError {
    StorageError::Io(e.to_string())
}

async fn ensure_parent(path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io)?;
    }
    Ok(())
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        tokio::fs::try_exists(self.path(key)?).await.map_err(io)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        match tokio::fs::read(self.path(key)?).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound(key.to_string())),
            Err(e) => Err(io(e)),
        }
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        let path = self.path(key)?;
        ensure_parent(&path).await?;
        // Write then rename so readers never see a partial file.
        let tmp = path.with_extension("partial");
        tokio::fs::write(&tmp, bytes).await.map_err(io)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io)
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<u64, StorageError> {
        let from = self.path(src)?;
        let to = self.path(dst)?;
        ensure_parent(&to).await?;
        match tokio::fs::copy(&from, &to).await {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound(src.to_string())),
            Err(e) => Err(io(e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.path(key)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("signpost-blobs-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn put_get_copy_delete_on_disk() {
        let root = temp_root();
        let store = LocalBlobStore::new(&root);

        store.put("renders/1.pdf", b"%PDF-1.7".to_vec()).await.unwrap();
        assert!(store.exists("renders/1.pdf").await.unwrap());
        assert_eq!(store.copy("renders/1.pdf", "print-jobs/a.pdf").await.unwrap(), 8);
        assert_eq!(store.get("print-jobs/a.pdf").await.unwrap(), b"%PDF-1.7");

        store.delete("print-jobs/a.pdf").await.unwrap();
        store.delete("print-jobs/a.pdf").await.unwrap();
        assert!(!store.exists("print-jobs/a.pdf").await.unwrap());
        assert!(matches!(store.get("print-jobs/a.pdf").await, Err(StorageError::NotFound(_))));

        let _ = tokio::fs::remove_dir_all(root).await;
    }

    #[tokio::test]
    async fn escaping_keys_never_touch_the_filesystem() {
        let store = LocalBlobStore::new(temp_root());
        assert!(matches!(store.get("../secret").await, Err(StorageError::InvalidKey(_))));
    }
}
