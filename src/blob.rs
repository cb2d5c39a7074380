//! Blob storage for payloads too large to live inside a store document.

use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fails with an `Io` error of kind `NotFound` if the blob is missing.
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Create or overwrite a blob.
    async fn write(&self, path: &str, data: Vec<u8>) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Returns whether the blob existed.
    async fn delete(&self, path: &str) -> Result<bool>;
}

#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.blobs.read().await.get(path).cloned().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("blob not found: {}", path)).into()
        })
    }

    async fn write(&self, path: &str, data: Vec<u8>) -> Result<()> {
        self.blobs.write().await.insert(path.to_string(), data);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.blobs.read().await.contains_key(path))
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        Ok(self.blobs.write().await.remove(path).is_some())
    }
}

/// Blobs as files under a root directory. Paths use `/` separators and may
/// not escape the root.
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if path.is_empty() || escapes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid blob path: {}", path),
            )
            .into());
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.resolve(path)?;
        Ok(tokio::fs::read(full).await?)
    }

    async fn write(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(full, data).await?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full = self.resolve(path)?;
        Ok(tokio::fs::try_exists(full).await?)
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_file(full).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoordError;

    #[tokio::test]
    async fn memory_store_roundtrip_and_missing() {
        let store = MemoryBlobStore::new();
        store.write("outbox/a.json", b"[1,2]".to_vec()).await.unwrap();
        assert!(store.exists("outbox/a.json").await.unwrap());
        assert_eq!(store.read("outbox/a.json").await.unwrap(), b"[1,2]");

        assert!(store.delete("outbox/a.json").await.unwrap());
        assert!(!store.delete("outbox/a.json").await.unwrap());
        let err = store.read("outbox/a.json").await.unwrap_err();
        assert!(matches!(err, CoordError::Io(e) if e.kind() == io::ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn file_store_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::new(dir.path());

        store.write("outbox/b.json", b"{}".to_vec()).await.unwrap();
        assert!(dir.path().join("outbox").join("b.json").exists());
        assert_eq!(store.read("outbox/b.json").await.unwrap(), b"{}");
        assert!(store.delete("outbox/b.json").await.unwrap());
        assert!(!store.exists("outbox/b.json").await.unwrap());
    }

    #[tokio::test]
    async fn file_store_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::new(dir.path());
        assert!(store.write("../evil", vec![]).await.is_err());
        assert!(store.read("/etc/passwd").await.is_err());
    }
}
