//! Content-addressed blob storage.
//!
//! Blobs are addressed by [`ContentId::of`] their bytes. Pinning marks a
//! blob as locally retained; it is flat because thread blocks carry no
//! links to other objects.

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

use loom_shared::types::ContentId;

#[derive(Error, Debug)]
pub enum ContentError {
    #[error("Content not found: {0}")]
    NotFound(ContentId),

    #[error("Content does not match id {0}")]
    Mismatch(ContentId),

    #[error("Content too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Path traversal detected")]
    InvalidPath,

    #[error("Content store lock poisoned")]
    Poisoned,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store `data` unpinned and return its id.
    async fn put(&self, data: &[u8]) -> Result<ContentId, ContentError>;

    async fn get(&self, id: &ContentId) -> Result<Vec<u8>, ContentError>;

    async fn has(&self, id: &ContentId) -> Result<bool, ContentError>;

    async fn pin(&self, id: &ContentId) -> Result<(), ContentError>;

    async fn unpin(&self, id: &ContentId) -> Result<(), ContentError>;

    async fn is_pinned(&self, id: &ContentId) -> Result<bool, ContentError>;

    /// Store and pin in one step.
    async fn add(&self, data: &[u8]) -> Result<ContentId, ContentError> {
        let id = self.put(data).await?;
        self.pin(&id).await?;
        Ok(id)
    }
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryContentStore {
    blobs: Mutex<HashMap<ContentId, Vec<u8>>>,
    pins: Mutex<HashSet<ContentId>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn put(&self, data: &[u8]) -> Result<ContentId, ContentError> {
        let id = ContentId::of(data);
        self.blobs
            .lock()
            .map_err(|_| ContentError::Poisoned)?
            .entry(id.clone())
            .or_insert_with(|| data.to_vec());
        Ok(id)
    }

    async fn get(&self, id: &ContentId) -> Result<Vec<u8>, ContentError> {
        self.blobs
            .lock()
            .map_err(|_| ContentError::Poisoned)?
            .get(id)
            .cloned()
            .ok_or_else(|| ContentError::NotFound(id.clone()))
    }

    async fn has(&self, id: &ContentId) -> Result<bool, ContentError> {
        Ok(self
            .blobs
            .lock()
            .map_err(|_| ContentError::Poisoned)?
            .contains_key(id))
    }

    async fn pin(&self, id: &ContentId) -> Result<(), ContentError> {
        if !self.has(id).await? {
            return Err(ContentError::NotFound(id.clone()));
        }
        self.pins
            .lock()
            .map_err(|_| ContentError::Poisoned)?
            .insert(id.clone());
        Ok(())
    }

    async fn unpin(&self, id: &ContentId) -> Result<(), ContentError> {
        self.pins
            .lock()
            .map_err(|_| ContentError::Poisoned)?
            .remove(id);
        Ok(())
    }

    async fn is_pinned(&self, id: &ContentId) -> Result<bool, ContentError> {
        Ok(self
            .pins
            .lock()
            .map_err(|_| ContentError::Poisoned)?
            .contains(id))
    }
}

// ---------------------------------------------------------------------------
// Disk
// ---------------------------------------------------------------------------

/// Verify that a resolved path stays within the expected base directory.
fn ensure_within(base: &Path, target: &Path) -> Result<PathBuf, ContentError> {
    let canonical_base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
    let mut resolved = canonical_base.clone();
    for component in target
        .strip_prefix(&canonical_base)
        .unwrap_or(target)
        .components()
    {
        match component {
            Component::Normal(c) => resolved.push(c),
            Component::ParentDir => return Err(ContentError::InvalidPath),
            _ => {}
        }
    }
    if !resolved.starts_with(&canonical_base) {
        return Err(ContentError::InvalidPath);
    }
    Ok(resolved)
}

/// Blobs as files named by content id, pins as empty marker files.
///
/// ```text
/// <base>/blobs/<cid>
/// <base>/pins/<cid>
/// ```
#[derive(Debug, Clone)]
pub struct DiskContentStore {
    base_path: PathBuf,
    max_size: usize,
}

impl DiskContentStore {
    pub async fn new(base_path: PathBuf, max_size: usize) -> Result<Self, ContentError> {
        fs::create_dir_all(base_path.join("blobs")).await?;
        fs::create_dir_all(base_path.join("pins")).await?;

        info!(path = %base_path.display(), "Content store initialized");

        Ok(Self {
            base_path,
            max_size,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn blob_path(&self, id: &ContentId) -> Result<PathBuf, ContentError> {
        ensure_within(&self.base_path, &self.base_path.join("blobs").join(id.as_str()))
    }

    fn pin_path(&self, id: &ContentId) -> Result<PathBuf, ContentError> {
        ensure_within(&self.base_path, &self.base_path.join("pins").join(id.as_str()))
    }
}

#[async_trait]
impl ContentStore for DiskContentStore {
    async fn put(&self, data: &[u8]) -> Result<ContentId, ContentError> {
        if data.len() > self.max_size {
            return Err(ContentError::TooLarge {
                size: data.len(),
                max: self.max_size,
            });
        }

        let id = ContentId::of(data);
        let path = self.blob_path(&id)?;
        if !fs::try_exists(&path).await? {
            // Write then rename so readers never see a partial blob
            let tmp = path.with_extension("tmp");
            fs::write(&tmp, data).await?;
            fs::rename(&tmp, &path).await?;
            debug!(id = %id.short(), size = data.len(), "Stored blob");
        }
        Ok(id)
    }

    async fn get(&self, id: &ContentId) -> Result<Vec<u8>, ContentError> {
        let path = self.blob_path(id)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ContentError::NotFound(id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn has(&self, id: &ContentId) -> Result<bool, ContentError> {
        Ok(fs::try_exists(self.blob_path(id)?).await?)
    }

    async fn pin(&self, id: &ContentId) -> Result<(), ContentError> {
        if !self.has(id).await? {
            return Err(ContentError::NotFound(id.clone()));
        }
        fs::write(self.pin_path(id)?, b"").await?;
        Ok(())
    }

    async fn unpin(&self, id: &ContentId) -> Result<(), ContentError> {
        match fs::remove_file(self.pin_path(id)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn is_pinned(&self, id: &ContentId) -> Result<bool, ContentError> {
        Ok(fs::try_exists(self.pin_path(id)?).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn disk_store() -> (DiskContentStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = DiskContentStore::new(dir.path().to_path_buf(), 1024)
            .await
            .unwrap();
        (store, dir)
    }

    async fn exercise(store: &dyn ContentStore) {
        let id = store.put(b"ciphertext").await.unwrap();
        assert!(id.matches(b"ciphertext"));
        assert_eq!(store.get(&id).await.unwrap(), b"ciphertext");
        assert!(!store.is_pinned(&id).await.unwrap());

        store.pin(&id).await.unwrap();
        assert!(store.is_pinned(&id).await.unwrap());
        store.unpin(&id).await.unwrap();
        assert!(!store.is_pinned(&id).await.unwrap());

        let missing = ContentId::of(b"missing");
        assert!(matches!(
            store.get(&missing).await,
            Err(ContentError::NotFound(_))
        ));
        assert!(store.pin(&missing).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise(&MemoryContentStore::new()).await;
    }

    #[tokio::test]
    async fn test_disk_store() {
        let (store, _dir) = disk_store().await;
        exercise(&store).await;
    }

    #[tokio::test]
    async fn test_disk_put_is_idempotent() {
        let (store, _dir) = disk_store().await;
        let a = store.add(b"same").await.unwrap();
        let b = store.put(b"same").await.unwrap();
        assert_eq!(a, b);
        assert!(store.is_pinned(&b).await.unwrap());
    }

    #[tokio::test]
    async fn test_disk_rejects_oversized() {
        let (store, _dir) = disk_store().await;
        let big = vec![0u8; 2048];
        assert!(matches!(
            store.put(&big).await,
            Err(ContentError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_ensure_within_rejects_parent() {
        let base = Path::new("/tmp/loom-content");
        assert!(ensure_within(base, &base.join("../etc/passwd")).is_err());
        assert!(ensure_within(base, &base.join("blobs/abc")).is_ok());
    }
}
