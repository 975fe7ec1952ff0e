//! Content-addressed blob substrate.
//!
//! Bodies are stored under opaque [`ObjectKey`]s; the sync core derives keys
//! from content hashes so puts are idempotent and identical bodies
//! deduplicate. Production deployments implement [`Storage`] against their
//! object store; [`MemoryStorage`] and [`LocalDirStorage`] back tests and
//! single-node setups.

use std::{
    collections::BTreeMap,
    fmt::Debug,
    path::PathBuf,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use sync_types::BlobHash;

mod presigned;

pub use crate::presigned::{
    BlobAction,
    SignedUrl,
    SignedUrlPayload,
    UrlSigner,
};

/// Key of an object in the substrate.
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    derive_more::Display,
)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&BlobHash> for ObjectKey {
    fn from(hash: &BlobHash) -> Self {
        // `sha256:<hex>` is already a stable, filesystem-safe-ish name once
        // the colon is mapped.
        Self(hash.to_string().replace(':', "/"))
    }
}

impl From<String> for ObjectKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

pub struct ObjectAttributes {
    pub size: u64,
}

#[async_trait]
pub trait Storage: Send + Sync + Debug {
    /// Store `body` under `key`. Writing the same key twice must be
    /// idempotent; callers derive keys from content hashes.
    async fn put(&self, key: &ObjectKey, body: Bytes) -> anyhow::Result<()>;

    async fn get(&self, key: &ObjectKey) -> anyhow::Result<Option<Bytes>>;

    /// Remove an object. Returns whether it existed.
    async fn delete(&self, key: &ObjectKey) -> anyhow::Result<bool>;

    /// Object metadata, when the substrate exposes it. Implementations that
    /// cannot stat cheaply may return `None` for existing objects only if
    /// `get` would also miss.
    async fn attributes(&self, key: &ObjectKey) -> anyhow::Result<Option<ObjectAttributes>>;
}

/// In-memory substrate for tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: Mutex<BTreeMap<ObjectKey, Bytes>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn put(&self, key: &ObjectKey, body: Bytes) -> anyhow::Result<()> {
        self.objects.lock().insert(key.clone(), body);
        Ok(())
    }

    async fn get(&self, key: &ObjectKey) -> anyhow::Result<Option<Bytes>> {
        Ok(self.objects.lock().get(key).cloned())
    }

    async fn delete(&self, key: &ObjectKey) -> anyhow::Result<bool> {
        Ok(self.objects.lock().remove(key).is_some())
    }

    async fn attributes(&self, key: &ObjectKey) -> anyhow::Result<Option<ObjectAttributes>> {
        Ok(self
            .objects
            .lock()
            .get(key)
            .map(|body| ObjectAttributes {
                size: body.len() as u64,
            }))
    }
}

/// Directory-backed substrate. Object keys map to relative paths.
#[derive(Debug)]
pub struct LocalDirStorage {
    dir: PathBuf,
}

impl LocalDirStorage {
    pub fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &ObjectKey) -> PathBuf {
        self.dir.join(key.as_str())
    }
}

#[async_trait]
impl Storage for LocalDirStorage {
    async fn put(&self, key: &ObjectKey, body: Bytes) -> anyhow::Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write through a temp file so a crashed put never leaves a
        // truncated object under a content-addressed key.
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &ObjectKey) -> anyhow::Result<Option<Bytes>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes.into())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &ObjectKey) -> anyhow::Result<bool> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn attributes(&self, key: &ObjectKey) -> anyhow::Result<Option<ObjectAttributes>> {
        match tokio::fs::metadata(self.path_for(key)).await {
            Ok(meta) => Ok(Some(ObjectAttributes { size: meta.len() })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn test_memory_storage_roundtrip() -> anyhow::Result<()> {
        let storage = MemoryStorage::new();
        let hash = BlobHash::of(b"hello");
        let key = ObjectKey::from(&hash);

        assert!(storage.get(&key).await?.is_none());
        storage.put(&key, Bytes::from_static(b"hello")).await?;
        // Idempotent re-put.
        storage.put(&key, Bytes::from_static(b"hello")).await?;
        assert_eq!(storage.object_count(), 1);
        assert_eq!(storage.get(&key).await?.unwrap(), "hello");
        assert_eq!(storage.attributes(&key).await?.unwrap().size, 5);
        assert!(storage.delete(&key).await?);
        assert!(!storage.delete(&key).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_local_dir_storage_roundtrip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = LocalDirStorage::new(dir.path())?;
        let hash = BlobHash::of(b"file body");
        let key = ObjectKey::from(&hash);

        storage.put(&key, Bytes::from_static(b"file body")).await?;
        assert_eq!(storage.get(&key).await?.unwrap(), "file body");
        assert_eq!(storage.attributes(&key).await?.unwrap().size, 9);
        assert!(storage.delete(&key).await?);
        assert!(storage.get(&key).await?.is_none());
        Ok(())
    }
}
