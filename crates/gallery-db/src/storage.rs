//! Object storage for original images and derived thumbnails.
//!
//! Objects are addressed by `(bucket, key)`. Every backend must make `put_object`
//! an atomic overwrite: a reader sees either the previous bytes or the new
//! bytes, never a partial write.

use std::{
    collections::HashMap,
    io::ErrorKind,
    path::PathBuf,
    sync::Arc,
};

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object {bucket}/{key} not found")]
    NotFound { bucket: String, key: String },
    #[error("invalid object path component '{0}'")]
    InvalidKey(String),
    #[error("object store I/O failure on {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
    #[error("object store unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    /// Whether a redelivery of the same work could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StorageError::InvalidKey(_))
    }
}

#[async_trait]
pub trait ObjectStorage: Send + Sync + 'static {
    async fn put_object(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<(), StorageError>;
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError>;
    /// Removing a missing object succeeds.
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StorageError>;
    async fn object_exists(&self, bucket: &str, key: &str) -> Result<bool, StorageError>;
}

pub type SharedObjectStorage = Arc<dyn ObjectStorage>;

/// Rejects anything that could escape the bucket directory.
pub fn validate_component(value: &str) -> Result<(), StorageError> {
    let invalid = value.is_empty()
        || value == "."
        || value == ".."
        || value.starts_with('.')
        || value.contains(['/', '\\', '\0']);
    if invalid {
        Err(StorageError::InvalidKey(value.to_string()))
    } else {
        Ok(())
    }
}

/// Filesystem-backed store laid out as `<root>/<bucket>/<key>`.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StorageError> {
        validate_component(bucket)?;
        validate_component(key)?;
        Ok(self.root.join(bucket).join(key))
    }
}

#[async_trait]
impl ObjectStorage for LocalObjectStore {
    async fn put_object(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        let path = self.object_path(bucket, key)?;
        let dir = self.root.join(bucket);
        fs::create_dir_all(&dir)
            .await
            .map_err(|err| StorageError::Io(dir.clone(), err))?;

        // Write aside and rename so concurrent writers of the same key race on
        // the rename only, which replaces the target atomically.
        let staging = dir.join(format!(".{key}.{}.part", Uuid::new_v4().simple()));
        fs::write(&staging, &bytes)
            .await
            .map_err(|err| StorageError::Io(staging.clone(), err))?;
        if let Err(err) = fs::rename(&staging, &path).await {
            let _ = fs::remove_file(&staging).await;
            return Err(StorageError::Io(path, err));
        }

        debug!(bucket, key, size = bytes.len(), "object written");
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.object_path(bucket, key)?;
        fs::read(&path).await.map_err(|err| match err.kind() {
            ErrorKind::NotFound => StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            },
            _ => StorageError::Io(path.clone(), err),
        })
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        let path = self.object_path(bucket, key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::Io(path, err)),
        }
    }

    async fn object_exists(&self, bucket: &str, key: &str) -> Result<bool, StorageError> {
        let path = self.object_path(bucket, key)?;
        fs::try_exists(&path)
            .await
            .map_err(|err| StorageError::Io(path, err))
    }
}

/// In-process store, mostly for tests and single-node development.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently stored in `bucket`, sorted.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .read()
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait]
impl ObjectStorage for MemoryObjectStore {
    async fn put_object(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        validate_component(bucket)?;
        validate_component(key)?;
        self.objects
            .write()
            .insert((bucket.to_string(), key.to_string()), bytes);
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .read()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        self.objects
            .write()
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }

    async fn object_exists(&self, bucket: &str, key: &str) -> Result<bool, StorageError> {
        Ok(self
            .objects
            .read()
            .contains_key(&(bucket.to_string(), key.to_string())))
    }
}
