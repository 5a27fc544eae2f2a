//! Durable storage for collections, job inputs and artifacts.
//!
//! Data lives either in an object store (bucket + key) or on a shared
//! filesystem (path). Stages talk to a single [`Storage`] facade and never
//! see which backing store a locator resolves to.
//!
//! # Overview
//!
//! - **StorageLocator**: where a piece of data lives
//! - **ObjectStore**: trait for object-store clients (retries are the
//!   client's responsibility)
//! - **HttpObjectStore**: `GET`/`PUT {endpoint}/{bucket}/{key}` client
//! - **OutputLayout**: destination locators for report artifacts

pub mod http_store;
pub mod layout;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::StorageError;

pub use http_store::{HttpObjectStore, RetryPolicy};
pub use layout::{ContentType, OutputLayout};

/// Location of a piece of data in durable storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageLocator {
    Object { bucket: String, key: String },
    SharedFs(PathBuf),
}

impl fmt::Display for StorageLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageLocator::Object { bucket, key } => write!(f, "{}/{}", bucket, key),
            StorageLocator::SharedFs(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Client for an object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Downloads `bucket/key` into `dest`, returning the bytes written.
    async fn fetch(&self, bucket: &str, key: &str, dest: &Path) -> Result<u64, StorageError>;

    /// Uploads the file at `src` to `bucket/key`.
    async fn put(&self, src: &Path, bucket: &str, key: &str) -> Result<(), StorageError>;
}

/// Storage facade shared by every stage.
#[derive(Clone, Default)]
pub struct Storage {
    object_store: Option<Arc<dyn ObjectStore>>,
}

impl Storage {
    /// Storage that can only reach the shared filesystem.
    pub fn shared_fs_only() -> Self {
        Self { object_store: None }
    }

    pub fn with_object_store(object_store: Arc<dyn ObjectStore>) -> Self {
        Self {
            object_store: Some(object_store),
        }
    }

    fn object_store(&self, bucket: &str, key: &str) -> Result<&dyn ObjectStore, StorageError> {
        self.object_store
            .as_deref()
            .ok_or_else(|| StorageError::NotConfigured {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    /// Copies the data at `locator` into the local file `dest`.
    pub async fn fetch(&self, locator: &StorageLocator, dest: &Path) -> Result<u64, StorageError> {
        match locator {
            StorageLocator::Object { bucket, key } => {
                self.object_store(bucket, key)?.fetch(bucket, key, dest).await
            }
            StorageLocator::SharedFs(path) => copy_with_parents(path, dest).await,
        }
    }

    /// Copies the local file `src` to `locator`.
    pub async fn put(&self, src: &Path, locator: &StorageLocator) -> Result<(), StorageError> {
        match locator {
            StorageLocator::Object { bucket, key } => {
                self.object_store(bucket, key)?.put(src, bucket, key).await
            }
            StorageLocator::SharedFs(path) => copy_with_parents(src, path).await.map(|_| ()),
        }
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("object_store", &self.object_store.is_some())
            .finish()
    }
}

async fn copy_with_parents(from: &Path, to: &Path) -> Result<u64, StorageError> {
    let wrap = |source| StorageError::SharedFs {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    };

    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(wrap)?;
    }
    let bytes = tokio::fs::copy(from, to).await.map_err(wrap)?;
    debug!(from = %from.display(), to = %to.display(), bytes, "Copied via shared filesystem");
    Ok(bytes)
}
