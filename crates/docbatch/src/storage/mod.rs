//! Storage backends.
//!
//! Conversion and archiving only ever see `Arc<dyn StorageBackend>`; which
//! implementation sits behind it is decided once, by [`build_storage`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{Config, StorageConfig};
use crate::error::StorageError;

pub mod bounded;
pub mod filesystem;
pub mod object_store;
pub mod s3;

pub use bounded::BoundedStorage;
pub use filesystem::LocalStorage;
pub use object_store::{MemoryObjectClient, ObjectClient, ObjectStoreBackend};
pub use s3::S3ObjectClient;

/// Where an object lives, relative to its job.
///
/// Both backends turn a locator into the same storage key,
/// `<job_id>/<name>`, so keys are portable between them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectLocator {
    job_id: String,
    name: String,
}

impl ObjectLocator {
    pub fn new(job_id: &str, name: &str) -> Result<Self, StorageError> {
        validate_key(job_id)?;
        if job_id.contains('/') {
            return Err(StorageError::Misconfigured(format!(
                "job id '{}' must be a single path segment",
                job_id
            )));
        }
        validate_key(name)?;
        Ok(Self {
            job_id: job_id.to_string(),
            name: name.to_string(),
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.job_id, self.name)
    }
}

/// Rejects keys that could escape a storage root or alias another key.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.contains('\0')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        return Err(StorageError::Misconfigured(format!(
            "invalid storage key '{}'",
            key
        )));
    }
    Ok(())
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Stores `bytes`, replacing any previous object, and returns its key.
    async fn put(&self, locator: &ObjectLocator, bytes: &[u8]) -> Result<String, StorageError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Copies an object into a local file.
    async fn fetch_to(&self, key: &str, dest: &Path) -> Result<(), StorageError> {
        let bytes = self.get(key).await?;
        tokio::fs::write(dest, &bytes)
            .await
            .map_err(|e| StorageError::from_io(&dest.to_string_lossy(), &e))
    }

    /// Keys stored under a job, sorted.
    async fn list(&self, job_id: &str) -> Result<Vec<String>, StorageError>;

    /// A path the key can be read from directly, if the backend has one.
    fn local_path(&self, _key: &str) -> Option<PathBuf> {
        None
    }

    /// Externally dereferenceable link for a stored archive.
    fn download_reference(&self, job_id: &str, key: &str) -> String;
}

/// Builds the backend selected in `config`, wrapped with the storage timeout.
pub fn build_storage(config: &Config) -> Result<Arc<dyn StorageBackend>, StorageError> {
    let inner: Arc<dyn StorageBackend> = match &config.storage {
        StorageConfig::Local(local) => {
            log::info!("Using local storage");
            Arc::new(LocalStorage::new(&local.root, &config.public_base_url))
        }
        StorageConfig::S3(s3_config) => {
            log::info!("Using S3 storage, bucket {}", s3_config.bucket);
            let client = S3ObjectClient::from_config(s3_config)?;
            Arc::new(ObjectStoreBackend::new(
                Arc::new(client),
                &s3_config.download_base_url(),
            ))
        }
    };

    Ok(Arc::new(BoundedStorage::new(
        inner,
        Duration::from_secs(config.storage_timeout_secs),
    )))
}
