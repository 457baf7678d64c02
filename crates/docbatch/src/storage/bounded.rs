use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{ObjectLocator, StorageBackend};
use crate::error::StorageError;

/// Puts a deadline on every storage call of the wrapped backend.
///
/// A call that runs past the deadline fails with `Unavailable`, so it is
/// retried like any other transient outage.
pub struct BoundedStorage {
    inner: Arc<dyn StorageBackend>,
    timeout: Duration,
}

impl BoundedStorage {
    pub fn new(inner: Arc<dyn StorageBackend>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T, F>(&self, key: &str, fut: F) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, StorageError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                log::warn!(
                    "{} storage call for '{}' timed out after {:?}",
                    self.inner.name(),
                    key,
                    self.timeout
                );
                Err(StorageError::Unavailable {
                    key: key.to_string(),
                    reason: format!("timed out after {:?}", self.timeout),
                })
            }
        }
    }
}

#[async_trait]
impl StorageBackend for BoundedStorage {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn put(&self, locator: &ObjectLocator, bytes: &[u8]) -> Result<String, StorageError> {
        self.bounded(&locator.key(), self.inner.put(locator, bytes))
            .await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.bounded(key, self.inner.get(key)).await
    }

    async fn fetch_to(&self, key: &str, dest: &Path) -> Result<(), StorageError> {
        self.bounded(key, self.inner.fetch_to(key, dest)).await
    }

    async fn list(&self, job_id: &str) -> Result<Vec<String>, StorageError> {
        self.bounded(job_id, self.inner.list(job_id)).await
    }

    fn local_path(&self, key: &str) -> Option<PathBuf> {
        self.inner.local_path(key)
    }

    fn download_reference(&self, job_id: &str, key: &str) -> String {
        self.inner.download_reference(job_id, key)
    }
}
