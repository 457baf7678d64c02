//! Remote object-store backend.
//!
//! `ObjectStoreBackend` holds the key layout and download links; the wire
//! protocol sits behind [`ObjectClient`] so the same backend runs against
//! S3 in production and an in-memory bucket in tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{validate_key, ObjectLocator, StorageBackend};
use crate::error::StorageError;

/// Minimal bucket operations, keyed by full object key.
#[async_trait]
pub trait ObjectClient: Send + Sync {
    fn name(&self) -> &'static str;

    async fn put_object(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;

    async fn get_object(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Every key starting with `prefix`, in any order.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

pub struct ObjectStoreBackend {
    client: Arc<dyn ObjectClient>,
    download_base_url: String,
}

impl ObjectStoreBackend {
    pub fn new(client: Arc<dyn ObjectClient>, download_base_url: &str) -> Self {
        Self {
            client,
            download_base_url: download_base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    fn name(&self) -> &'static str {
        self.client.name()
    }

    async fn put(&self, locator: &ObjectLocator, bytes: &[u8]) -> Result<String, StorageError> {
        let key = locator.key();
        self.client.put_object(&key, bytes).await?;
        log::debug!("Uploaded {} ({} bytes)", key, bytes.len());
        Ok(key)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        validate_key(key)?;
        self.client.get_object(key).await
    }

    async fn list(&self, job_id: &str) -> Result<Vec<String>, StorageError> {
        validate_key(job_id)?;
        let prefix = format!("{}/", job_id);
        let mut keys = self.client.list_keys(&prefix).await?;
        keys.retain(|k| k.starts_with(&prefix));
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    fn download_reference(&self, _job_id: &str, key: &str) -> String {
        format!("{}/{}", self.download_base_url, key)
    }
}

/// Bucket held in process memory.
///
/// `fail_next` makes the following operations return `Unavailable`, which
/// lets tests exercise retry paths.
#[derive(Default)]
pub struct MemoryObjectClient {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    failures: Mutex<u32>,
}

impl MemoryObjectClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, count: u32) {
        if let Ok(mut failures) = self.failures.lock() {
            *failures = count;
        }
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().map(|o| o.len()).unwrap_or(0)
    }

    fn check_fault(&self, key: &str) -> Result<(), StorageError> {
        let mut failures = self.failures.lock().map_err(|_| poisoned(key))?;
        if *failures > 0 {
            *failures -= 1;
            return Err(StorageError::Unavailable {
                key: key.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

fn poisoned(key: &str) -> StorageError {
    StorageError::Unavailable {
        key: key.to_string(),
        reason: "object map lock poisoned".to_string(),
    }
}

#[async_trait]
impl ObjectClient for MemoryObjectClient {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn put_object(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.check_fault(key)?;
        self.objects
            .lock()
            .map_err(|_| poisoned(key))?
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.check_fault(key)?;
        self.objects
            .lock()
            .map_err(|_| poisoned(key))?
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.check_fault(prefix)?;
        let objects = self.objects.lock().map_err(|_| poisoned(prefix))?;
        Ok(objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (Arc<MemoryObjectClient>, ObjectStoreBackend) {
        let client = Arc::new(MemoryObjectClient::new());
        let backend = ObjectStoreBackend::new(client.clone(), "https://cdn.example/bucket/");
        (client, backend)
    }

    #[tokio::test]
    async fn test_put_get_list() {
        let (client, backend) = backend();
        let a = ObjectLocator::new("j", "b.docx").unwrap();
        let b = ObjectLocator::new("j", "a.docx").unwrap();
        let other = ObjectLocator::new("jj", "a.docx").unwrap();

        backend.put(&a, b"a").await.unwrap();
        backend.put(&b, b"b").await.unwrap();
        backend.put(&other, b"c").await.unwrap();

        assert_eq!(backend.get("j/b.docx").await.unwrap(), b"a");
        // The "j/" prefix must not pick up job "jj".
        assert_eq!(backend.list("j").await.unwrap(), vec!["j/a.docx", "j/b.docx"]);
        assert_eq!(client.object_count(), 3);
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let (_client, backend) = backend();
        assert_eq!(
            backend.get("j/none").await.unwrap_err(),
            StorageError::NotFound {
                key: "j/none".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_injected_failures_are_retryable_and_run_out() {
        let (client, backend) = backend();
        let locator = ObjectLocator::new("j", "x").unwrap();
        client.fail_next(2);

        assert!(backend.put(&locator, b"1").await.unwrap_err().is_retryable());
        assert!(backend.put(&locator, b"1").await.unwrap_err().is_retryable());
        assert!(backend.put(&locator, b"1").await.is_ok());
    }

    #[test]
    fn test_download_reference_uses_base_url() {
        let (_client, backend) = backend();
        assert_eq!(
            backend.download_reference("j", "j/j.zip"),
            "https://cdn.example/bucket/j/j.zip"
        );
        assert!(backend.local_path("j/j.zip").is_none());
        assert_eq!(backend.name(), "memory");
    }
}
