use async_trait::async_trait;
use s3::{creds::Credentials, error::S3Error, Bucket, Region};
use secrecy::ExposeSecret;

use super::object_store::ObjectClient;
use crate::config::S3StorageConfig;
use crate::error::StorageError;

/// S3-compatible bucket client (AWS, MinIO, Garage).
pub struct S3ObjectClient {
    bucket: Bucket,
}

impl S3ObjectClient {
    /// Resolves credentials and prepares the bucket handle.
    ///
    /// No request is made here; an unreachable endpoint surfaces on first use.
    pub fn from_config(config: &S3StorageConfig) -> Result<Self, StorageError> {
        let region = match config.endpoint.as_deref().filter(|e| !e.is_empty()) {
            Some(endpoint) => Region::Custom {
                region: config.region.to_owned(),
                endpoint: endpoint.to_owned(),
            },
            None => config
                .region
                .parse::<Region>()
                .map_err(|e| StorageError::Misconfigured(format!("region: {}", e)))?,
        };

        let access_key = config
            .access_key
            .resolve("accessKey")
            .map_err(|e| StorageError::Misconfigured(e.to_string()))?;
        let secret_key = config
            .secret_key
            .resolve("secretKey")
            .map_err(|e| StorageError::Misconfigured(e.to_string()))?;

        let credentials = Credentials::new(
            Some(access_key.expose_secret()),
            Some(secret_key.expose_secret()),
            None,
            None,
            None,
        )
        .map_err(|e| StorageError::Misconfigured(format!("credentials: {}", e)))?;

        let bucket = Bucket::new(&config.bucket, region, credentials)
            .map_err(|e| StorageError::Misconfigured(format!("bucket: {}", e)))?;
        let bucket = if config.endpoint.is_some() {
            bucket.with_path_style()
        } else {
            bucket
        };

        Ok(Self { bucket })
    }
}

/// Maps an S3 failure onto the storage error kinds.
fn classify(key: &str, error: S3Error) -> StorageError {
    match error {
        S3Error::Http(404, _) => StorageError::NotFound {
            key: key.to_string(),
        },
        S3Error::Http(code @ (401 | 403), body) => StorageError::Unauthorized {
            key: key.to_string(),
            reason: format!("HTTP {}: {}", code, body),
        },
        S3Error::Http(code, body) => StorageError::Unavailable {
            key: key.to_string(),
            reason: format!("HTTP {}: {}", code, body),
        },
        other => StorageError::Unavailable {
            key: key.to_string(),
            reason: other.to_string(),
        },
    }
}

#[async_trait]
impl ObjectClient for S3ObjectClient {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn put_object(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.bucket
            .put_object(key, bytes)
            .await
            .map_err(|e| classify(key, e))?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self
            .bucket
            .get_object(key)
            .await
            .map_err(|e| classify(key, e))?;
        Ok(response.to_vec())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let pages = self
            .bucket
            .list(prefix.to_string(), None)
            .await
            .map_err(|e| classify(prefix, e))?;
        Ok(pages
            .into_iter()
            .flat_map(|page| page.contents.into_iter().map(|object| object.key))
            .collect())
    }
}
