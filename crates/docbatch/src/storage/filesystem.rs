use std::path::{Path, PathBuf};

use async_trait::async_trait;
use walkdir::WalkDir;

use super::{validate_key, ObjectLocator, StorageBackend};
use crate::error::StorageError;

/// Move a file from `src` to `dst`. Uses `rename` first (atomic on the same
/// filesystem) and falls back to copy + delete across devices.
fn move_file(src: &Path, dst: &Path, key: &str) -> Result<(), StorageError> {
    if std::fs::rename(src, dst).is_ok() {
        return Ok(());
    }

    std::fs::copy(src, dst).map_err(|e| StorageError::from_io(key, &e))?;
    std::fs::remove_file(src).map_err(|e| StorageError::from_io(key, &e))?;
    Ok(())
}

/// Objects stored as plain files below a root directory.
///
/// Key `<job_id>/<name>` lives at `<root>/<job_id>/<name>`.
pub struct LocalStorage {
    root: PathBuf,
    public_base_url: String,
}

impl LocalStorage {
    pub fn new<P: AsRef<Path>>(root: P, public_base_url: &str) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    /// Writes to a sibling temp file and renames it into place, so readers
    /// never see a partially written object.
    fn write_atomic(path: &Path, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        use std::io::Write;

        let dir = path.parent().ok_or_else(|| {
            StorageError::Misconfigured(format!("key '{}' has no parent directory", key))
        })?;
        std::fs::create_dir_all(dir).map_err(|e| StorageError::from_io(key, &e))?;

        let mut tmp =
            tempfile::NamedTempFile::new_in(dir).map_err(|e| StorageError::from_io(key, &e))?;
        tmp.write_all(bytes)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| StorageError::from_io(key, &e))?;

        let (_, tmp_path) = tmp.keep().map_err(|e| StorageError::from_io(key, &e.error))?;
        let moved = move_file(&tmp_path, path, key);
        if moved.is_err() {
            let _ = std::fs::remove_file(&tmp_path);
        }
        moved
    }

    fn list_blocking(root: &Path, job_id: &str) -> Result<Vec<String>, StorageError> {
        let job_dir = root.join(job_id);
        if !job_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        for entry in WalkDir::new(&job_dir).follow_links(false) {
            let entry = entry.map_err(|e| StorageError::Unavailable {
                key: job_id.to_string(),
                reason: e.to_string(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(root) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            // Temp files from an interrupted put are not objects.
            if key.rsplit('/').next().is_some_and(|n| n.starts_with(".tmp")) {
                continue;
            }
            keys.push(key);
        }
        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn put(&self, locator: &ObjectLocator, bytes: &[u8]) -> Result<String, StorageError> {
        let key = locator.key();
        let path = self.path_for(&key)?;
        let data = bytes.to_vec();
        let task_key = key.clone();

        tokio::task::spawn_blocking(move || Self::write_atomic(&path, &task_key, &data))
            .await
            .map_err(|e| StorageError::Unavailable {
                key: key.clone(),
                reason: e.to_string(),
            })??;

        log::debug!("Stored {} ({} bytes)", key, bytes.len());
        Ok(key)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| StorageError::from_io(key, &e))
    }

    async fn fetch_to(&self, key: &str, dest: &Path) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        tokio::fs::copy(&path, dest)
            .await
            .map(|_| ())
            .map_err(|e| StorageError::from_io(key, &e))
    }

    async fn list(&self, job_id: &str) -> Result<Vec<String>, StorageError> {
        validate_key(job_id)?;
        let root = self.root.clone();
        let job = job_id.to_string();
        tokio::task::spawn_blocking(move || Self::list_blocking(&root, &job))
            .await
            .map_err(|e| StorageError::Unavailable {
                key: job_id.to_string(),
                reason: e.to_string(),
            })?
    }

    fn local_path(&self, key: &str) -> Option<PathBuf> {
        self.path_for(key).ok()
    }

    fn download_reference(&self, job_id: &str, _key: &str) -> String {
        format!("{}/api/v1/jobs/{}/download", self.public_base_url, job_id)
    }
}
