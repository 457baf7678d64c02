//! Bundles a job's converted outputs into one zip stored next to them.

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::StorageError;
use crate::sanitize::key_base_name;
use crate::storage::{ObjectLocator, StorageBackend};

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Nothing to archive for job {0}")]
    Empty(String),

    #[error("Failed to prepare staging area: {0}")]
    Staging(#[source] std::io::Error),

    #[error("Failed to fetch '{key}': {source}")]
    Fetch {
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("Failed to write archive: {0}")]
    Pack(String),

    #[error("Failed to store archive: {0}")]
    Upload(#[source] StorageError),
}

/// One completed conversion to include.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveMember {
    pub file_id: String,
    pub output_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveArtifact {
    pub key: String,
    pub download_reference: String,
}

/// Entry names inside the zip, in member order.
///
/// The first member with a given base name keeps it; later ones are
/// prefixed with their file id.
pub fn member_names(members: &[ArchiveMember]) -> Vec<String> {
    let mut used = HashSet::new();
    members
        .iter()
        .map(|m| {
            let base = key_base_name(&m.output_key);
            let name = if used.contains(base) {
                format!("{}_{}", m.file_id, base)
            } else {
                base.to_string()
            };
            used.insert(name.clone());
            name
        })
        .collect()
}

fn write_zip(dest: &Path, entries: &[(String, PathBuf)]) -> Result<(), ArchiveError> {
    let file = File::create(dest).map_err(ArchiveError::Staging)?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for (name, path) in entries {
        writer
            .start_file(name.as_str(), options)
            .map_err(|e| ArchiveError::Pack(e.to_string()))?;
        let mut source = File::open(path).map_err(ArchiveError::Staging)?;
        std::io::copy(&mut source, &mut writer).map_err(|e| ArchiveError::Pack(e.to_string()))?;
    }

    writer
        .finish()
        .map_err(|e| ArchiveError::Pack(e.to_string()))?;
    Ok(())
}

pub struct Archiver {
    storage: Arc<dyn StorageBackend>,
}

impl Archiver {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Packs `members` into `<job_id>/<job_id>.zip` and returns where to download it.
    ///
    /// The staging directory is removed whether or not this succeeds.
    pub async fn archive(
        &self,
        job_id: &str,
        members: &[ArchiveMember],
    ) -> Result<ArchiveArtifact, ArchiveError> {
        if members.is_empty() {
            return Err(ArchiveError::Empty(job_id.to_string()));
        }

        let staging = tempfile::Builder::new()
            .prefix("docbatch-archive-")
            .tempdir()
            .map_err(ArchiveError::Staging)?;

        let names = member_names(members);
        let mut entries = Vec::with_capacity(members.len());
        for (index, (member, name)) in members.iter().zip(names).enumerate() {
            let path = self
                .materialize(&member.output_key, staging.path(), index)
                .await?;
            entries.push((name, path));
        }

        let zip_path = staging.path().join(format!("{}.zip", job_id));
        let task_path = zip_path.clone();
        tokio::task::spawn_blocking(move || write_zip(&task_path, &entries))
            .await
            .map_err(|e| ArchiveError::Pack(e.to_string()))??;

        let bytes = tokio::fs::read(&zip_path)
            .await
            .map_err(ArchiveError::Staging)?;
        let locator = ObjectLocator::new(job_id, &format!("{}.zip", job_id))
            .map_err(ArchiveError::Upload)?;
        let key = self
            .storage
            .put(&locator, &bytes)
            .await
            .map_err(ArchiveError::Upload)?;

        log::info!(
            "Archived {} outputs for job {} ({} bytes)",
            members.len(),
            job_id,
            bytes.len()
        );

        Ok(ArchiveArtifact {
            download_reference: self.storage.download_reference(job_id, &key),
            key,
        })
    }

    async fn materialize(
        &self,
        key: &str,
        staging: &Path,
        index: usize,
    ) -> Result<PathBuf, ArchiveError> {
        if let Some(path) = self.storage.local_path(key) {
            if tokio::fs::metadata(&path).await.is_ok() {
                return Ok(path);
            }
            return Err(ArchiveError::Fetch {
                key: key.to_string(),
                source: StorageError::NotFound {
                    key: key.to_string(),
                },
            });
        }

        let dest = staging.join(format!("{}_{}", index, key_base_name(key)));
        self.storage
            .fetch_to(key, &dest)
            .await
            .map_err(|source| ArchiveError::Fetch {
                key: key.to_string(),
                source,
            })?;
        Ok(dest)
    }
}
