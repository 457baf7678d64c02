use thiserror::Error;

use crate::db::DatabaseError;
use crate::error::StorageError;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conversion of file {file_id} failed: {reason}")]
    ConversionFailed { file_id: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Archiving job {job_id} failed: {reason}")]
    ArchiveFailed { job_id: String, reason: String },

    #[error("Archive claim for job {0} was lost to another worker")]
    BarrierRace(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
}

impl OrchestratorError {
    /// Whether redelivering the task that hit this error may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            OrchestratorError::Storage(e) => e.is_retryable(),
            OrchestratorError::ArchiveFailed { .. } => true,
            OrchestratorError::Database(e) => e.is_retryable(),
            _ => false,
        }
    }

    pub(crate) fn job_not_found(id: &str) -> Self {
        OrchestratorError::NotFound {
            kind: "Job",
            id: id.to_string(),
        }
    }

    pub(crate) fn file_not_found(id: &str) -> Self {
        OrchestratorError::NotFound {
            kind: "File conversion",
            id: id.to_string(),
        }
    }
}
