use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DocbatchError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] crate::orchestrator::OrchestratorError),

    #[error("Secret error: {0}")]
    Secret(#[from] crate::secrets::SecretError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

/// Errors surfaced by a storage backend.
///
/// Only `Unavailable` is worth retrying; the other variants describe
/// conditions that will not change by trying again.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Object not found: {key}")]
    NotFound { key: String },

    #[error("Storage unavailable for '{key}': {reason}")]
    Unavailable { key: String, reason: String },

    #[error("Access denied for '{key}': {reason}")]
    Unauthorized { key: String, reason: String },

    #[error("Storage misconfigured: {0}")]
    Misconfigured(String),
}

impl StorageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Unavailable { .. })
    }

    /// Classifies an IO error raised while touching `key`.
    pub fn from_io(key: &str, err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound {
                key: key.to_string(),
            },
            std::io::ErrorKind::PermissionDenied => StorageError::Unauthorized {
                key: key.to_string(),
                reason: err.to_string(),
            },
            _ => StorageError::Unavailable {
                key: key.to_string(),
                reason: err.to_string(),
            },
        }
    }
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Worker channel closed unexpectedly")]
    ChannelClosed,

    #[error("Failed to start worker runtime: {0}")]
    Runtime(String),
}

pub type Result<T> = std::result::Result<T, DocbatchError>;
