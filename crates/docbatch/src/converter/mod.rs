//! Per-file conversion.

use async_trait::async_trait;

use crate::error::StorageError;

pub mod process;

pub use process::ProcessConverter;

/// What a converter needs to know about one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionRequest {
    pub job_id: String,
    pub file_id: String,
    pub file_name: String,
    pub input_key: String,
}

/// Final result of converting one file.
///
/// Build values through [`ConversionOutcome::succeeded`] and
/// [`ConversionOutcome::failed`]; they never leave a field empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionOutcome {
    Succeeded { output_key: String },
    Failed { error: String },
}

impl ConversionOutcome {
    pub fn succeeded(output_key: impl Into<String>) -> Self {
        let output_key = output_key.into();
        if output_key.trim().is_empty() {
            return Self::failed("converter reported success without an output location");
        }
        Self::Succeeded { output_key }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        let error = error.into();
        let error = error.trim();
        if error.is_empty() {
            return Self::Failed {
                error: "conversion failed without detail".to_string(),
            };
        }
        Self::Failed {
            error: error.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

/// Converts one stored input into one stored output.
///
/// `Err` is reserved for storage failures worth redelivering the task for;
/// everything else is reported as [`ConversionOutcome::Failed`].
#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(&self, request: &ConversionRequest)
        -> Result<ConversionOutcome, StorageError>;
}
