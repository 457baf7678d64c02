//! Read-side view of a job, as handed to callers polling for progress.

use serde::{Deserialize, Serialize};

use crate::model::{FileConversion, Job, Status};

/// Job status as reported to callers.
///
/// Adds `not_found` and `error` to the persisted states; those two never
/// appear in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    NotFound,
    Error,
}

impl From<Status> for ReportedStatus {
    fn from(status: Status) -> Self {
        match status {
            Status::Pending => ReportedStatus::Pending,
            Status::InProgress => ReportedStatus::InProgress,
            Status::Completed => ReportedStatus::Completed,
            Status::Failed => ReportedStatus::Failed,
        }
    }
}

impl std::fmt::Display for ReportedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReportedStatus::Pending => "pending",
            ReportedStatus::InProgress => "in_progress",
            ReportedStatus::Completed => "completed",
            ReportedStatus::Failed => "failed",
            ReportedStatus::NotFound => "not_found",
            ReportedStatus::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStatusReport {
    pub file_name: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusReport {
    pub job_id: String,
    pub status: ReportedStatus,
    /// RFC 3339; empty when the job could not be read.
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    pub files: Vec<FileStatusReport>,
}

impl JobStatusReport {
    pub fn from_job(job: &Job, files: &[FileConversion]) -> Self {
        Self {
            job_id: job.id.clone(),
            status: job.status.into(),
            created_at: job.created_at.to_rfc3339(),
            download_url: job.download_url.clone().filter(|u| !u.is_empty()),
            files: files
                .iter()
                .map(|f| FileStatusReport {
                    file_name: f.file_name.clone(),
                    status: f.status,
                    error_message: f.error_message.clone(),
                })
                .collect(),
        }
    }

    pub fn not_found(job_id: &str) -> Self {
        Self::synthetic(job_id, ReportedStatus::NotFound)
    }

    pub fn error(job_id: &str) -> Self {
        Self::synthetic(job_id, ReportedStatus::Error)
    }

    fn synthetic(job_id: &str, status: ReportedStatus) -> Self {
        Self {
            job_id: job_id.to_string(),
            status,
            created_at: String::new(),
            download_url: None,
            files: Vec::new(),
        }
    }
}
