//! Accepts a batch of uploaded documents and fans it out to the work queue.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::Result;
use crate::model::NewFileConversion;
use crate::orchestrator::{Orchestrator, OrchestratorError, StartedJob, UnfinishedWork};
use crate::sanitize::sanitize_file_name;
use crate::storage::ObjectLocator;
use crate::worker::{Task, WorkQueue};

/// One uploaded document.
#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl Upload {
    pub fn new(file_name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes: bytes.into(),
        }
    }
}

pub struct Intake {
    orchestrator: Arc<Orchestrator>,
}

impl Intake {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Stores every input, creates the job, and queues one conversion task
    /// per file.
    ///
    /// Inputs land at `<job_id>/<file_id>/<file name>`. If storing an input
    /// fails no job is created. If queueing fails the job exists with its
    /// files still pending, and [`Intake::resume`] picks them up later.
    pub async fn submit(&self, uploads: Vec<Upload>, queue: &dyn WorkQueue) -> Result<StartedJob> {
        if uploads.is_empty() {
            return Err(
                OrchestratorError::Validation("a job needs at least one file".to_string()).into(),
            );
        }

        let job_id = Uuid::new_v4().to_string();
        let storage = self.orchestrator.storage();

        let mut files = Vec::with_capacity(uploads.len());
        for upload in &uploads {
            let file_name = sanitize_file_name(&upload.file_name);
            let mut file = NewFileConversion::new(&file_name, "");
            let locator = ObjectLocator::new(&job_id, &format!("{}/{}", file.id, file_name))?;
            file.input_key = storage.put(&locator, &upload.bytes).await?;
            log::debug!("Stored input {} ({} bytes)", file.input_key, upload.bytes.len());
            files.push(file);
        }

        let started = self.orchestrator.start_with_id(&job_id, files)?;

        for file_id in &started.file_ids {
            queue.submit(Task::convert(file_id)).map_err(|e| {
                log::error!("Failed to queue file {} of job {}: {}", file_id, job_id, e);
                e
            })?;
        }

        log::info!(
            "Queued {} conversions for job {}",
            started.file_count,
            started.job_id
        );
        Ok(started)
    }

    /// Queues again everything the database says is unfinished: a
    /// conversion task per open file and an archive task per job whose
    /// files are all terminal. Work that another live process is running
    /// gets delivered twice, which the handlers absorb.
    pub fn resume(&self, queue: &dyn WorkQueue) -> Result<UnfinishedWork> {
        let work = self.orchestrator.unfinished_work()?;
        if work.is_empty() {
            log::info!("Nothing to resume");
            return Ok(work);
        }

        for file_id in &work.file_ids {
            queue.submit(Task::convert(file_id))?;
        }
        for job_id in &work.archive_job_ids {
            queue.submit(Task::archive(job_id))?;
        }

        log::info!(
            "Resumed {} conversions and {} archive steps",
            work.file_ids.len(),
            work.archive_job_ids.len()
        );
        Ok(work)
    }
}
