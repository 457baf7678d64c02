//! Job orchestration: the job and file-conversion state machines and the
//! fan-in barrier that archives a job once all of its files are done.
//!
//! Every transition is a conditional update in the database, so the barrier
//! holds across worker threads and across processes sharing the same file.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use uuid::Uuid;

use crate::archive::{ArchiveMember, Archiver};
use crate::converter::{ConversionOutcome, ConversionRequest, Converter};
use crate::db::{file_conversion_repo, job_repo, Database, DatabaseError};
use crate::model::{FileConversion, Job, NewFileConversion, Status};
use crate::storage::StorageBackend;

pub mod error;
pub mod status;

pub use error::OrchestratorError;
pub use status::{FileStatusReport, JobStatusReport, ReportedStatus};

const DEFAULT_ARCHIVE_LEASE: Duration = Duration::from_secs(900);

/// Identifiers handed back when a job is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedJob {
    pub job_id: String,
    pub file_ids: Vec<String>,
    pub file_count: usize,
}

/// Work recorded in the database that no queue is known to hold.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnfinishedWork {
    /// Conversions still `pending` or `in_progress`.
    pub file_ids: Vec<String>,
    /// Open jobs whose files are all terminal.
    pub archive_job_ids: Vec<String>,
}

impl UnfinishedWork {
    pub fn is_empty(&self) -> bool {
        self.file_ids.is_empty() && self.archive_job_ids.is_empty()
    }
}

/// Result of evaluating the fan-in barrier for a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BarrierOutcome {
    /// Some files are still pending or in progress.
    Waiting { remaining: u64 },
    /// Another evaluator holds the archive claim.
    Contended,
    /// The job was already terminal.
    AlreadyFinished(Status),
    /// This evaluator archived the job.
    Archived { download_url: String },
    /// No file converted; the job was failed without an archive.
    JobFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The file had already reached a terminal state; nothing was done.
    AlreadyTerminal,
    /// The outcome was recorded and the barrier evaluated.
    Recorded {
        outcome: ConversionOutcome,
        barrier: BarrierOutcome,
    },
}

enum FileClaim {
    Missing,
    Terminal,
    Ready(FileConversion),
}

enum BarrierDecision {
    Missing,
    Settled(BarrierOutcome),
    Won(Vec<ArchiveMember>),
}

/// A fresh claim token and lease window for one barrier evaluation.
struct ArchiveClaim {
    token: String,
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl ArchiveClaim {
    fn new(lease: chrono::Duration) -> Self {
        let now = Utc::now();
        Self {
            token: Uuid::new_v4().to_string(),
            now,
            expires_at: now + lease,
        }
    }

    /// Runs inside the caller's transaction. Takes the archive claim when
    /// every file is terminal and nobody else holds it.
    fn decide(&self, conn: &Connection, job_id: &str) -> Result<BarrierDecision, DatabaseError> {
        let Some(job) = job_repo::find_by_id(conn, job_id)? else {
            return Ok(BarrierDecision::Missing);
        };
        if job.status.is_terminal() {
            return Ok(BarrierDecision::Settled(BarrierOutcome::AlreadyFinished(
                job.status,
            )));
        }

        let remaining = file_conversion_repo::count_unfinished(conn, job_id)?;
        if remaining > 0 {
            return Ok(BarrierDecision::Settled(BarrierOutcome::Waiting { remaining }));
        }

        if !job_repo::try_claim_archive(conn, job_id, &self.token, &self.now, &self.expires_at)? {
            return Ok(BarrierDecision::Settled(BarrierOutcome::Contended));
        }
        job_repo::mark_in_progress(conn, job_id, &self.now)?;

        let members = file_conversion_repo::list_by_job(conn, job_id)?
            .into_iter()
            .filter_map(|f| match (f.status, f.output_key) {
                (Status::Completed, Some(output_key)) => Some(ArchiveMember {
                    file_id: f.id,
                    output_key,
                }),
                _ => None,
            })
            .collect();
        Ok(BarrierDecision::Won(members))
    }
}

pub struct Orchestrator {
    db: Database,
    storage: Arc<dyn StorageBackend>,
    converter: Arc<dyn Converter>,
    archiver: Archiver,
    archive_lease: chrono::Duration,
}

impl Orchestrator {
    pub fn new(
        db: Database,
        storage: Arc<dyn StorageBackend>,
        converter: Arc<dyn Converter>,
    ) -> Self {
        Self {
            db,
            archiver: Archiver::new(storage.clone()),
            storage,
            converter,
            archive_lease: lease(DEFAULT_ARCHIVE_LEASE),
        }
    }

    /// How long a barrier winner may hold the archive claim before another
    /// evaluator is allowed to take over.
    pub fn with_archive_lease(mut self, lease_for: Duration) -> Self {
        self.archive_lease = lease(lease_for);
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// Creates a job with a fresh id.
    pub fn start(&self, files: Vec<NewFileConversion>) -> Result<StartedJob, OrchestratorError> {
        self.start_with_id(&Uuid::new_v4().to_string(), files)
    }

    /// Creates a job and all of its file conversions in one transaction.
    pub fn start_with_id(
        &self,
        job_id: &str,
        files: Vec<NewFileConversion>,
    ) -> Result<StartedJob, OrchestratorError> {
        if job_id.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "job id must not be empty".to_string(),
            ));
        }
        if files.is_empty() {
            return Err(OrchestratorError::Validation(
                "a job needs at least one file".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for file in &files {
            if file.id.is_empty() || file.file_name.trim().is_empty() || file.input_key.is_empty()
            {
                return Err(OrchestratorError::Validation(format!(
                    "file '{}' is missing a name, id or input location",
                    file.file_name
                )));
            }
            if !seen.insert(file.id.as_str()) {
                return Err(OrchestratorError::Validation(format!(
                    "duplicate file id {}",
                    file.id
                )));
            }
        }

        let now = Utc::now();
        let job = Job {
            id: job_id.to_string(),
            status: Status::Pending,
            created_at: now,
            updated_at: now,
            download_url: None,
            archive_key: None,
        };

        self.db.with_transaction(|tx| {
            job_repo::insert(tx, &job)?;
            for file in &files {
                file_conversion_repo::insert(
                    tx,
                    &FileConversion {
                        id: file.id.clone(),
                        job_id: job.id.clone(),
                        file_name: file.file_name.clone(),
                        input_key: file.input_key.clone(),
                        output_key: None,
                        status: Status::Pending,
                        error_message: None,
                        attempts: 0,
                        created_at: now,
                        updated_at: now,
                    },
                )?;
            }
            Ok(())
        })?;

        log::info!("Started job {} with {} files", job.id, files.len());

        Ok(StartedJob {
            job_id: job.id,
            file_count: files.len(),
            file_ids: files.into_iter().map(|f| f.id).collect(),
        })
    }

    /// Converts one file and records the outcome.
    ///
    /// Safe to call again for the same file: a terminal file is left alone.
    /// A transient storage or database error is returned with the file
    /// still open so the caller can redeliver.
    pub async fn dispatch(&self, file_id: &str) -> Result<DispatchOutcome, OrchestratorError> {
        let now = Utc::now();
        let claim = self.db.with_transaction(|tx| {
            let Some(fc) = file_conversion_repo::find_by_id(tx, file_id)? else {
                return Ok(FileClaim::Missing);
            };
            if !file_conversion_repo::mark_in_progress(tx, file_id, &now)? {
                return Ok(FileClaim::Terminal);
            }
            if job_repo::mark_in_progress(tx, &fc.job_id, &now)? {
                log::info!("Job {} is in progress", fc.job_id);
            }
            Ok(FileClaim::Ready(fc))
        })?;

        let fc = match claim {
            FileClaim::Missing => return Err(OrchestratorError::file_not_found(file_id)),
            FileClaim::Terminal => {
                log::debug!("File {} already finished, skipping", file_id);
                return Ok(DispatchOutcome::AlreadyTerminal);
            }
            FileClaim::Ready(fc) => fc,
        };

        let request = ConversionRequest {
            job_id: fc.job_id.clone(),
            file_id: fc.id.clone(),
            file_name: fc.file_name.clone(),
            input_key: fc.input_key.clone(),
        };
        let outcome = self.converter.convert(&request).await?;

        self.record_outcome(&fc.job_id, &fc.id, outcome).await
    }

    /// Fails a file whose task will not be redelivered again.
    pub async fn abandon(
        &self,
        file_id: &str,
        reason: &str,
    ) -> Result<DispatchOutcome, OrchestratorError> {
        let fc = self
            .db
            .with_conn(|conn| file_conversion_repo::find_by_id(conn, file_id))?
            .ok_or_else(|| OrchestratorError::file_not_found(file_id))?;

        log::warn!("Abandoning file {} of job {}: {}", fc.id, fc.job_id, reason);
        self.record_outcome(&fc.job_id, &fc.id, ConversionOutcome::failed(reason))
            .await
    }

    /// Records the file's terminal status and evaluates the barrier in the
    /// same transaction, so a recorded file never leaves the barrier
    /// unevaluated. Archiving runs after the commit.
    async fn record_outcome(
        &self,
        job_id: &str,
        file_id: &str,
        outcome: ConversionOutcome,
    ) -> Result<DispatchOutcome, OrchestratorError> {
        let claim = ArchiveClaim::new(self.archive_lease);
        let decision = self.db.with_transaction(|tx| {
            let changed = match &outcome {
                ConversionOutcome::Succeeded { output_key } => {
                    file_conversion_repo::complete(tx, file_id, output_key, &claim.now)?
                }
                ConversionOutcome::Failed { error } => {
                    file_conversion_repo::fail(tx, file_id, error, &claim.now)?
                }
            };
            // Only the transition that actually moved the row evaluates the barrier.
            if !changed {
                return Ok(None);
            }
            claim.decide(tx, job_id).map(Some)
        })?;

        let Some(decision) = decision else {
            return Ok(DispatchOutcome::AlreadyTerminal);
        };

        match &outcome {
            ConversionOutcome::Succeeded { output_key } => {
                log::info!("File {} of job {} converted: {}", file_id, job_id, output_key)
            }
            ConversionOutcome::Failed { error } => {
                log::warn!("File {} of job {} failed: {}", file_id, job_id, error)
            }
        }

        let barrier = self.settle(job_id, &claim, decision).await?;
        Ok(DispatchOutcome::Recorded { outcome, barrier })
    }

    /// Fan-in barrier: archives the job if every file is terminal and no
    /// other evaluator got there first.
    pub async fn on_file_terminal(&self, job_id: &str) -> Result<BarrierOutcome, OrchestratorError> {
        let claim = ArchiveClaim::new(self.archive_lease);
        let decision = self.db.with_transaction(|tx| claim.decide(tx, job_id))?;
        self.settle(job_id, &claim, decision).await
    }

    /// Acts on a committed barrier decision. Once the claim is held, every
    /// failure releases it and comes back as the retryable `ArchiveFailed`.
    async fn settle(
        &self,
        job_id: &str,
        claim: &ArchiveClaim,
        decision: BarrierDecision,
    ) -> Result<BarrierOutcome, OrchestratorError> {
        let members = match decision {
            BarrierDecision::Missing => return Err(OrchestratorError::job_not_found(job_id)),
            BarrierDecision::Settled(outcome) => {
                log::debug!("Barrier for job {}: {:?}", job_id, outcome);
                return Ok(outcome);
            }
            BarrierDecision::Won(members) => members,
        };

        if members.is_empty() {
            let failed = self
                .db
                .with_conn(|conn| job_repo::fail(conn, job_id, &claim.token, &Utc::now()))
                .map_err(|e| self.give_up_claim(job_id, claim, e.to_string()))?;
            if !failed {
                return Err(OrchestratorError::BarrierRace(job_id.to_string()));
            }
            log::warn!("Job {} failed: no file converted successfully", job_id);
            return Ok(BarrierOutcome::JobFailed);
        }

        log::info!("Archiving {} outputs for job {}", members.len(), job_id);

        let artifact = self
            .archiver
            .archive(job_id, &members)
            .await
            .map_err(|e| self.give_up_claim(job_id, claim, e.to_string()))?;

        let completed = self
            .db
            .with_conn(|conn| {
                job_repo::complete(
                    conn,
                    job_id,
                    &claim.token,
                    &artifact.download_reference,
                    &artifact.key,
                    &Utc::now(),
                )
            })
            .map_err(|e| self.give_up_claim(job_id, claim, e.to_string()))?;
        if !completed {
            return Err(OrchestratorError::BarrierRace(job_id.to_string()));
        }

        log::info!("Job {} completed, archive at {}", job_id, artifact.key);
        Ok(BarrierOutcome::Archived {
            download_url: artifact.download_reference,
        })
    }

    fn give_up_claim(
        &self,
        job_id: &str,
        claim: &ArchiveClaim,
        reason: String,
    ) -> OrchestratorError {
        log::error!("Archiving job {} failed: {}", job_id, reason);
        if let Err(release) = self
            .db
            .with_conn(|conn| job_repo::release_archive_claim(conn, job_id, &claim.token))
        {
            log::warn!("Could not release archive claim on {}: {}", job_id, release);
        }
        OrchestratorError::ArchiveFailed {
            job_id: job_id.to_string(),
            reason,
        }
    }

    /// Re-runs the barrier for a job whose archiving failed earlier.
    pub async fn retry_archive(&self, job_id: &str) -> Result<BarrierOutcome, OrchestratorError> {
        log::info!("Retrying archive for job {}", job_id);
        self.on_file_terminal(job_id).await
    }

    /// Status snapshot. Never fails: unknown ids and read errors are
    /// reported in the returned value.
    pub fn status(&self, job_id: &str) -> JobStatusReport {
        let snapshot = self.db.with_conn(|conn| {
            let Some(job) = job_repo::find_by_id(conn, job_id)? else {
                return Ok(None);
            };
            let files = file_conversion_repo::list_by_job(conn, job_id)?;
            Ok(Some((job, files)))
        });

        match snapshot {
            Ok(Some((job, files))) => JobStatusReport::from_job(&job, &files),
            Ok(None) => JobStatusReport::not_found(job_id),
            Err(e) => {
                log::error!("Failed to read status of job {}: {}", job_id, e);
                JobStatusReport::error(job_id)
            }
        }
    }

    /// Most recently created jobs, newest first.
    pub fn list_jobs(&self, limit: u32) -> Result<Vec<Job>, OrchestratorError> {
        Ok(self.db.with_conn(|conn| job_repo::list_recent(conn, limit))?)
    }

    /// Bytes of a completed job's archive.
    pub async fn download_archive(&self, job_id: &str) -> Result<Vec<u8>, OrchestratorError> {
        let job = self
            .db
            .with_conn(|conn| job_repo::find_by_id(conn, job_id))?
            .ok_or_else(|| OrchestratorError::job_not_found(job_id))?;

        match (job.status, job.archive_key) {
            (Status::Completed, Some(key)) => Ok(self.storage.get(&key).await?),
            (status, _) => Err(OrchestratorError::Validation(format!(
                "job {} has no archive (status {})",
                job_id, status
            ))),
        }
    }

    /// Everything a restarted process has to queue again to bring every job
    /// to a terminal status.
    pub fn unfinished_work(&self) -> Result<UnfinishedWork, OrchestratorError> {
        let work = self.db.with_conn(|conn| {
            Ok(UnfinishedWork {
                file_ids: file_conversion_repo::list_unfinished_ids(conn)?,
                archive_job_ids: job_repo::list_awaiting_barrier(conn)?,
            })
        })?;
        Ok(work)
    }

    /// Removes a job and its file conversions. Stored objects are kept.
    pub fn delete_job(&self, job_id: &str) -> Result<bool, OrchestratorError> {
        let deleted = self.db.with_conn(|conn| job_repo::delete(conn, job_id))?;
        if deleted {
            log::info!("Deleted job {}", job_id);
        }
        Ok(deleted)
    }
}

fn lease(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::seconds(900))
}
