//! Isolated environment for end-to-end tests.

#![allow(dead_code)]

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use docbatch::converter::{ConversionOutcome, ConversionRequest, Converter};
use docbatch::error::{StorageError, WorkerError};
use docbatch::storage::{LocalStorage, MemoryObjectClient, ObjectStoreBackend};
use docbatch::{
    Database, Intake, ObjectLocator, Orchestrator, PoolOptions, StartedJob, StorageBackend, Task,
    TaskReport, UnfinishedWork, Upload, WorkQueue, WorkerPool,
};

pub const PUBLIC_BASE_URL: &str = "http://localhost:8088";
pub const BUCKET_URL: &str = "https://docs.example";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Local,
    Remote,
}

/// Copies the input to `converted/<file_id>/<stem>.pdf`. Names containing
/// "corrupt" fail.
pub struct StubConverter {
    storage: Arc<dyn StorageBackend>,
}

impl StubConverter {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl Converter for StubConverter {
    async fn convert(&self, request: &ConversionRequest) -> Result<ConversionOutcome, StorageError> {
        if request.file_name.contains("corrupt") {
            return Ok(ConversionOutcome::failed("unreadable document"));
        }
        let bytes = self.storage.get(&request.input_key).await?;
        let stem = request
            .file_name
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(&request.file_name);
        let locator = ObjectLocator::new(
            &request.job_id,
            &format!("converted/{}/{}.pdf", request.file_id, stem),
        )?;
        Ok(ConversionOutcome::succeeded(
            self.storage.put(&locator, &bytes).await?,
        ))
    }
}

/// Queue that only records what was submitted.
#[derive(Default)]
pub struct RecordingQueue {
    pub tasks: Mutex<Vec<Task>>,
}

impl WorkQueue for RecordingQueue {
    fn submit(&self, task: Task) -> Result<(), WorkerError> {
        self.tasks.lock().unwrap().push(task);
        Ok(())
    }
}

pub struct TestHarness {
    temp_dir: TempDir,
    pub backend: Backend,
    pub db_path: PathBuf,
    pub storage: Arc<dyn StorageBackend>,
    /// Set for the remote backend.
    pub bucket: Option<Arc<MemoryObjectClient>>,
    pub orchestrator: Arc<Orchestrator>,
}

impl TestHarness {
    pub fn new(backend: Backend) -> Self {
        Self::with_converter(backend, |storage| -> Arc<dyn Converter> {
            Arc::new(StubConverter::new(storage))
        })
    }

    pub fn with_converter<F>(backend: Backend, make_converter: F) -> Self
    where
        F: FnOnce(Arc<dyn StorageBackend>) -> Arc<dyn Converter>,
    {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("docbatch.db");

        let bucket = match backend {
            Backend::Local => None,
            Backend::Remote => Some(Arc::new(MemoryObjectClient::new())),
        };
        let storage: Arc<dyn StorageBackend> = match &bucket {
            None => Arc::new(LocalStorage::new(
                temp_dir.path().join("objects"),
                PUBLIC_BASE_URL,
            )),
            Some(client) => Arc::new(ObjectStoreBackend::new(client.clone(), BUCKET_URL)),
        };

        let converter = make_converter(storage.clone());
        let db = Database::open(&db_path).expect("Failed to open database");
        let orchestrator = Arc::new(Orchestrator::new(db, storage.clone(), converter));

        Self {
            temp_dir,
            backend,
            db_path,
            storage,
            bucket,
            orchestrator,
        }
    }

    /// Another orchestrator on its own connection to the same database and
    /// storage, as a second process would have.
    pub fn second_orchestrator(&self) -> Arc<Orchestrator> {
        let db = Database::open(&self.db_path).expect("Failed to open database");
        Arc::new(Orchestrator::new(
            db,
            self.storage.clone(),
            Arc::new(StubConverter::new(self.storage.clone())),
        ))
    }

    /// Stores the uploads and creates the job without running anything.
    pub async fn enqueue(&self, uploads: Vec<Upload>) -> StartedJob {
        let queue = RecordingQueue::default();
        Intake::new(self.orchestrator.clone())
            .submit(uploads, &queue)
            .await
            .expect("intake failed")
    }

    /// Submits a batch through the worker pool and waits until every task
    /// has finished.
    pub async fn run(&self, uploads: Vec<Upload>) -> (StartedJob, Vec<TaskReport>) {
        let pool = self.pool(4);
        let started = Intake::new(self.orchestrator.clone())
            .submit(uploads, &pool)
            .await
            .expect("intake failed");
        let reports = drain(pool);
        (started, reports)
    }

    /// Submits a batch to a single-worker pool and shuts the pool down after
    /// `finished` deliveries, dropping whatever is still queued.
    pub async fn run_interrupted(&self, uploads: Vec<Upload>, finished: usize) -> StartedJob {
        let pool = self.pool(1);
        let started = Intake::new(self.orchestrator.clone())
            .submit(uploads, &pool)
            .await
            .expect("intake failed");
        for _ in 0..finished {
            pool.recv_result_timeout(Duration::from_secs(10))
                .expect("no report before interruption");
        }
        pool.shutdown();
        pool.wait();
        started
    }

    /// Queues the unfinished work recorded in the database on a fresh pool
    /// and waits for it, as a restarted process would.
    pub fn resume(&self) -> (UnfinishedWork, Vec<TaskReport>) {
        let pool = self.pool(4);
        let work = Intake::new(self.orchestrator.clone())
            .resume(&pool)
            .expect("resume failed");
        (work, drain(pool))
    }

    /// Runs the given tasks through a fresh pool.
    pub fn run_tasks(&self, tasks: Vec<Task>) -> Vec<TaskReport> {
        let pool = self.pool(4);
        for task in tasks {
            pool.submit(task).expect("submit failed");
        }
        drain(pool)
    }

    fn pool(&self, worker_count: usize) -> WorkerPool {
        WorkerPool::new(
            self.orchestrator.clone(),
            PoolOptions {
                worker_count,
                max_attempts: 3,
                retry_backoff: Duration::from_millis(10),
            },
        )
        .expect("Failed to start worker pool")
    }

    /// Entry names of a completed job's archive, sorted.
    pub async fn archive_members(&self, job_id: &str) -> Vec<String> {
        let bytes = self
            .orchestrator
            .download_archive(job_id)
            .await
            .expect("archive missing");
        let archive = zip::ZipArchive::new(Cursor::new(bytes)).expect("invalid zip");
        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        names
    }

    pub fn object_count(&self) -> usize {
        match &self.bucket {
            Some(client) => client.object_count(),
            None => walkdir::WalkDir::new(self.temp_dir.path().join("objects"))
                .into_iter()
                .filter_map(Result::ok)
                .filter(|e| e.file_type().is_file())
                .count(),
        }
    }
}

fn drain(pool: WorkerPool) -> Vec<TaskReport> {
    let mut reports = Vec::new();
    while pool.outstanding() > 0 {
        if let Some(report) = pool.recv_result_timeout(Duration::from_secs(10)) {
            reports.push(report);
        }
    }
    while let Some(report) = pool.try_recv_result() {
        reports.push(report);
    }
    pool.wait();
    reports
}
