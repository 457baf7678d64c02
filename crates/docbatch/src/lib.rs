pub mod archive;
pub mod config;
pub mod converter;
pub mod db;
pub mod error;
pub mod intake;
pub mod model;
pub mod orchestrator;
pub mod sanitize;
pub mod secrets;
pub mod storage;
pub mod worker;

#[cfg(test)]
mod testing;

pub use archive::{ArchiveError, Archiver};
pub use config::{load_config, Config, StorageConfig};
pub use converter::{ConversionOutcome, ConversionRequest, Converter, ProcessConverter};
pub use db::{Database, DatabaseError};
pub use error::{ConfigError, DocbatchError, Result, StorageError, WorkerError};
pub use intake::{Intake, Upload};
pub use model::{FileConversion, Job, NewFileConversion, Status};
pub use orchestrator::{
    BarrierOutcome, DispatchOutcome, JobStatusReport, Orchestrator, OrchestratorError,
    ReportedStatus, StartedJob, UnfinishedWork,
};
pub use secrets::{SecretError, SecretSource};
pub use storage::{build_storage, ObjectLocator, StorageBackend};
pub use worker::{PoolOptions, Task, TaskOutcome, TaskReport, WorkQueue, WorkerPool};
