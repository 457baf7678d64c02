pub mod job;
pub mod pool;

pub use job::{Task, TaskKind, TaskOutcome, TaskReport};
pub use pool::{PoolOptions, WorkQueue, WorkerPool};
