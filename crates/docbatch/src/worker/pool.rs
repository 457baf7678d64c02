use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use tokio::runtime::Runtime;

use crate::config::Config;
use crate::error::WorkerError;
use crate::orchestrator::{Orchestrator, OrchestratorError};
use crate::worker::job::{Task, TaskKind, TaskOutcome, TaskReport};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Where producers hand off work. Delivery is at-least-once: a task may run
/// again after a transient failure, so handlers must be idempotent.
pub trait WorkQueue: Send + Sync {
    fn submit(&self, task: Task) -> Result<(), WorkerError>;
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub worker_count: usize,
    /// Deliveries per task before a transient failure is treated as final.
    pub max_attempts: u32,
    /// Pause before redelivery, multiplied by the attempt number.
    pub retry_backoff: Duration,
}

impl PoolOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            worker_count: config.worker_count,
            max_attempts: config.max_attempts,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

struct WorkerContext {
    worker_id: usize,
    runtime: Runtime,
    orchestrator: Arc<Orchestrator>,
    task_receiver: Receiver<Task>,
    task_sender: Sender<Task>,
    result_sender: Sender<TaskReport>,
    shutdown: Arc<AtomicBool>,
    draining: Arc<AtomicBool>,
    outstanding: Arc<AtomicUsize>,
    max_attempts: u32,
    retry_backoff: Duration,
}

/// Thread pool running conversion and archive tasks.
///
/// Each worker thread drives its tasks on its own current-thread tokio
/// runtime. Transient failures are redelivered through the same channel.
pub struct WorkerPool {
    task_sender: Sender<Task>,
    result_receiver: Receiver<TaskReport>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    draining: Arc<AtomicBool>,
    /// Tasks submitted and not yet finished, redeliveries included.
    outstanding: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Starts `options.worker_count` workers.
    ///
    /// # Panics
    /// Panics if `worker_count` is 0.
    pub fn new(orchestrator: Arc<Orchestrator>, options: PoolOptions) -> Result<Self, WorkerError> {
        assert!(options.worker_count > 0, "worker_count must be > 0");
        let (task_sender, task_receiver) = unbounded::<Task>();
        let (result_sender, result_receiver) = unbounded::<TaskReport>();
        let shutdown = Arc::new(AtomicBool::new(false));
        let draining = Arc::new(AtomicBool::new(false));
        let outstanding = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(options.worker_count);

        for worker_id in 0..options.worker_count {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| WorkerError::Runtime(e.to_string()))?;

            let ctx = WorkerContext {
                worker_id,
                runtime,
                orchestrator: Arc::clone(&orchestrator),
                task_receiver: task_receiver.clone(),
                task_sender: task_sender.clone(),
                result_sender: result_sender.clone(),
                shutdown: Arc::clone(&shutdown),
                draining: Arc::clone(&draining),
                outstanding: Arc::clone(&outstanding),
                max_attempts: options.max_attempts.max(1),
                retry_backoff: options.retry_backoff,
            };

            workers.push(thread::spawn(move || run_worker(ctx)));
        }

        info!("Started {} workers", options.worker_count);

        Ok(Self {
            task_sender,
            result_receiver,
            workers,
            shutdown,
            draining,
            outstanding,
        })
    }

    pub fn submit(&self, task: Task) -> Result<(), WorkerError> {
        if self.shutdown.load(Ordering::Relaxed) || self.draining.load(Ordering::Relaxed) {
            return Err(WorkerError::ChannelClosed);
        }

        self.outstanding.fetch_add(1, Ordering::SeqCst);
        self.task_sender.send(task).map_err(|_| {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
            WorkerError::ChannelClosed
        })
    }

    pub fn try_recv_result(&self) -> Option<TaskReport> {
        self.result_receiver.try_recv().ok()
    }

    pub fn recv_result(&self) -> Option<TaskReport> {
        self.result_receiver.recv().ok()
    }

    pub fn recv_result_timeout(&self, timeout: Duration) -> Option<TaskReport> {
        self.result_receiver.recv_timeout(timeout).ok()
    }

    /// Tasks submitted and not yet finished.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Stops workers after their current task; queued tasks are dropped.
    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Stops accepting work, lets every outstanding task (and its
    /// redeliveries) finish, then joins the workers.
    pub fn wait(self) {
        self.draining.store(true, Ordering::SeqCst);

        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }

        info!("All workers have stopped");
    }
}

impl WorkQueue for WorkerPool {
    fn submit(&self, task: Task) -> Result<(), WorkerError> {
        WorkerPool::submit(self, task)
    }
}

/// One delivery's result plus the task to queue next, if any.
struct Step {
    outcome: TaskOutcome,
    next: Option<Task>,
}

impl Step {
    fn done(outcome: TaskOutcome) -> Self {
        Self {
            outcome,
            next: None,
        }
    }

    fn retry(error: &OrchestratorError, next: Task) -> Self {
        Self {
            outcome: TaskOutcome::Retrying {
                error: error.to_string(),
            },
            next: Some(next),
        }
    }

    fn archive_again(job_id: &str, reason: String) -> Self {
        Self {
            outcome: TaskOutcome::Retrying { error: reason },
            next: Some(Task::archive(job_id)),
        }
    }
}

async fn execute(orchestrator: &Orchestrator, task: &Task, max_attempts: u32) -> Step {
    match &task.kind {
        TaskKind::Convert { file_id } => match orchestrator.dispatch(file_id).await {
            Ok(outcome) => Step::done(TaskOutcome::Converted(outcome)),
            // The file's outcome is recorded; only the archive needs another go.
            Err(OrchestratorError::ArchiveFailed { job_id, reason }) => {
                Step::archive_again(&job_id, reason)
            }
            Err(e) if e.is_retryable() && task.attempt < max_attempts => {
                Step::retry(&e, task.redelivery())
            }
            Err(e) if e.is_retryable() => abandon(orchestrator, file_id, task, &e).await,
            Err(e) => Step::done(TaskOutcome::Failed {
                error: e.to_string(),
            }),
        },
        TaskKind::Archive { job_id } => match orchestrator.retry_archive(job_id).await {
            Ok(barrier) => Step::done(TaskOutcome::Archived(barrier)),
            Err(e) if e.is_retryable() && task.attempt < max_attempts => {
                Step::retry(&e, task.redelivery())
            }
            Err(e) if e.is_retryable() => {
                error!(
                    "Giving up on archiving job {} after {} attempts; retry it manually: {}",
                    job_id, task.attempt, e
                );
                Step::done(TaskOutcome::GaveUp {
                    error: e.to_string(),
                })
            }
            Err(e) => Step::done(TaskOutcome::Failed {
                error: e.to_string(),
            }),
        },
    }
}

async fn abandon(
    orchestrator: &Orchestrator,
    file_id: &str,
    task: &Task,
    cause: &OrchestratorError,
) -> Step {
    let reason = OrchestratorError::ConversionFailed {
        file_id: file_id.to_string(),
        reason: format!("gave up after {} attempts: {}", task.attempt, cause),
    }
    .to_string();

    match orchestrator.abandon(file_id, &reason).await {
        Ok(_) => Step::done(TaskOutcome::GaveUp { error: reason }),
        Err(OrchestratorError::ArchiveFailed { job_id, reason }) => {
            Step::archive_again(&job_id, reason)
        }
        Err(e) => Step::done(TaskOutcome::Failed {
            error: e.to_string(),
        }),
    }
}

fn run_worker(ctx: WorkerContext) {
    debug!("Worker {} started", ctx.worker_id);

    loop {
        if ctx.shutdown.load(Ordering::Relaxed) {
            debug!("Worker {} received shutdown signal", ctx.worker_id);
            break;
        }

        match ctx.task_receiver.recv_timeout(POLL_INTERVAL) {
            Ok(task) => {
                debug!("Worker {} running {}", ctx.worker_id, task);

                let step = ctx
                    .runtime
                    .block_on(execute(&ctx.orchestrator, &task, ctx.max_attempts));

                let next = step.next;
                let report = TaskReport {
                    task: task.clone(),
                    outcome: step.outcome,
                };
                if let Err(e) = ctx.result_sender.send(report) {
                    error!("Worker {} failed to send result: {}", ctx.worker_id, e);
                }

                match next {
                    Some(next) => {
                        warn!("Task {} will be redelivered as {}", task, next);
                        if next.attempt > 1 {
                            thread::sleep(ctx.retry_backoff * task.attempt);
                        }
                        // The outstanding count carries over to the follow-up task.
                        if ctx.task_sender.send(next).is_err() {
                            ctx.outstanding.fetch_sub(1, Ordering::SeqCst);
                        }
                    }
                    None => {
                        ctx.outstanding.fetch_sub(1, Ordering::SeqCst);
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if ctx.draining.load(Ordering::SeqCst) && ctx.outstanding.load(Ordering::SeqCst) == 0
                {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                debug!("Worker {} task channel disconnected", ctx.worker_id);
                break;
            }
        }
    }

    debug!("Worker {} stopped", ctx.worker_id);
}
