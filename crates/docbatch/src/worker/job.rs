use crate::orchestrator::{BarrierOutcome, DispatchOutcome};

/// What a task asks a worker to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    /// Convert one file and evaluate its job's barrier.
    Convert { file_id: String },
    /// Re-run the barrier for a job whose archiving failed.
    Archive { job_id: String },
}

/// A unit of queued work. `attempt` starts at 1 and grows on every redelivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub kind: TaskKind,
    pub attempt: u32,
}

impl Task {
    pub fn convert(file_id: &str) -> Self {
        Self::new(TaskKind::Convert {
            file_id: file_id.to_string(),
        })
    }

    pub fn archive(job_id: &str) -> Self {
        Self::new(TaskKind::Archive {
            job_id: job_id.to_string(),
        })
    }

    fn new(kind: TaskKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            attempt: 1,
        }
    }

    /// The same task, delivered once more.
    pub fn redelivery(&self) -> Self {
        Self {
            id: self.id.clone(),
            kind: self.kind.clone(),
            attempt: self.attempt + 1,
        }
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TaskKind::Convert { file_id } => {
                write!(f, "convert {} (attempt {})", file_id, self.attempt)
            }
            TaskKind::Archive { job_id } => {
                write!(f, "archive {} (attempt {})", job_id, self.attempt)
            }
        }
    }
}

/// How one delivery of a task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Converted(DispatchOutcome),
    Archived(BarrierOutcome),
    /// Failed transiently; the task was queued again.
    Retrying { error: String },
    /// Failed transiently too many times; the file was abandoned or the
    /// archive left for a manual retry.
    GaveUp { error: String },
    /// Failed in a way redelivery cannot fix.
    Failed { error: String },
}

#[derive(Debug, Clone)]
pub struct TaskReport {
    pub task: Task,
    pub outcome: TaskOutcome,
}

impl TaskReport {
    /// True once nothing more will happen for this task.
    pub fn is_final(&self) -> bool {
        !matches!(self.outcome, TaskOutcome::Retrying { .. })
    }
}
