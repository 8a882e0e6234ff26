use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::job::GridTask;
use crate::{JobId, NodeId, TaskId};

/// A task as it travels on the task queue, tagged with its job and id.
#[derive(Clone)]
pub struct TaskEnvelope {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub task: Arc<dyn GridTask>,
}

impl fmt::Debug for TaskEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskEnvelope")
            .field("job_id", &self.job_id)
            .field("task_id", &self.task_id)
            .finish_non_exhaustive()
    }
}

/// How a task execution ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    Success(Bytes),
    /// The rendered failure cause.
    Failure(String),
}

/// What a worker reports back for one task execution.
#[derive(Clone, Debug)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub worker_id: NodeId,
    pub outcome: TaskOutcome,
    pub duration: Duration,
}

impl TaskResult {
    pub fn success(task_id: TaskId, worker_id: NodeId, payload: Bytes, duration: Duration) -> Self {
        Self {
            task_id,
            worker_id,
            outcome: TaskOutcome::Success(payload),
            duration,
        }
    }

    pub fn failure(
        task_id: TaskId,
        worker_id: NodeId,
        cause: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            task_id,
            worker_id,
            outcome: TaskOutcome::Failure(cause.into()),
            duration,
        }
    }

    /// Wrap the return value of a task body.
    pub fn from_execution(
        task_id: TaskId,
        worker_id: NodeId,
        outcome: anyhow::Result<Bytes>,
        duration: Duration,
    ) -> Self {
        match outcome {
            Ok(payload) => Self::success(task_id, worker_id, payload, duration),
            Err(err) => Self::failure(task_id, worker_id, format!("{err:#}"), duration),
        }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, TaskOutcome::Success(_))
    }
}
