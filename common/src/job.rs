//! Grid application types: jobs, the tasks they split into, and the hooks
//! through which results flow back to a submitter.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::resolver::ResourceResolver;
use crate::{JobId, NodeId, TaskId};

/// A task function takes the execution context and its input payload.
///
/// It returns an [`anyhow::Result`] with the task's output payload.
pub type TaskFn = fn(ctx: &TaskContext, input: Bytes) -> anyhow::Result<Bytes>;

/// One independently executable unit of a job.
pub trait GridTask: Send + Sync {
    fn execute(&self, ctx: &TaskContext) -> anyhow::Result<Bytes>;
}

/// A task built from a plain function and its input.
#[derive(Clone)]
pub struct PayloadTask {
    pub func: TaskFn,
    pub input: Bytes,
}

impl PayloadTask {
    pub fn new(func: TaskFn, input: Bytes) -> Self {
        Self { func, input }
    }

    /// Convenience for building the `Arc` that splitters hand out.
    pub fn shared(func: TaskFn, input: Bytes) -> Arc<dyn GridTask> {
        Arc::new(Self::new(func, input))
    }
}

impl GridTask for PayloadTask {
    fn execute(&self, ctx: &TaskContext) -> anyhow::Result<Bytes> {
        (self.func)(ctx, self.input.clone())
    }
}

/// Everything a task can see about where it runs.
#[derive(Clone)]
pub struct TaskContext {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub worker_id: NodeId,
    resolver: Arc<dyn ResourceResolver>,
}

impl TaskContext {
    pub fn new(
        job_id: JobId,
        task_id: TaskId,
        worker_id: NodeId,
        resolver: Arc<dyn ResourceResolver>,
    ) -> Self {
        Self {
            job_id,
            task_id,
            worker_id,
            resolver,
        }
    }

    /// Load a named resource through the job-scoped resolver chain.
    pub fn resource(&self, name: &str) -> anyhow::Result<Bytes> {
        self.resolver.resolve(&self.job_id, name)
    }
}

/// A job that is split up front and whose results are combined at the end.
pub trait SplitAggregateJob: Send + Sync {
    /// Decompose the job. Task ids are assigned from list positions.
    fn split(&self) -> anyhow::Result<Vec<Arc<dyn GridTask>>>;

    /// Combine every task result, keyed by task id, into the final value.
    fn aggregate(&self, results: BTreeMap<TaskId, Bytes>) -> anyhow::Result<Bytes>;
}

/// A job that produces tasks as a stream.
///
/// Results are handed to the job's [`ResultCallback`] as they arrive and are
/// never aggregated.
pub trait UnboundedJob: Send + Sync {
    /// The next task, or `None` once the stream is exhausted.
    fn next_task(&self) -> anyhow::Result<Option<Arc<dyn GridTask>>>;
}

/// Receives intermediate results of a job, one call per completed task.
pub trait ResultCallback: Send + Sync {
    fn on_result(&self, task_id: TaskId, result: &Bytes) -> anyhow::Result<()>;
}

/// Declared kind of a job, used to pick its execution manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    SplitAggregate,
    Unbounded,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::SplitAggregate => write!(f, "split-aggregate"),
            JobKind::Unbounded => write!(f, "unbounded"),
        }
    }
}

/// The logic of a submitted job.
#[derive(Clone)]
pub enum JobDefinition {
    SplitAggregate(Arc<dyn SplitAggregateJob>),
    Unbounded(Arc<dyn UnboundedJob>),
}

impl JobDefinition {
    pub fn split_aggregate(job: impl SplitAggregateJob + 'static) -> Self {
        JobDefinition::SplitAggregate(Arc::new(job))
    }

    pub fn unbounded(job: impl UnboundedJob + 'static) -> Self {
        JobDefinition::Unbounded(Arc::new(job))
    }

    pub fn kind(&self) -> JobKind {
        match self {
            JobDefinition::SplitAggregate(_) => JobKind::SplitAggregate,
            JobDefinition::Unbounded(_) => JobKind::Unbounded,
        }
    }
}

impl fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobDefinition({})", self.kind())
    }
}
