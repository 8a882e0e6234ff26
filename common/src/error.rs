use std::time::Duration;

use thiserror::Error;

use crate::JobId;

/// Errors surfaced by the grid to submitters and workers.
///
/// Task-level failures are not represented here: they are carried inside
/// [`crate::task::TaskResult`] and only reach a submitter if they end up
/// exhausting every worker of a job.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GridError {
    /// Submission refused (bad archive digest, unsupported job kind).
    #[error("job rejected: {0}")]
    Rejected(String),

    /// A worker asked for a job it is not allowed to take part in.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid job id: {0}")]
    InvalidJob(JobId),

    /// The job could not be decomposed into tasks.
    #[error("split failed: {0}")]
    Split(String),

    /// Aggregation or task execution failed.
    #[error("execution failed: {0}")]
    Execution(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Every participating worker was banned from the job.
    #[error("all workers lost")]
    AllWorkersLost,

    /// The job reached the failed state; carries the stored cause.
    #[error("job failed: {0}")]
    JobFailed(Box<GridError>),

    #[error("job {0} already finished")]
    AlreadyFinished(JobId),

    #[error("channel error: {0}")]
    Channel(String),
}

impl GridError {
    /// Render an [`anyhow::Error`] with its whole context chain.
    pub fn describe(err: &anyhow::Error) -> String {
        format!("{err:#}")
    }
}

pub type GridResult<T> = std::result::Result<T, GridError>;
