use crate::archive::JobArchive;
use crate::error::GridResult;
use crate::job::JobKind;
use crate::{JobId, NodeId, WorkerProfile};

/// What a worker learns about a job it has been admitted to.
#[derive(Clone, Debug)]
pub struct JobInfo {
    pub job_id: JobId,
    pub owner: NodeId,
    pub kind: JobKind,
    pub archive: Option<JobArchive>,
}

/// A worker's view of a coordinator.
///
/// Also used by a coordinator to forward requests for jobs that belong to a
/// peer cluster.
pub trait JobDirectory: Send + Sync {
    /// Ask to take part in a job.
    fn request_job(&self, job_id: &JobId, worker: &WorkerProfile) -> GridResult<JobInfo>;

    /// Jobs currently accepting workers, oldest first.
    fn active_job_ids(&self) -> Vec<JobId>;
}
