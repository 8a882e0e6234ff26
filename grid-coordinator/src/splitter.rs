use std::sync::Arc;

use tracing::{debug, error, info, warn};

use common::channel::TaskChannel;
use common::job::SplitAggregateJob;
use common::{GridError, TaskId};

use crate::future::JobState;
use crate::profile::JobProfile;

/// Decomposes a job and puts its tasks on the job's task queue.
#[derive(Clone)]
pub struct Splitter {
    channel: Arc<dyn TaskChannel>,
    profile: Arc<JobProfile>,
}

impl Splitter {
    pub fn new(channel: Arc<dyn TaskChannel>, profile: Arc<JobProfile>) -> Self {
        Self { channel, profile }
    }

    /// Split the job, enqueue every task, then move the job to executing.
    ///
    /// A split error fails the job; nothing is enqueued in that case.
    pub async fn run(&self, job: Arc<dyn SplitAggregateJob>) {
        let profile = &self.profile;
        let job_id = profile.job_id();
        profile.future().set_state(JobState::Initializing);
        info!("Splitting job {job_id}");

        let tasks = match tokio::task::spawn_blocking(move || job.split()).await {
            Ok(Ok(tasks)) => tasks,
            Ok(Err(e)) => {
                error!("Failed to split job {job_id}: {e:#}");
                profile.future().fail(GridError::Split(GridError::describe(&e)));
                return;
            }
            Err(e) => {
                error!("Splitting job {job_id} panicked: {e}");
                profile.future().fail(GridError::Split(e.to_string()));
                return;
            }
        };

        let total = tasks.len();
        for (index, task) in tasks.into_iter().enumerate() {
            if profile.is_stopped() {
                info!("Job {job_id} stopped, abandoning split after {index} of {total} tasks");
                return;
            }

            let task_id = index as TaskId;
            profile.add_task(task_id, task.clone());
            if let Err(e) = self.channel.enqueue(job_id, task_id, task) {
                warn!("Could not enqueue task {task_id} of job {job_id}: {e}");
                return;
            }
        }

        profile.seal(total);
        info!("Job {job_id} split into {total} task(s)");
        profile.future().set_state(JobState::Executing);
    }

    /// Put an outstanding task back on the queue, verbatim.
    ///
    /// Does nothing if the task is no longer outstanding.
    pub fn re_enqueue(&self, task_id: TaskId) -> bool {
        let job_id = self.profile.job_id();
        let Some(task) = self.profile.outstanding_task(task_id) else {
            debug!("Task {task_id} of job {job_id} is not outstanding, not re-enqueuing");
            return false;
        };

        match self.channel.enqueue(job_id, task_id, task) {
            Ok(()) => {
                debug!("Re-enqueued task {task_id} of job {job_id}");
                true
            }
            Err(e) => {
                debug!("Could not re-enqueue task {task_id} of job {job_id}: {e}");
                false
            }
        }
    }
}
