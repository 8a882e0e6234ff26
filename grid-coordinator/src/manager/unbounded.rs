use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use common::channel::TaskChannel;
use common::job::{JobDefinition, JobKind, UnboundedJob};
use common::{GridContext, GridError, GridResult, JobId, TaskId};

use crate::collector::{Completion, ResultCollector};
use crate::config::CoordinatorConfig;
use crate::future::JobState;
use crate::manager::ExecutionManager;
use crate::profile::JobProfile;

/// Feeds a job's task stream to the grid, keeping a bounded number of tasks
/// in flight. Results only reach the job's callback.
pub struct UnboundedManager {
    ctx: GridContext,
    config: CoordinatorConfig,
    collectors: DashMap<JobId, Arc<ResultCollector>>,
}

impl UnboundedManager {
    pub fn new(ctx: GridContext, config: CoordinatorConfig) -> Self {
        Self {
            ctx,
            config,
            collectors: DashMap::new(),
        }
    }
}

impl ExecutionManager for UnboundedManager {
    fn kind(&self) -> JobKind {
        JobKind::Unbounded
    }

    fn start(&self, profile: Arc<JobProfile>) -> GridResult<()> {
        let JobDefinition::Unbounded(job) = profile.definition().clone() else {
            return Err(GridError::Rejected(format!(
                "job {} is not an unbounded job",
                profile.job_id()
            )));
        };

        let progress = Arc::new(Notify::new());
        let collector = ResultCollector::start(
            self.ctx.channel.clone(),
            self.ctx.bus.clone(),
            profile.clone(),
            Completion::Drain,
            self.config.ban_threshold,
            Some(progress.clone()),
        )?;
        self.collectors
            .insert(profile.job_id().clone(), collector.clone());

        profile.future().set_state(JobState::Initializing);
        profile.future().set_state(JobState::Executing);
        info!(
            "Starting unbounded job {} with a window of {}",
            profile.job_id(),
            self.config.unbounded_window
        );

        let producer = Producer {
            channel: self.ctx.channel.clone(),
            profile,
            job,
            collector,
            progress,
            window: self.config.unbounded_window,
        };
        tokio::spawn(producer.run());
        Ok(())
    }

    fn cancel(&self, job_id: &JobId) -> bool {
        match self.collectors.remove(job_id) {
            Some((_, collector)) => {
                collector.cancel();
                debug!("Unbounded manager released job {job_id}");
                true
            }
            None => false,
        }
    }
}

struct Producer {
    channel: Arc<dyn TaskChannel>,
    profile: Arc<JobProfile>,
    job: Arc<dyn UnboundedJob>,
    collector: Arc<ResultCollector>,
    progress: Arc<Notify>,
    window: usize,
}

impl Producer {
    async fn run(self) {
        let job_id = self.profile.job_id().clone();
        let mut next_id: TaskId = 0;

        loop {
            while self.profile.outstanding_count() < self.window {
                if self.profile.is_stopped() || self.profile.future().is_done() {
                    debug!("Producer of job {job_id} stopped after {next_id} task(s)");
                    return;
                }

                let job = self.job.clone();
                let task = match tokio::task::spawn_blocking(move || job.next_task()).await {
                    Ok(Ok(Some(task))) => task,
                    Ok(Ok(None)) => {
                        info!("Job {job_id} produced all of its {next_id} task(s)");
                        self.profile.seal(next_id as usize);
                        self.collector.try_complete();
                        return;
                    }
                    Ok(Err(e)) => {
                        error!("Job {job_id} failed to produce task {next_id}: {e:#}");
                        self.profile
                            .future()
                            .fail(GridError::Split(GridError::describe(&e)));
                        return;
                    }
                    Err(e) => {
                        error!("Task producer of job {job_id} panicked: {e}");
                        self.profile.future().fail(GridError::Split(e.to_string()));
                        return;
                    }
                };

                self.profile.add_task(next_id, task.clone());
                if let Err(e) = self.channel.enqueue(&job_id, next_id, task) {
                    warn!("Could not enqueue task {next_id} of job {job_id}: {e}");
                    return;
                }
                next_id += 1;
            }

            tokio::select! {
                _ = self.progress.notified() => {}
                _ = self.collector.closed() => {
                    debug!("Collector of job {job_id} closed, producer exiting");
                    return;
                }
            }
        }
    }
}
