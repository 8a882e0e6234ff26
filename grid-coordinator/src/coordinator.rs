//! Job admission, routing and bookkeeping.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::archive::JobArchive;
use common::directory::{JobDirectory, JobInfo};
use common::events::GridEvent;
use common::job::{JobDefinition, ResultCallback};
use common::{GridContext, GridError, GridResult, JobId, NodeId, WorkerProfile};

use crate::config::CoordinatorConfig;
use crate::future::{JobCanceller, JobFuture, JobState};
use crate::manager::{ExecutionManager, ManagerRegistry};
use crate::profile::JobProfile;
use crate::proxy::ClientJobFuture;
use crate::splitter::Splitter;

/// A job as handed in by its owner.
pub struct JobRequest {
    owner: NodeId,
    definition: JobDefinition,
    archive: Option<JobArchive>,
    callback: Option<Arc<dyn ResultCallback>>,
}

impl JobRequest {
    pub fn new(owner: NodeId, definition: JobDefinition) -> Self {
        Self {
            owner,
            definition,
            archive: None,
            callback: None,
        }
    }

    pub fn with_archive(mut self, archive: JobArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Receive every intermediate result as it arrives.
    pub fn with_callback(mut self, callback: Arc<dyn ResultCallback>) -> Self {
        self.callback = Some(callback);
        self
    }
}

struct ActiveJob {
    profile: Arc<JobProfile>,
    manager: Arc<dyn ExecutionManager>,
}

pub struct CoordinatorBuilder {
    ctx: GridContext,
    config: CoordinatorConfig,
    managers: Option<ManagerRegistry>,
    extra_managers: Vec<Arc<dyn ExecutionManager>>,
    remote: Option<Arc<dyn JobDirectory>>,
}

impl CoordinatorBuilder {
    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the built-in managers altogether.
    pub fn managers(mut self, managers: ManagerRegistry) -> Self {
        self.managers = Some(managers);
        self
    }

    /// Register a manager, replacing any other one of the same kind.
    pub fn manager(mut self, manager: Arc<dyn ExecutionManager>) -> Self {
        self.extra_managers.push(manager);
        self
    }

    /// Where requests for jobs of other clusters go.
    pub fn remote(mut self, directory: Arc<dyn JobDirectory>) -> Self {
        self.remote = Some(directory);
        self
    }

    /// Must be called within a Tokio runtime.
    pub fn build(self) -> Arc<JobCoordinator> {
        let mut managers = match self.managers {
            Some(managers) => managers,
            None => ManagerRegistry::with_defaults(&self.ctx, &self.config),
        };
        for manager in self.extra_managers {
            managers.register(manager);
        }

        // Subscribe before anything can be published.
        let events = self.ctx.bus.subscribe();
        let shutdown = CancellationToken::new();
        let coordinator = Arc::new_cyclic(|me| JobCoordinator {
            ctx: self.ctx,
            config: self.config,
            managers,
            remote: self.remote,
            jobs: DashMap::new(),
            finished: AtomicUsize::new(0),
            shutdown: shutdown.clone(),
            me: me.clone(),
        });

        tokio::spawn(watch_nodes(Arc::downgrade(&coordinator), events, shutdown));
        info!("Coordinator of cluster {} started", coordinator.ctx.cluster_id);
        coordinator
    }
}

pub struct JobCoordinator {
    ctx: GridContext,
    config: CoordinatorConfig,
    managers: ManagerRegistry,
    remote: Option<Arc<dyn JobDirectory>>,
    jobs: DashMap<JobId, ActiveJob>,
    finished: AtomicUsize,
    shutdown: CancellationToken,
    me: Weak<JobCoordinator>,
}

impl JobCoordinator {
    pub fn builder(ctx: GridContext) -> CoordinatorBuilder {
        CoordinatorBuilder {
            ctx,
            config: CoordinatorConfig::default(),
            managers: None,
            extra_managers: Vec::new(),
            remote: None,
        }
    }

    pub fn context(&self) -> &GridContext {
        &self.ctx
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Admit a job and start running it.
    pub fn submit(&self, request: JobRequest) -> GridResult<JobId> {
        self.admit(request).map(|future| future.job_id().clone())
    }

    /// Like [`JobCoordinator::submit`], returning the owner-side future.
    pub fn submit_watched(&self, request: JobRequest) -> GridResult<Arc<ClientJobFuture>> {
        self.admit(request).map(ClientJobFuture::new)
    }

    fn admit(&self, request: JobRequest) -> GridResult<Arc<JobFuture>> {
        let JobRequest {
            owner,
            definition,
            archive,
            callback,
        } = request;

        if let Some(archive) = &archive {
            if let Err(e) = archive.verify() {
                warn!("Rejecting job of {owner}: {e}");
                return Err(e);
            }
        }
        let kind = definition.kind();
        let manager = self.managers.resolve(kind).map_err(|e| {
            warn!("Rejecting job of {owner}: {e}");
            e
        })?;

        let job_id = JobId::generate(&self.ctx.cluster_id, &owner);
        let future = JobFuture::new(job_id.clone());
        let canceller: Weak<dyn JobCanceller> = self.me.clone();
        future.set_canceller(canceller);
        self.watch_outcome(&future);

        let profile = Arc::new(JobProfile::new(
            job_id.clone(),
            owner.clone(),
            definition,
            archive,
            future.clone(),
            callback,
        ));

        match self.jobs.entry(job_id.clone()) {
            Entry::Occupied(_) => {
                warn!("Rejecting job of {owner}: id {job_id} is already in use");
                return Err(GridError::Rejected(format!("job id {job_id} is already in use")));
            }
            Entry::Vacant(slot) => {
                slot.insert(ActiveJob {
                    profile: profile.clone(),
                    manager: manager.clone(),
                });
            }
        }
        self.ctx.channel.create(&job_id);
        info!("Job {job_id} ({kind}) submitted by {owner}");
        self.ctx.bus.publish(GridEvent::JobStarted {
            job_id: job_id.clone(),
            owner,
        });

        if let Err(e) = manager.start(profile) {
            warn!("Could not start job {job_id}: {e}");
            future.fail(e.clone());
            self.notify_cancel(&job_id);
            return Err(e);
        }
        Ok(future)
    }

    /// Evict a job once its future reaches a terminal state on its own.
    fn watch_outcome(&self, future: &Arc<JobFuture>) {
        let me = self.me.clone();
        let job_id = future.job_id().clone();
        future.add_listener(Arc::new(move |state| {
            let Some(coordinator) = me.upgrade() else {
                return;
            };
            match state {
                JobState::Complete => {
                    coordinator.notify_end(&job_id);
                }
                JobState::Failed => {
                    coordinator.notify_cancel(&job_id);
                }
                _ => {}
            }
        }));
    }

    /// Admit a worker to a job.
    pub fn request_job(&self, job_id: &JobId, worker: &WorkerProfile) -> GridResult<JobInfo> {
        if !job_id.belongs_to(&self.ctx.cluster_id) {
            return match &self.remote {
                Some(remote) => {
                    debug!("Forwarding request of {} for foreign job {job_id}", worker.id);
                    remote.request_job(job_id, worker)
                }
                None => Err(GridError::InvalidJob(job_id.clone())),
            };
        }

        let profile = self
            .profile(job_id)
            .ok_or_else(|| GridError::InvalidJob(job_id.clone()))?;
        if profile.is_stopped() || profile.future().is_done() {
            return Err(GridError::InvalidJob(job_id.clone()));
        }
        if !profile.process_request(&worker.id) {
            return Err(GridError::PermissionDenied(format!(
                "worker {} is banned from job {job_id}",
                worker.id
            )));
        }

        info!("Worker {} ({}) joined job {job_id}", worker.name, worker.id);
        Ok(JobInfo {
            job_id: job_id.clone(),
            owner: profile.owner().clone(),
            kind: profile.definition().kind(),
            archive: profile.archive().cloned(),
        })
    }

    /// Cancel an active job. Returns false if it is unknown or already over.
    pub fn cancel(&self, job_id: &JobId) -> bool {
        let Some(profile) = self.profile(job_id) else {
            return false;
        };
        if profile.future().is_done() {
            return false;
        }
        profile.stop();
        if let Some(job) = self.jobs.get(job_id) {
            job.manager.cancel(job_id);
        }
        if !profile.future().mark_canceled() {
            return false;
        }

        info!("Job {job_id} canceled");
        self.notify_cancel(job_id);
        true
    }

    /// Announce the end of a job and evict it. Returns false if the job was
    /// already gone.
    pub fn notify_end(&self, job_id: &JobId) -> bool {
        if !self.evict(job_id) {
            return false;
        }
        self.ctx.bus.publish(GridEvent::JobEnded {
            job_id: job_id.clone(),
        });
        true
    }

    /// Announce the cancellation of a job and evict it. Returns false if the
    /// job was already gone.
    pub fn notify_cancel(&self, job_id: &JobId) -> bool {
        if !self.evict(job_id) {
            return false;
        }
        self.ctx.bus.publish(GridEvent::JobCanceled {
            job_id: job_id.clone(),
        });
        true
    }

    fn evict(&self, job_id: &JobId) -> bool {
        let Some((_, job)) = self.jobs.remove(job_id) else {
            return false;
        };
        job.profile.stop();
        job.manager.cancel(job_id);
        self.ctx.channel.destroy(job_id);
        self.finished.fetch_add(1, Ordering::SeqCst);

        let profile = &job.profile;
        info!(
            "Job {job_id} evicted as {} after {:?}: {} task(s) completed, {} failure(s)",
            profile.future().state(),
            profile.elapsed(),
            profile.completed_count(),
            profile.failed_count()
        );
        true
    }

    /// Jobs evicted so far.
    pub fn finished_jobs(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn active_jobs(&self) -> usize {
        self.jobs.len()
    }

    pub fn job_future(&self, job_id: &JobId) -> Option<Arc<JobFuture>> {
        self.jobs.get(job_id).map(|job| job.profile.future().clone())
    }

    pub fn client_future(&self, job_id: &JobId) -> Option<Arc<ClientJobFuture>> {
        self.job_future(job_id).map(ClientJobFuture::new)
    }

    pub fn profile(&self, job_id: &JobId) -> Option<Arc<JobProfile>> {
        self.jobs.get(job_id).map(|job| job.profile.clone())
    }

    /// Cancel every active job and stop watching the grid.
    pub fn shutdown(&self) {
        let ids: Vec<JobId> = self.jobs.iter().map(|job| job.key().clone()).collect();
        for job_id in ids {
            self.cancel(&job_id);
        }
        self.shutdown.cancel();
        info!("Coordinator of cluster {} stopped", self.ctx.cluster_id);
    }

    /// A node left the grid: its jobs are canceled, it stops counting as a
    /// participant everywhere else, and the tasks it took without answering
    /// go back on their queues.
    fn node_departed(&self, node: &NodeId) {
        let profiles: Vec<Arc<JobProfile>> =
            self.jobs.iter().map(|job| job.profile.clone()).collect();

        for profile in profiles {
            let job_id = profile.job_id();
            if profile.owner() == node {
                warn!("Owner {node} of job {job_id} left, canceling");
                self.cancel(job_id);
                continue;
            }
            if profile.remove_worker(node) {
                info!("Worker {node} left job {job_id}");
            }

            let unanswered = self.ctx.channel.reclaim(job_id, node);
            if unanswered.is_empty() {
                continue;
            }
            let splitter = Splitter::new(self.ctx.channel.clone(), profile.clone());
            let requeued = unanswered
                .into_iter()
                .filter(|task_id| splitter.re_enqueue(*task_id))
                .count();
            info!("Re-enqueued {requeued} task(s) of job {job_id} held by departed worker {node}");
        }
    }
}

impl JobDirectory for JobCoordinator {
    fn request_job(&self, job_id: &JobId, worker: &WorkerProfile) -> GridResult<JobInfo> {
        JobCoordinator::request_job(self, job_id, worker)
    }

    fn active_job_ids(&self) -> Vec<JobId> {
        let mut jobs: Vec<(std::time::Instant, JobId)> = self
            .jobs
            .iter()
            .filter(|job| !job.profile.is_stopped() && !job.profile.future().is_done())
            .map(|job| (job.profile.start_time(), job.key().clone()))
            .collect();
        jobs.sort_by_key(|(started, _)| *started);
        jobs.into_iter().map(|(_, job_id)| job_id).collect()
    }
}

impl JobCanceller for JobCoordinator {
    fn cancel_job(&self, job_id: &JobId) -> bool {
        self.cancel(job_id)
    }
}

impl Drop for JobCoordinator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn watch_nodes(
    coordinator: Weak<JobCoordinator>,
    mut events: broadcast::Receiver<GridEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(event) => {
                let Some(node) = event.departed_node() else {
                    continue;
                };
                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };
                coordinator.node_departed(node);
            }
            Err(RecvError::Lagged(missed)) => {
                warn!("Node watch fell behind, {missed} event(s) missed");
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!("Node watch stopped");
}
