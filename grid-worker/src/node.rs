//! A worker node: joins jobs as they are announced and runs their tasks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::directory::JobDirectory;
use common::events::GridEvent;
use common::resolver::{self, ResourceResolver, UnavailableResolver};
use common::{GridContext, JobId, NodeId, WorkerProfile};

use crate::config::WorkerConfig;
use crate::executor::TaskExecutor;
use crate::telemetry::{Telemetry, TelemetrySnapshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    InProgress(JobId),
}

struct RunningExecutor {
    serial: u64,
    stop: CancellationToken,
}

pub struct WorkerNode {
    profile: WorkerProfile,
    ctx: GridContext,
    directory: Arc<dyn JobDirectory>,
    resolver: Arc<dyn ResourceResolver>,
    config: WorkerConfig,
    telemetry: Arc<Telemetry>,
    executors: DashMap<JobId, RunningExecutor>,
    joining: Mutex<()>,
    serial: AtomicU64,
    shutdown: CancellationToken,
}

impl WorkerNode {
    pub fn new(profile: WorkerProfile, ctx: GridContext, directory: Arc<dyn JobDirectory>) -> Self {
        Self {
            profile,
            ctx,
            directory,
            resolver: Arc::new(UnavailableResolver),
            config: WorkerConfig::default(),
            telemetry: Arc::new(Telemetry::new()),
            executors: DashMap::new(),
            joining: Mutex::new(()),
            serial: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Where tasks look up resources their job's archive does not carry.
    pub fn with_resolver(mut self, resolver: Arc<dyn ResourceResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn id(&self) -> &NodeId {
        &self.profile.id
    }

    pub fn state(&self) -> WorkerState {
        match self.executors.iter().next() {
            Some(entry) => WorkerState::InProgress(entry.key().clone()),
            None => WorkerState::Idle,
        }
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    /// Start reacting to grid events, joining an already running job if there
    /// is one. Must be called within a Tokio runtime.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let events = self.ctx.bus.subscribe();
        info!("Worker {} ({}) started", self.profile.name, self.profile.id);
        self.pull_next_job();
        tokio::spawn(self.clone().run(events))
    }

    /// Stop every executor and leave the grid.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn run(self: Arc<Self>, mut events: broadcast::Receiver<GridEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(event) => self.handle(event),
                Err(RecvError::Lagged(missed)) => {
                    warn!("Worker {} missed {missed} event(s)", self.profile.id);
                    self.pull_next_job();
                }
                Err(RecvError::Closed) => break,
            }
        }

        for entry in self.executors.iter() {
            entry.stop.cancel();
        }
        self.executors.clear();
        self.ctx.bus.publish(GridEvent::NodeUnregistered {
            node_id: self.profile.id.clone(),
        });
        info!("Worker {} left the grid", self.profile.id);
    }

    fn handle(self: &Arc<Self>, event: GridEvent) {
        match event {
            GridEvent::JobStarted { job_id, .. } => {
                let _joining = self.joining.lock();
                if self.executors.is_empty() {
                    self.join(&job_id);
                }
            }
            GridEvent::JobEnded { job_id } | GridEvent::JobCanceled { job_id } => {
                if self.leave(&job_id) {
                    self.pull_next_job();
                }
            }
            GridEvent::NodeBanned { worker_id, job_id } if worker_id == self.profile.id => {
                warn!("Worker {} was banned from job {job_id}", self.profile.id);
                if self.leave(&job_id) {
                    self.pull_next_job();
                }
            }
            _ => {}
        }
    }

    /// Join the oldest active job that admits this worker, if idle.
    fn pull_next_job(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let _joining = self.joining.lock();
        if !self.executors.is_empty() {
            return;
        }
        for job_id in self.directory.active_job_ids() {
            if self.join(&job_id) {
                return;
            }
        }
        debug!("Worker {} is idle", self.profile.id);
    }

    fn join(self: &Arc<Self>, job_id: &JobId) -> bool {
        let info = match self.directory.request_job(job_id, &self.profile) {
            Ok(info) => info,
            Err(e) => {
                debug!("Worker {} not admitted to job {job_id}: {e}", self.profile.id);
                return false;
            }
        };
        let resolver = match resolver::for_job(info.archive.as_ref(), self.resolver.clone()) {
            Ok(resolver) => resolver,
            Err(e) => {
                warn!("Cannot open the archive of job {job_id}: {e:#}");
                return false;
            }
        };

        let stop = self.shutdown.child_token();
        let serial = self.serial.fetch_add(1, Ordering::Relaxed);
        let executor = TaskExecutor::new(
            job_id.clone(),
            self.profile.id.clone(),
            self.ctx.channel.clone(),
            resolver,
            self.telemetry.clone(),
            self.config.clone(),
            stop.clone(),
        );
        self.executors
            .insert(job_id.clone(), RunningExecutor { serial, stop });

        let node = Arc::downgrade(self);
        let job_id = job_id.clone();
        tokio::spawn(async move {
            executor.run().await;
            if let Some(node) = node.upgrade() {
                node.executor_exited(&job_id, serial);
            }
        });
        true
    }

    /// Stop running a job. Notifications for other jobs are ignored.
    fn leave(&self, job_id: &JobId) -> bool {
        match self.executors.remove(job_id) {
            Some((_, executor)) => {
                executor.stop.cancel();
                true
            }
            None => false,
        }
    }

    fn executor_exited(self: &Arc<Self>, job_id: &JobId, serial: u64) {
        let removed = self
            .executors
            .remove_if(job_id, |_, executor| executor.serial == serial)
            .is_some();
        if removed {
            self.pull_next_job();
        }
    }
}
