//! Execution-time state of one job.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use common::archive::JobArchive;
use common::job::{GridTask, JobDefinition, ResultCallback};
use common::{GridError, GridResult, JobId, NodeId, TaskId};

use crate::future::JobFuture;

/// Where a task id currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskLocation {
    Outstanding,
    Completed,
}

/// Outstanding and completed tasks. A task id lives in exactly one of the two.
#[derive(Default)]
struct TaskLedger {
    outstanding: HashMap<TaskId, Arc<dyn GridTask>>,
    completed: BTreeMap<TaskId, Bytes>,
}

#[derive(Default)]
struct Membership {
    workers: HashSet<NodeId>,
    banned: HashSet<NodeId>,
}

enum Dispatch {
    Result(TaskId, Bytes),
    Flush(oneshot::Sender<()>),
}

/// Runs the job's intermediate-result callback on a single dedicated task,
/// so a slow or failing callback never holds up result processing.
struct CallbackDispatcher {
    sender: mpsc::UnboundedSender<Dispatch>,
}

impl CallbackDispatcher {
    fn spawn(job_id: JobId, callback: Arc<dyn ResultCallback>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Dispatch>();
        tokio::spawn(async move {
            while let Some(dispatch) = receiver.recv().await {
                let (task_id, payload) = match dispatch {
                    Dispatch::Result(task_id, payload) => (task_id, payload),
                    Dispatch::Flush(done) => {
                        let _ = done.send(());
                        continue;
                    }
                };
                let callback = callback.clone();
                let outcome =
                    tokio::task::spawn_blocking(move || callback.on_result(task_id, &payload))
                        .await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Result callback of job {job_id} failed: {e:#}"),
                    Err(e) => warn!("Result callback of job {job_id} panicked: {e}"),
                }
            }
            debug!("Callback dispatcher of job {job_id} stopped");
        });
        Self { sender }
    }

    fn dispatch(&self, task_id: TaskId, payload: Bytes) {
        let _ = self.sender.send(Dispatch::Result(task_id, payload));
    }

    async fn flush(&self) {
        let (done, flushed) = oneshot::channel();
        if self.sender.send(Dispatch::Flush(done)).is_ok() {
            let _ = flushed.await;
        }
    }
}

/// Per-job mutable state shared by the splitter, the collector, the failure
/// tracker and admission.
pub struct JobProfile {
    job_id: JobId,
    owner: NodeId,
    definition: JobDefinition,
    archive: Option<JobArchive>,
    future: Arc<JobFuture>,
    start_time: Instant,

    ledger: Mutex<TaskLedger>,
    membership: Mutex<Membership>,
    failed_count: AtomicU64,
    total_tasks: OnceLock<usize>,
    stopped: AtomicBool,
    callback: Option<CallbackDispatcher>,
}

impl JobProfile {
    /// Must be called within a Tokio runtime when a callback is given.
    pub fn new(
        job_id: JobId,
        owner: NodeId,
        definition: JobDefinition,
        archive: Option<JobArchive>,
        future: Arc<JobFuture>,
        callback: Option<Arc<dyn ResultCallback>>,
    ) -> Self {
        let callback = callback.map(|cb| CallbackDispatcher::spawn(job_id.clone(), cb));
        Self {
            job_id,
            owner,
            definition,
            archive,
            future,
            start_time: Instant::now(),
            ledger: Mutex::new(TaskLedger::default()),
            membership: Mutex::new(Membership::default()),
            failed_count: AtomicU64::new(0),
            total_tasks: OnceLock::new(),
            stopped: AtomicBool::new(false),
            callback,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn owner(&self) -> &NodeId {
        &self.owner
    }

    pub fn definition(&self) -> &JobDefinition {
        &self.definition
    }

    pub fn archive(&self) -> Option<&JobArchive> {
        self.archive.as_ref()
    }

    pub fn future(&self) -> &Arc<JobFuture> {
        &self.future
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /////////////////////////////////////////////////////////////////////////
    // Tasks
    /////////////////////////////////////////////////////////////////////////

    /// Record a new outstanding task. Returns false if the id is already known.
    pub fn add_task(&self, task_id: TaskId, task: Arc<dyn GridTask>) -> bool {
        let mut ledger = self.ledger.lock();
        if ledger.completed.contains_key(&task_id) || ledger.outstanding.contains_key(&task_id) {
            return false;
        }
        ledger.outstanding.insert(task_id, task);
        true
    }

    pub fn outstanding_task(&self, task_id: TaskId) -> Option<Arc<dyn GridTask>> {
        self.ledger.lock().outstanding.get(&task_id).cloned()
    }

    /// Move a task from outstanding to completed and report how many tasks
    /// are still outstanding, as one atomic step.
    pub fn complete_task(&self, task_id: TaskId, result: Bytes) -> GridResult<usize> {
        let mut ledger = self.ledger.lock();
        if ledger.outstanding.remove(&task_id).is_none() {
            let reason = if ledger.completed.contains_key(&task_id) {
                "duplicate"
            } else {
                "unknown"
            };
            return Err(GridError::Execution(format!(
                "{reason} result for task {task_id} of job {}",
                self.job_id
            )));
        }
        ledger.completed.insert(task_id, result);
        Ok(ledger.outstanding.len())
    }

    pub fn task_location(&self, task_id: TaskId) -> Option<TaskLocation> {
        let ledger = self.ledger.lock();
        if ledger.outstanding.contains_key(&task_id) {
            Some(TaskLocation::Outstanding)
        } else if ledger.completed.contains_key(&task_id) {
            Some(TaskLocation::Completed)
        } else {
            None
        }
    }

    pub fn outstanding_count(&self) -> usize {
        self.ledger.lock().outstanding.len()
    }

    pub fn completed_count(&self) -> usize {
        self.ledger.lock().completed.len()
    }

    /// Every completed result, keyed by task id.
    pub fn results(&self) -> BTreeMap<TaskId, Bytes> {
        self.ledger.lock().completed.clone()
    }

    /// Fix the number of tasks once splitting is over.
    pub fn seal(&self, total: usize) {
        if self.total_tasks.set(total).is_err() {
            warn!("Job {} sealed twice", self.job_id);
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.total_tasks.get().is_some()
    }

    pub fn total_tasks(&self) -> Option<usize> {
        self.total_tasks.get().copied()
    }

    /// Fraction of tasks completed, known once the job is sealed.
    pub fn progress(&self) -> Option<f64> {
        let total = self.total_tasks()?;
        if total == 0 {
            return Some(1.0);
        }
        Some(self.completed_count() as f64 / total as f64)
    }

    pub fn record_failed_task(&self) -> u64 {
        self.failed_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn failed_count(&self) -> u64 {
        self.failed_count.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Hand an intermediate result to the job's callback, if any.
    pub fn dispatch_result(&self, task_id: TaskId, payload: Bytes) {
        if let Some(callback) = &self.callback {
            callback.dispatch(task_id, payload);
        }
    }

    /// Wait until every result dispatched so far went through the callback.
    pub async fn flush_callbacks(&self) {
        if let Some(callback) = &self.callback {
            callback.flush().await;
        }
    }

    /////////////////////////////////////////////////////////////////////////
    // Workers
    /////////////////////////////////////////////////////////////////////////

    /// Admit a worker unless it is banned.
    pub fn process_request(&self, worker: &NodeId) -> bool {
        let mut membership = self.membership.lock();
        if membership.banned.contains(worker) {
            debug!("Worker {worker} is banned from job {}", self.job_id);
            return false;
        }
        membership.workers.insert(worker.clone());
        true
    }

    /// Drop a worker that left the grid. Returns whether it was participating.
    pub fn remove_worker(&self, worker: &NodeId) -> bool {
        self.membership.lock().workers.remove(worker)
    }

    /// Permanently exclude a worker from this job.
    ///
    /// Returns whether the worker was newly banned. Fails the job with
    /// [`GridError::AllWorkersLost`] if no participating worker is left.
    pub fn add_banned_node(&self, worker: &NodeId) -> bool {
        let all_lost = {
            let mut membership = self.membership.lock();
            membership.workers.remove(worker);
            if !membership.banned.insert(worker.clone()) {
                return false;
            }
            membership.workers.is_empty()
        };

        info!("Worker {worker} banned from job {}", self.job_id);
        if all_lost {
            warn!("Job {} lost all of its workers", self.job_id);
            self.future.fail(GridError::AllWorkersLost);
        }
        true
    }

    pub fn is_banned(&self, worker: &NodeId) -> bool {
        self.membership.lock().banned.contains(worker)
    }

    pub fn is_participating(&self, worker: &NodeId) -> bool {
        self.membership.lock().workers.contains(worker)
    }

    pub fn worker_count(&self) -> usize {
        self.membership.lock().workers.len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::future::JobState;
    use common::job::{PayloadTask, SplitAggregateJob, TaskContext};

    pub(crate) fn noop(_ctx: &TaskContext, input: Bytes) -> anyhow::Result<Bytes> {
        Ok(input)
    }

    pub(crate) struct NoopJob;

    impl SplitAggregateJob for NoopJob {
        fn split(&self) -> anyhow::Result<Vec<Arc<dyn GridTask>>> {
            Ok(vec![])
        }

        fn aggregate(&self, _results: BTreeMap<TaskId, Bytes>) -> anyhow::Result<Bytes> {
            Ok(Bytes::new())
        }
    }

    pub(crate) fn profile() -> Arc<JobProfile> {
        let job_id = JobId::from_raw("c-owner-1");
        Arc::new(JobProfile::new(
            job_id.clone(),
            NodeId::new("owner"),
            JobDefinition::split_aggregate(NoopJob),
            None,
            JobFuture::new(job_id),
            None,
        ))
    }

    #[tokio::test]
    async fn task_moves_from_outstanding_to_completed_once() {
        let p = profile();
        for id in 0..3 {
            assert!(p.add_task(id, PayloadTask::shared(noop, Bytes::new())));
        }
        assert!(!p.add_task(1, PayloadTask::shared(noop, Bytes::new())));

        assert_eq!(p.complete_task(1, Bytes::from("r1")).unwrap(), 2);
        assert_eq!(p.task_location(1), Some(TaskLocation::Completed));
        assert_eq!(p.task_location(0), Some(TaskLocation::Outstanding));
        assert_eq!(p.task_location(7), None);

        assert!(p.complete_task(1, Bytes::from("again")).is_err());
        assert!(p.complete_task(9, Bytes::new()).is_err());
        assert_eq!(p.results()[&1], Bytes::from("r1"));
    }

    #[tokio::test]
    async fn concurrent_completions_see_zero_exactly_once() {
        let p = profile();
        let n = 200;
        for id in 0..n {
            p.add_task(id, PayloadTask::shared(noop, Bytes::new()));
        }

        let mut handles = Vec::new();
        for id in 0..n {
            let p = p.clone();
            handles.push(tokio::spawn(async move {
                p.complete_task(id, Bytes::new()).unwrap() == 0
            }));
        }

        let mut zeros = 0;
        for handle in handles {
            if handle.await.unwrap() {
                zeros += 1;
            }
        }
        assert_eq!(zeros, 1);
        assert_eq!(p.completed_count(), n as usize);
    }

    #[tokio::test]
    async fn banned_workers_are_denied() {
        let p = profile();
        let a = NodeId::new("a");
        let b = NodeId::new("b");
        assert!(p.process_request(&a));
        assert!(p.process_request(&b));

        assert!(p.add_banned_node(&a));
        assert!(!p.add_banned_node(&a));
        assert!(!p.process_request(&a));
        assert!(p.is_participating(&b));
        assert_eq!(p.future().state(), JobState::Waiting);
    }

    #[tokio::test]
    async fn banning_the_last_worker_fails_the_job() {
        let p = profile();
        let a = NodeId::new("a");
        p.process_request(&a);
        p.add_banned_node(&a);

        assert_eq!(p.future().state(), JobState::Failed);
        let err = p.future().result(None).await.unwrap_err();
        assert_eq!(err, GridError::JobFailed(Box::new(GridError::AllWorkersLost)));
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<TaskId>>);

    impl ResultCallback for Collect {
        fn on_result(&self, task_id: TaskId, _result: &Bytes) -> anyhow::Result<()> {
            self.0.lock().push(task_id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn callbacks_run_in_order_and_flush() {
        let job_id = JobId::from_raw("c-owner-1");
        let collect = Arc::new(Collect::default());
        let p = JobProfile::new(
            job_id.clone(),
            NodeId::new("owner"),
            JobDefinition::split_aggregate(NoopJob),
            None,
            JobFuture::new(job_id),
            Some(collect.clone() as Arc<dyn ResultCallback>),
        );
        for id in [3, 1, 2] {
            p.dispatch_result(id, Bytes::new());
        }
        p.flush_callbacks().await;
        assert_eq!(*collect.0.lock(), vec![3, 1, 2]);
    }

    #[tokio::test]
    async fn progress_is_known_once_sealed() {
        let p = profile();
        p.add_task(0, PayloadTask::shared(noop, Bytes::new()));
        p.add_task(1, PayloadTask::shared(noop, Bytes::new()));
        assert_eq!(p.progress(), None);

        p.seal(2);
        p.complete_task(0, Bytes::new()).unwrap();
        assert_eq!(p.progress(), Some(0.5));
    }
}
