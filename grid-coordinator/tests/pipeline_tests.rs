//! Coordinator and worker nodes running together over the in-process
//! transport.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use bytes::Bytes;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use common::archive::JobArchive;
use common::channel::TaskChannel;
use common::events::GridEvent;
use common::job::{GridTask, JobDefinition, PayloadTask, SplitAggregateJob, TaskContext};
use common::utils::{from_payload, to_payload};
use common::{GridContext, GridError, NodeId, TaskId, WorkerProfile};
use grid_coordinator::profile::TaskLocation;
use grid_coordinator::{CoordinatorConfig, JobCoordinator, JobRequest, JobState};
use grid_worker::{WorkerConfig, WorkerNode};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Reports which worker ran it, after sleeping for the number of
/// milliseconds in its input. Workers named `bad-*` always fail.
fn whoami(ctx: &TaskContext, input: Bytes) -> Result<Bytes> {
    if ctx.worker_id.as_str().starts_with("bad") {
        bail!("worker {} is broken", ctx.worker_id);
    }
    let delay: u64 = from_payload(&input)?;
    std::thread::sleep(Duration::from_millis(delay));
    Ok(Bytes::from(ctx.worker_id.as_str().to_string()))
}

/// Aggregates to the worker that completed each task.
struct Roster {
    tasks: u32,
    delay_ms: u64,
}

impl SplitAggregateJob for Roster {
    fn split(&self) -> Result<Vec<Arc<dyn GridTask>>> {
        (0..self.tasks)
            .map(|_| Ok(PayloadTask::shared(whoami, to_payload(&self.delay_ms)?)))
            .collect()
    }

    fn aggregate(&self, results: BTreeMap<TaskId, Bytes>) -> Result<Bytes> {
        let roster: BTreeMap<TaskId, String> = results
            .into_iter()
            .map(|(id, worker)| (id, String::from_utf8_lossy(&worker).into_owned()))
            .collect();
        to_payload(&roster)
    }
}

fn roster(tasks: u32, delay_ms: u64) -> JobDefinition {
    JobDefinition::split_aggregate(Roster { tasks, delay_ms })
}

struct Grid {
    ctx: GridContext,
    coordinator: Arc<JobCoordinator>,
    workers: Vec<Arc<WorkerNode>>,
}

impl Grid {
    fn new() -> Self {
        init_tracing();
        let ctx = GridContext::in_memory("test");
        let coordinator = JobCoordinator::builder(ctx.clone())
            .config(CoordinatorConfig::default())
            .build();
        Self {
            ctx,
            coordinator,
            workers: Vec::new(),
        }
    }

    fn with_workers(names: &[&str]) -> Self {
        let mut grid = Self::new();
        for name in names {
            grid.add_worker(name);
        }
        grid
    }

    fn add_worker(&mut self, name: &str) -> Arc<WorkerNode> {
        let config = WorkerConfig::default()
            .with_backoff(Duration::from_millis(1), Duration::from_millis(10));
        let node = Arc::new(
            WorkerNode::new(
                WorkerProfile::new(NodeId::new(name), name),
                self.ctx.clone(),
                self.coordinator.clone(),
            )
            .with_config(config),
        );
        node.start();
        self.workers.push(node.clone());
        node
    }

    fn events(&self) -> broadcast::Receiver<GridEvent> {
        self.ctx.bus.subscribe()
    }

    fn shutdown(&self) {
        for worker in &self.workers {
            worker.shutdown();
        }
        self.coordinator.shutdown();
    }
}

fn owner() -> NodeId {
    NodeId::new("owner")
}

async fn wait_for(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

async fn next_ban(events: &mut broadcast::Receiver<GridEvent>) -> NodeId {
    loop {
        match events.recv().await {
            Ok(GridEvent::NodeBanned { worker_id, .. }) => return worker_id,
            Ok(_) => continue,
            Err(e) => panic!("event bus failed: {e}"),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_task_is_completed_exactly_once() {
    let grid = Grid::with_workers(&["w1", "w2", "w3"]);
    let future = grid
        .coordinator
        .submit_watched(JobRequest::new(owner(), roster(40, 1)))
        .unwrap();
    let profile = grid.coordinator.profile(future.job_id()).unwrap();

    let value = future
        .result(Some(Duration::from_secs(10)))
        .await
        .unwrap()
        .unwrap();
    let roster: BTreeMap<TaskId, String> = from_payload(&value).unwrap();
    assert_eq!(roster.keys().copied().collect::<Vec<_>>(), (0..40).collect::<Vec<_>>());

    for id in 0..40 {
        assert_eq!(profile.task_location(id), Some(TaskLocation::Completed));
    }
    assert_eq!(profile.outstanding_count(), 0);
    assert_eq!(profile.progress(), Some(1.0));

    wait_for(|| grid.coordinator.active_jobs() == 0).await;
    assert_eq!(grid.coordinator.finished_jobs(), 1);
    let done: u64 = grid.workers.iter().map(|w| w.telemetry().tasks_done).sum();
    assert_eq!(done, 40);
    grid.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_worker_is_banned_and_others_finish_its_tasks() {
    let mut grid = Grid::with_workers(&["good-1"]);
    let mut events = grid.events();
    let future = grid
        .coordinator
        .submit_watched(JobRequest::new(owner(), roster(20, 20)))
        .unwrap();
    let profile = grid.coordinator.profile(future.job_id()).unwrap();

    // The failing worker joins once the job already has a healthy one.
    let good = NodeId::new("good-1");
    wait_for(|| profile.is_participating(&good)).await;
    grid.add_worker("bad-1");

    let banned = tokio::time::timeout(Duration::from_secs(10), next_ban(&mut events))
        .await
        .unwrap();
    assert_eq!(banned, NodeId::new("bad-1"));

    let value = future
        .result(Some(Duration::from_secs(10)))
        .await
        .unwrap()
        .unwrap();
    let roster: BTreeMap<TaskId, String> = from_payload(&value).unwrap();
    assert_eq!(roster.len(), 20);
    assert!(roster.values().all(|worker| worker == "good-1"));

    assert!(profile.is_banned(&NodeId::new("bad-1")));
    assert!(!profile.is_banned(&good));
    assert!(profile.failed_count() >= 4);

    let bad = &grid.workers[1];
    let telemetry = bad.telemetry();
    assert_eq!(telemetry.tasks_done, 0);
    assert!(telemetry.tasks_failed >= 4);
    grid.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn losing_every_worker_fails_the_job() {
    let grid = Grid::with_workers(&["bad-a", "bad-b"]);
    let mut events = grid.events();
    let future = grid
        .coordinator
        .submit_watched(JobRequest::new(owner(), roster(8, 0)))
        .unwrap();

    let err = future
        .result(Some(Duration::from_secs(10)))
        .await
        .unwrap_err();
    assert_eq!(err, GridError::JobFailed(Box::new(GridError::AllWorkersLost)));
    assert_eq!(future.state(), JobState::Failed);

    let job_id = future.job_id().clone();
    let canceled = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(GridEvent::JobCanceled { job_id: id }) if id == job_id => return true,
                Ok(GridEvent::JobEnded { .. }) => return false,
                Ok(_) => continue,
                Err(e) => panic!("event bus failed: {e}"),
            }
        }
    })
    .await
    .unwrap();
    assert!(canceled);
    wait_for(|| grid.coordinator.active_jobs() == 0).await;
    grid.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn short_timeout_expires_long_timeout_returns() {
    let grid = Grid::with_workers(&["w1"]);
    let future = grid
        .coordinator
        .submit_watched(JobRequest::new(owner(), roster(3, 100)))
        .unwrap();

    let err = future
        .result(Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert_eq!(err, GridError::Timeout(Duration::from_millis(50)));
    assert!(!future.is_finished());

    let value = future.result(Some(Duration::from_secs(10))).await.unwrap();
    assert!(value.is_some());
    assert_eq!(future.state(), JobState::Complete);
    grid.shutdown();
}

fn scaled(ctx: &TaskContext, input: Bytes) -> Result<Bytes> {
    let factor: u64 = String::from_utf8(ctx.resource("factor")?.to_vec())?.trim().parse()?;
    let n: u64 = from_payload(&input)?;
    to_payload(&(n * factor))
}

struct Scale;

impl SplitAggregateJob for Scale {
    fn split(&self) -> Result<Vec<Arc<dyn GridTask>>> {
        (1..=4u64)
            .map(|n| Ok(PayloadTask::shared(scaled, to_payload(&n)?)))
            .collect()
    }

    fn aggregate(&self, results: BTreeMap<TaskId, Bytes>) -> Result<Bytes> {
        let mut total = 0u64;
        for value in results.values() {
            total += from_payload::<u64>(value)?;
        }
        to_payload(&total)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn archived_resources_reach_the_tasks() {
    let grid = Grid::with_workers(&["w1", "w2"]);
    let mut entries = BTreeMap::new();
    entries.insert("factor".to_string(), Bytes::from("10"));
    let archive = JobArchive::pack(entries).unwrap();

    let future = grid
        .coordinator
        .submit_watched(
            JobRequest::new(owner(), JobDefinition::split_aggregate(Scale)).with_archive(archive),
        )
        .unwrap();
    let value = future
        .result(Some(Duration::from_secs(10)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from_payload::<u64>(&value).unwrap(), 100);
    grid.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tampered_archive_never_reaches_workers() {
    let grid = Grid::with_workers(&["w1"]);
    let mut events = grid.events();
    let archive = JobArchive::pack(BTreeMap::new()).unwrap();
    let tampered = JobArchive::from_parts(
        Bytes::from("{\"entries\":{\"x\":[1]}}"),
        archive.declared_digest().to_string(),
    );

    let result = grid.coordinator.submit(
        JobRequest::new(owner(), JobDefinition::split_aggregate(Scale)).with_archive(tampered),
    );
    assert!(matches!(result, Err(GridError::Rejected(_))));
    assert_eq!(grid.coordinator.active_jobs(), 0);
    assert_eq!(grid.coordinator.finished_jobs(), 0);
    assert!(events.try_recv().is_err());
    grid.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unbounded_job_streams_results_to_its_callback() {
    let grid = Grid::with_workers(&["w1", "w2", "w3"]);
    let params = workload::Params {
        rounds: 30,
        samples_per_round: 2_000,
        ..Default::default()
    };
    let pi = workload::try_named("pi", &params).unwrap();
    let mut request = JobRequest::new(owner(), pi.definition.clone());
    if let Some(callback) = &pi.callback {
        request = request.with_callback(callback.clone());
    }

    let future = grid.coordinator.submit_watched(request).unwrap();
    let value = future
        .result(Some(Duration::from_secs(10)))
        .await
        .unwrap()
        .unwrap();
    assert!(value.is_empty());

    let rendered = pi.render(&value).unwrap();
    assert!(rendered.contains("from 60000 samples"), "{rendered}");
    grid.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn departing_worker_leaves_the_job() {
    let mut grid = Grid::new();
    let leaving = grid.add_worker("leaving");
    let future = grid
        .coordinator
        .submit_watched(JobRequest::new(owner(), roster(200, 10)))
        .unwrap();
    let profile = grid.coordinator.profile(future.job_id()).unwrap();
    let id = leaving.id().clone();
    wait_for(|| profile.is_participating(&id)).await;

    grid.add_worker("staying");
    leaving.shutdown();
    wait_for(|| !profile.is_participating(&id)).await;

    assert!(future.cancel().unwrap());
    assert_eq!(future.result(None).await.unwrap(), None);
    grid.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn task_held_by_a_vanished_worker_is_redelivered() {
    let mut grid = Grid::new();
    let future = grid
        .coordinator
        .submit_watched(JobRequest::new(owner(), roster(1, 0)))
        .unwrap();
    let job_id = future.job_id().clone();
    let profile = grid.coordinator.profile(&job_id).unwrap();

    // Takes the only task and is never heard from again.
    let vanished = WorkerProfile::new(NodeId::new("vanished"), "vanished");
    grid.coordinator.request_job(&job_id, &vanished).unwrap();
    let held = tokio::time::timeout(
        Duration::from_secs(5),
        grid.ctx.channel.dequeue(&job_id, &vanished.id),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(held.task_id, 0);

    grid.ctx.bus.publish(GridEvent::HeartbeatFailed {
        node_id: vanished.id.clone(),
    });
    wait_for(|| !profile.is_participating(&vanished.id)).await;
    grid.add_worker("healthy");

    let value = future
        .result(Some(Duration::from_secs(10)))
        .await
        .unwrap()
        .unwrap();
    let roster: BTreeMap<TaskId, String> = from_payload(&value).unwrap();
    assert_eq!(roster.get(&0).map(String::as_str), Some("healthy"));
    assert_eq!(profile.outstanding_count(), 0);
    grid.shutdown();
}
