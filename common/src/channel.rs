//! The per-job task channel: an outbound task queue shared by competing
//! workers and an inbound result queue read by the job's collector.
//!
//! Delivery is at least once. A dequeued task stays attributed to the worker
//! that took it until that worker publishes its result; the deliveries of a
//! worker that disappears can be reclaimed and put back on the queue.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::error::{GridError, GridResult};
use crate::job::GridTask;
use crate::task::{TaskEnvelope, TaskResult};
use crate::{JobId, NodeId, TaskId};

/// Queue names derived from a job id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    pub tasks: String,
    pub results: String,
    pub control: String,
}

impl QueueNames {
    pub fn for_job(job_id: &JobId) -> Self {
        Self {
            tasks: format!("grid.{job_id}.tasks"),
            results: format!("grid.{job_id}.results"),
            control: format!("grid.{job_id}.control"),
        }
    }
}

#[async_trait]
pub trait TaskChannel: Send + Sync {
    /// Create the queues of a job. Idempotent.
    fn create(&self, job_id: &JobId);

    /// Tear down the queues of a job; undelivered messages are dropped.
    fn destroy(&self, job_id: &JobId);

    fn enqueue(&self, job_id: &JobId, task_id: TaskId, task: Arc<dyn GridTask>)
        -> GridResult<()>;

    /// Wait for the next task of a job on behalf of `worker`.
    ///
    /// A subscriber holds at most one task at a time: it only gets the next
    /// one by calling `dequeue` again. The task counts as delivered to
    /// `worker` until a result for it from `worker` is published. Returns
    /// `None` once the job's queues are gone.
    async fn dequeue(&self, job_id: &JobId, worker: &NodeId) -> Option<TaskEnvelope>;

    /// Publish a result, acknowledging the delivery it answers.
    fn publish_result(&self, job_id: &JobId, result: TaskResult) -> GridResult<()>;

    /// Forget every unacknowledged delivery to `worker` and return the ids of
    /// those tasks, so they can be enqueued again.
    fn reclaim(&self, job_id: &JobId, worker: &NodeId) -> Vec<TaskId>;

    /// Take the result stream of a job. There is a single result subscriber.
    fn subscribe_results(&self, job_id: &JobId)
        -> GridResult<mpsc::UnboundedReceiver<TaskResult>>;
}

struct JobQueues {
    task_tx: mpsc::UnboundedSender<TaskEnvelope>,
    task_rx: Arc<Mutex<mpsc::UnboundedReceiver<TaskEnvelope>>>,
    result_tx: mpsc::UnboundedSender<TaskResult>,
    result_rx: Option<mpsc::UnboundedReceiver<TaskResult>>,
    in_flight: DashMap<TaskId, NodeId>,
}

/// In-process task channel for single-process grids and tests.
#[derive(Default)]
pub struct InMemoryTaskChannel {
    jobs: DashMap<JobId, JobQueues>,
}

impl InMemoryTaskChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs with live queues.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn unknown(job_id: &JobId) -> GridError {
        GridError::Channel(format!("no queues for job {job_id}"))
    }
}

#[async_trait]
impl TaskChannel for InMemoryTaskChannel {
    fn create(&self, job_id: &JobId) {
        self.jobs.entry(job_id.clone()).or_insert_with(|| {
            let names = QueueNames::for_job(job_id);
            debug!("Creating queues {}, {}, {}", names.tasks, names.results, names.control);

            let (task_tx, task_rx) = mpsc::unbounded_channel();
            let (result_tx, result_rx) = mpsc::unbounded_channel();
            JobQueues {
                task_tx,
                task_rx: Arc::new(Mutex::new(task_rx)),
                result_tx,
                result_rx: Some(result_rx),
                in_flight: DashMap::new(),
            }
        });
    }

    fn destroy(&self, job_id: &JobId) {
        if let Some((_, queues)) = self.jobs.remove(job_id) {
            // Close the task queue so waiting and future dequeuers stop
            // immediately instead of draining leftovers.
            if let Ok(mut rx) = queues.task_rx.try_lock() {
                rx.close();
                while rx.try_recv().is_ok() {}
            }
            debug!("Destroyed queues of job {job_id}");
        }
    }

    fn enqueue(
        &self,
        job_id: &JobId,
        task_id: TaskId,
        task: Arc<dyn GridTask>,
    ) -> GridResult<()> {
        let queues = self.jobs.get(job_id).ok_or_else(|| Self::unknown(job_id))?;
        queues
            .task_tx
            .send(TaskEnvelope {
                job_id: job_id.clone(),
                task_id,
                task,
            })
            .map_err(|_| GridError::Channel(format!("task queue of job {job_id} closed")))
    }

    async fn dequeue(&self, job_id: &JobId, worker: &NodeId) -> Option<TaskEnvelope> {
        // Clone the receiver handle out so no map guard is held across await.
        let rx = self.jobs.get(job_id).map(|q| q.task_rx.clone())?;
        let envelope = rx.lock().await.recv().await?;
        if let Some(queues) = self.jobs.get(job_id) {
            queues.in_flight.insert(envelope.task_id, worker.clone());
        }
        Some(envelope)
    }

    fn publish_result(&self, job_id: &JobId, result: TaskResult) -> GridResult<()> {
        let queues = self.jobs.get(job_id).ok_or_else(|| Self::unknown(job_id))?;
        queues
            .in_flight
            .remove_if(&result.task_id, |_, holder| *holder == result.worker_id);
        queues
            .result_tx
            .send(result)
            .map_err(|_| GridError::Channel(format!("result queue of job {job_id} closed")))
    }

    fn subscribe_results(
        &self,
        job_id: &JobId,
    ) -> GridResult<mpsc::UnboundedReceiver<TaskResult>> {
        let mut queues = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| Self::unknown(job_id))?;
        queues.result_rx.take().ok_or_else(|| {
            GridError::Channel(format!("results of job {job_id} already subscribed"))
        })
    }

    fn reclaim(&self, job_id: &JobId, worker: &NodeId) -> Vec<TaskId> {
        let Some(queues) = self.jobs.get(job_id) else {
            return Vec::new();
        };
        let mut reclaimed = Vec::new();
        queues.in_flight.retain(|task_id, holder| {
            if holder == worker {
                reclaimed.push(*task_id);
                false
            } else {
                true
            }
        });
        reclaimed.sort_unstable();
        if !reclaimed.is_empty() {
            debug!("Reclaimed {} delivery(ies) of job {job_id} from {worker}", reclaimed.len());
        }
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::job::{PayloadTask, TaskContext};
    use crate::NodeId;

    fn echo(_ctx: &TaskContext, input: Bytes) -> anyhow::Result<Bytes> {
        Ok(input)
    }

    #[tokio::test]
    async fn tasks_are_delivered_in_order() {
        let channel = InMemoryTaskChannel::new();
        let job = JobId::from_raw("c-o-1");
        channel.create(&job);

        for id in 0..3 {
            channel
                .enqueue(&job, id, PayloadTask::shared(echo, Bytes::new()))
                .unwrap();
        }

        for id in 0..3 {
            let envelope = channel.dequeue(&job, &NodeId::new("w")).await.unwrap();
            assert_eq!(envelope.task_id, id);
            assert_eq!(envelope.job_id, job);
        }
    }

    #[tokio::test]
    async fn destroy_wakes_waiting_dequeuers() {
        let channel = Arc::new(InMemoryTaskChannel::new());
        let job = JobId::from_raw("c-o-1");
        channel.create(&job);

        let waiter = {
            let channel = channel.clone();
            let job = job.clone();
            tokio::spawn(async move { channel.dequeue(&job, &NodeId::new("w")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        channel.destroy(&job);

        // The waiter holds the receiver lock, so it sees the closed sender side
        // once the map entry (and with it the sender) is dropped.
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(got.is_none());
        assert!(channel.dequeue(&job, &NodeId::new("w")).await.is_none());
    }

    #[tokio::test]
    async fn unanswered_deliveries_can_be_reclaimed() {
        let channel = InMemoryTaskChannel::new();
        let job = JobId::from_raw("c-o-1");
        channel.create(&job);
        let _results = channel.subscribe_results(&job).unwrap();
        for id in 0..3 {
            channel
                .enqueue(&job, id, PayloadTask::shared(echo, Bytes::new()))
                .unwrap();
        }

        let gone = NodeId::new("gone");
        let alive = NodeId::new("alive");
        assert_eq!(channel.dequeue(&job, &gone).await.unwrap().task_id, 0);
        assert_eq!(channel.dequeue(&job, &alive).await.unwrap().task_id, 1);
        assert_eq!(channel.dequeue(&job, &gone).await.unwrap().task_id, 2);

        // Answered deliveries are acknowledged, whatever the outcome.
        channel
            .publish_result(
                &job,
                crate::task::TaskResult::failure(2, gone.clone(), "boom", Duration::ZERO),
            )
            .unwrap();
        // A result from someone else does not acknowledge another's delivery.
        channel
            .publish_result(
                &job,
                crate::task::TaskResult::success(0, alive.clone(), Bytes::new(), Duration::ZERO),
            )
            .unwrap();

        assert_eq!(channel.reclaim(&job, &gone), vec![0]);
        assert!(channel.reclaim(&job, &gone).is_empty());
        assert_eq!(channel.reclaim(&job, &alive), vec![1]);
        assert!(channel.reclaim(&JobId::from_raw("c-o-2"), &gone).is_empty());
    }

    #[tokio::test]
    async fn results_have_a_single_subscriber() {
        let channel = InMemoryTaskChannel::new();
        let job = JobId::from_raw("c-o-1");
        channel.create(&job);

        let mut rx = channel.subscribe_results(&job).unwrap();
        assert!(channel.subscribe_results(&job).is_err());

        let result = crate::task::TaskResult::success(
            4,
            NodeId::new("w"),
            Bytes::from("ok"),
            Duration::ZERO,
        );
        channel.publish_result(&job, result).unwrap();
        assert_eq!(rx.recv().await.unwrap().task_id, 4);

        channel.destroy(&job);
        assert!(channel
            .publish_result(
                &job,
                crate::task::TaskResult::failure(0, NodeId::new("w"), "late", Duration::ZERO)
            )
            .is_err());
    }
}
