//! The loop that runs one job's tasks on one worker.

use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::channel::TaskChannel;
use common::job::TaskContext;
use common::resolver::ResourceResolver;
use common::task::TaskResult;
use common::{JobId, NodeId};

use crate::config::WorkerConfig;
use crate::telemetry::Telemetry;

pub struct TaskExecutor {
    job_id: JobId,
    worker_id: NodeId,
    channel: Arc<dyn TaskChannel>,
    resolver: Arc<dyn ResourceResolver>,
    telemetry: Arc<Telemetry>,
    config: WorkerConfig,
    stop: CancellationToken,
}

impl TaskExecutor {
    pub fn new(
        job_id: JobId,
        worker_id: NodeId,
        channel: Arc<dyn TaskChannel>,
        resolver: Arc<dyn ResourceResolver>,
        telemetry: Arc<Telemetry>,
        config: WorkerConfig,
        stop: CancellationToken,
    ) -> Self {
        Self {
            job_id,
            worker_id,
            channel,
            resolver,
            telemetry,
            config,
            stop,
        }
    }

    /// Pull, run and report tasks until stopped or the job's queues go away.
    /// Returns the number of tasks run.
    ///
    /// Only one task is held at a time: the next one is requested after the
    /// previous result has been published.
    pub async fn run(self) -> u64 {
        let job_id = &self.job_id;
        info!("Worker {} executing job {job_id}", self.worker_id);
        let mut executed = 0u64;
        let mut failures = 0u32;

        loop {
            let envelope = tokio::select! {
                _ = self.stop.cancelled() => break,
                next = self.channel.dequeue(job_id, &self.worker_id) => match next {
                    Some(envelope) => envelope,
                    None => {
                        debug!("Task queue of job {job_id} is gone");
                        break;
                    }
                },
            };

            let task_id = envelope.task_id;
            let ctx = TaskContext::new(
                job_id.clone(),
                task_id,
                self.worker_id.clone(),
                self.resolver.clone(),
            );
            let task = envelope.task;
            let started = Instant::now();
            let outcome = match tokio::task::spawn_blocking(move || task.execute(&ctx)).await {
                Ok(outcome) => outcome,
                Err(e) => Err(anyhow!("task panicked: {e}")),
            };
            let duration = started.elapsed();

            let result =
                TaskResult::from_execution(task_id, self.worker_id.clone(), outcome, duration);
            let success = result.is_success();
            self.telemetry.record(job_id, task_id, success, duration);
            executed += 1;

            if let Err(e) = self.channel.publish_result(job_id, result) {
                debug!("Result of task {task_id} of job {job_id} dropped: {e}");
                break;
            }

            if success {
                failures = 0;
                continue;
            }
            failures += 1;
            let delay = self.config.backoff(failures);
            if delay.is_zero() {
                continue;
            }
            warn!(
                "Worker {} failed {failures} task(s) of job {job_id} in a row, backing off for {delay:?}",
                self.worker_id
            );
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(
            "Worker {} left job {job_id} after {executed} task(s)",
            self.worker_id
        );
        executed
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::bail;
    use bytes::Bytes;

    use super::*;
    use common::channel::InMemoryTaskChannel;
    use common::job::PayloadTask;
    use common::resolver::{StaticResolver, UnavailableResolver};
    use common::task::TaskOutcome;

    fn shout(_ctx: &TaskContext, input: Bytes) -> anyhow::Result<Bytes> {
        Ok(Bytes::from(String::from_utf8(input.to_vec())?.to_uppercase()))
    }

    fn fail(_ctx: &TaskContext, _input: Bytes) -> anyhow::Result<Bytes> {
        bail!("always fails")
    }

    fn greeting(ctx: &TaskContext, _input: Bytes) -> anyhow::Result<Bytes> {
        ctx.resource("greeting")
    }

    fn executor(
        channel: Arc<InMemoryTaskChannel>,
        resolver: Arc<dyn ResourceResolver>,
        telemetry: Arc<Telemetry>,
        stop: CancellationToken,
    ) -> TaskExecutor {
        TaskExecutor::new(
            JobId::from_raw("c-o-1"),
            NodeId::new("w"),
            channel,
            resolver,
            telemetry,
            WorkerConfig::default().with_backoff(Duration::from_millis(1), Duration::from_millis(5)),
            stop,
        )
    }

    #[tokio::test]
    async fn runs_tasks_and_publishes_results() {
        let job_id = JobId::from_raw("c-o-1");
        let channel = Arc::new(InMemoryTaskChannel::new());
        channel.create(&job_id);
        let mut results = channel.subscribe_results(&job_id).unwrap();
        let telemetry = Arc::new(Telemetry::new());

        channel
            .enqueue(&job_id, 0, PayloadTask::shared(shout, Bytes::from("hi")))
            .unwrap();
        channel
            .enqueue(&job_id, 1, PayloadTask::shared(fail, Bytes::new()))
            .unwrap();

        let stop = CancellationToken::new();
        let handle = tokio::spawn(
            executor(channel.clone(), Arc::new(UnavailableResolver), telemetry.clone(), stop.clone())
                .run(),
        );

        let first = results.recv().await.unwrap();
        assert_eq!(first.task_id, 0);
        assert_eq!(first.outcome, TaskOutcome::Success(Bytes::from("HI")));
        let second = results.recv().await.unwrap();
        assert_eq!(second.task_id, 1);
        assert!(!second.is_success());

        stop.cancel();
        assert_eq!(handle.await.unwrap(), 2);
        let snapshot = telemetry.snapshot();
        assert_eq!((snapshot.tasks_done, snapshot.tasks_failed), (1, 1));
    }

    #[tokio::test]
    async fn tasks_resolve_resources_through_the_job_resolver() {
        let job_id = JobId::from_raw("c-o-1");
        let channel = Arc::new(InMemoryTaskChannel::new());
        channel.create(&job_id);
        let mut results = channel.subscribe_results(&job_id).unwrap();
        channel
            .enqueue(&job_id, 0, PayloadTask::shared(greeting, Bytes::new()))
            .unwrap();

        let resolver = Arc::new(StaticResolver::new().with("greeting", "hello"));
        let stop = CancellationToken::new();
        tokio::spawn(executor(channel.clone(), resolver, Arc::new(Telemetry::new()), stop.clone()).run());

        let result = results.recv().await.unwrap();
        assert_eq!(result.outcome, TaskOutcome::Success(Bytes::from("hello")));
        stop.cancel();
    }

    #[tokio::test]
    async fn exits_when_the_job_is_torn_down() {
        let job_id = JobId::from_raw("c-o-1");
        let channel = Arc::new(InMemoryTaskChannel::new());
        channel.create(&job_id);
        let handle = tokio::spawn(
            executor(
                channel.clone(),
                Arc::new(UnavailableResolver),
                Arc::new(Telemetry::new()),
                CancellationToken::new(),
            )
            .run(),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        channel.destroy(&job_id);
        let executed = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(executed, 0);
    }

    #[tokio::test]
    async fn keeps_going_through_a_failure_streak() {
        let job_id = JobId::from_raw("c-o-1");
        let channel = Arc::new(InMemoryTaskChannel::new());
        channel.create(&job_id);
        let mut results = channel.subscribe_results(&job_id).unwrap();
        for id in 0..6 {
            channel
                .enqueue(&job_id, id, PayloadTask::shared(fail, Bytes::new()))
                .unwrap();
        }

        let stop = CancellationToken::new();
        tokio::spawn(
            executor(channel.clone(), Arc::new(UnavailableResolver), Arc::new(Telemetry::new()), stop.clone())
                .run(),
        );
        for id in 0..6 {
            assert_eq!(results.recv().await.unwrap().task_id, id);
        }
        stop.cancel();
    }
}
