//! Consumes a job's results and decides when the job is done.
//!
//! Completion has two triggers: a result bringing the outstanding count to
//! zero, and the future entering [`JobState::Executing`]. The second one
//! covers the last result landing before the splitter has finished. An atomic
//! latch makes sure only one of them actually completes the job.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use common::channel::TaskChannel;
use common::events::EventBus;
use common::job::SplitAggregateJob;
use common::task::{TaskOutcome, TaskResult};
use common::{GridError, GridResult};

use crate::failure::FailureTracker;
use crate::future::JobState;
use crate::profile::JobProfile;
use crate::splitter::Splitter;

/// How a job finishes once every task has a result.
#[derive(Clone)]
pub enum Completion {
    /// Combine the retained results with the job's aggregate step.
    Aggregate(Arc<dyn SplitAggregateJob>),

    /// Results were streamed to the callback; complete with an empty value.
    /// Payloads are not retained.
    Drain,
}

pub struct ResultCollector {
    profile: Arc<JobProfile>,
    splitter: Splitter,
    tracker: FailureTracker,
    completion: Completion,
    completed: AtomicBool,
    stop: CancellationToken,
    progress: Option<Arc<Notify>>,
}

impl ResultCollector {
    /// Subscribe to the job's results and start processing them.
    ///
    /// `progress`, when given, is notified on every successful result.
    pub fn start(
        channel: Arc<dyn TaskChannel>,
        bus: Arc<dyn EventBus>,
        profile: Arc<JobProfile>,
        completion: Completion,
        ban_threshold: u32,
        progress: Option<Arc<Notify>>,
    ) -> GridResult<Arc<Self>> {
        let results = channel.subscribe_results(profile.job_id())?;
        let collector = Arc::new(Self {
            splitter: Splitter::new(channel, profile.clone()),
            tracker: FailureTracker::new(ban_threshold, bus),
            profile,
            completion,
            completed: AtomicBool::new(false),
            stop: CancellationToken::new(),
            progress,
        });

        let weak = Arc::downgrade(&collector);
        collector
            .profile
            .future()
            .add_listener(Arc::new(move |state| {
                if state == JobState::Executing {
                    if let Some(collector) = weak.upgrade() {
                        collector.try_complete();
                    }
                }
            }));

        tokio::spawn(collector.clone().consume(results));
        Ok(collector)
    }

    pub fn splitter(&self) -> &Splitter {
        &self.splitter
    }

    pub fn tracker(&self) -> &FailureTracker {
        &self.tracker
    }

    /// Resolves once the collector has stopped consuming results.
    pub async fn closed(&self) {
        self.stop.cancelled().await
    }

    /// Tear down without completing the job. Returns false if the collector
    /// was already stopped.
    pub fn cancel(&self) -> bool {
        if self.stop.is_cancelled() {
            return false;
        }
        self.stop.cancel();
        debug!("Collector of job {} canceled", self.profile.job_id());
        true
    }

    async fn consume(self: Arc<Self>, mut results: mpsc::UnboundedReceiver<TaskResult>) {
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                next = results.recv() => match next {
                    Some(result) => self.handle(result),
                    None => {
                        debug!("Result queue of job {} closed", self.profile.job_id());
                        break;
                    }
                },
            }
        }
        self.stop.cancel();
    }

    /// Process one result.
    pub fn handle(&self, result: TaskResult) {
        let job_id = self.profile.job_id();
        let TaskResult {
            task_id,
            worker_id,
            outcome,
            duration,
        } = result;

        match outcome {
            TaskOutcome::Success(payload) => {
                let retained = match self.completion {
                    Completion::Aggregate(_) => payload.clone(),
                    Completion::Drain => Bytes::new(),
                };
                let remaining = match self.profile.complete_task(task_id, retained) {
                    Ok(remaining) => remaining,
                    Err(e) => {
                        error!("Dropping result from worker {worker_id}: {e}");
                        return;
                    }
                };
                debug!(
                    "Task {task_id} of job {job_id} done by {worker_id} in {duration:?}, {remaining} outstanding"
                );

                self.profile.dispatch_result(task_id, payload);
                self.tracker.clear_success(&worker_id);
                if let Some(progress) = &self.progress {
                    progress.notify_one();
                }
                if remaining == 0 {
                    self.try_complete();
                }
            }
            TaskOutcome::Failure(cause) => {
                let failed = self.profile.record_failed_task();
                warn!("Task {task_id} of job {job_id} failed on {worker_id} ({failed} failure(s) so far): {cause}");
                self.tracker.record_failure(&self.profile, &worker_id);
                self.splitter.re_enqueue(task_id);
            }
        }
    }

    /// Complete the job if every task has a result and splitting is over.
    /// Only the first successful call does anything.
    pub fn try_complete(&self) {
        let profile = &self.profile;
        if !profile.is_sealed()
            || profile.outstanding_count() != 0
            || profile.future().state() != JobState::Executing
        {
            return;
        }
        if self
            .completed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        self.stop.cancel();
        let profile = profile.clone();
        match &self.completion {
            Completion::Aggregate(job) => {
                let job = job.clone();
                tokio::spawn(async move { aggregate(profile, job).await });
            }
            Completion::Drain => {
                tokio::spawn(async move {
                    profile.flush_callbacks().await;
                    info!("Job {} drained", profile.job_id());
                    profile.future().complete(Bytes::new());
                });
            }
        }
    }

    /// Whether completion has been triggered.
    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }
}

async fn aggregate(profile: Arc<JobProfile>, job: Arc<dyn SplitAggregateJob>) {
    profile.flush_callbacks().await;
    let job_id = profile.job_id().clone();
    let results = profile.results();
    info!("Aggregating {} result(s) of job {job_id}", results.len());

    match tokio::task::spawn_blocking(move || job.aggregate(results)).await {
        Ok(Ok(value)) => {
            info!("Job {job_id} complete in {:?}", profile.elapsed());
            profile.future().complete(value);
        }
        Ok(Err(e)) => {
            error!("Aggregation of job {job_id} failed: {e:#}");
            profile
                .future()
                .fail(GridError::Execution(GridError::describe(&e)));
        }
        Err(e) => {
            error!("Aggregation of job {job_id} panicked: {e}");
            profile.future().fail(GridError::Execution(e.to_string()));
        }
    }
}
