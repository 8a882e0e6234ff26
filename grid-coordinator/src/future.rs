//! The handle through which a job's outcome is observed.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::debug;

use common::{GridError, GridResult, JobId};

/// State of a job as seen through its future.
///
/// States only move forward, in declaration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JobState {
    /// Submitted, not started.
    Waiting,

    /// Being split into tasks.
    Initializing,

    /// All tasks handed out, results being collected.
    Executing,

    Complete,
    Failed,
    Canceled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Complete | JobState::Failed | JobState::Canceled
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Waiting => "waiting",
            JobState::Initializing => "initializing",
            JobState::Executing => "executing",
            JobState::Complete => "complete",
            JobState::Failed => "failed",
            JobState::Canceled => "canceled",
        };
        f.write_str(name)
    }
}

/// Called on every state transition, off the thread that made it.
pub type StateListener = Arc<dyn Fn(JobState) + Send + Sync>;

/// Whoever can actually cancel a job; the coordinator in practice.
pub trait JobCanceller: Send + Sync {
    fn cancel_job(&self, job_id: &JobId) -> bool;
}

/// What a caller gets once the job is terminal: the aggregate on completion,
/// nothing on cancellation.
pub type JobOutcome = GridResult<Option<Bytes>>;

#[derive(Clone, Debug)]
struct Snapshot {
    state: JobState,
    result: Option<Bytes>,
    cause: Option<GridError>,
}

impl Snapshot {
    fn outcome(&self) -> Option<JobOutcome> {
        match self.state {
            JobState::Complete => Some(Ok(Some(self.result.clone().unwrap_or_default()))),
            JobState::Failed => {
                let cause = self
                    .cause
                    .clone()
                    .unwrap_or_else(|| GridError::Execution("unknown cause".to_string()));
                Some(Err(GridError::JobFailed(Box::new(cause))))
            }
            JobState::Canceled => Some(Ok(None)),
            _ => None,
        }
    }
}

pub struct JobFuture {
    job_id: JobId,
    state: watch::Sender<Snapshot>,
    listeners: Mutex<Vec<StateListener>>,
    canceller: Mutex<Option<Weak<dyn JobCanceller>>>,
    runtime: Option<Handle>,
}

impl JobFuture {
    pub fn new(job_id: JobId) -> Arc<Self> {
        let (state, _) = watch::channel(Snapshot {
            state: JobState::Waiting,
            result: None,
            cause: None,
        });
        Arc::new(Self {
            job_id,
            state,
            listeners: Mutex::new(Vec::new()),
            canceller: Mutex::new(None),
            runtime: Handle::try_current().ok(),
        })
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn state(&self) -> JobState {
        self.state.borrow().state
    }

    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    /// The outcome if the job is terminal, without waiting.
    pub fn outcome_now(&self) -> Option<JobOutcome> {
        self.state.borrow().outcome()
    }

    pub(crate) fn set_canceller(&self, canceller: Weak<dyn JobCanceller>) {
        *self.canceller.lock() = Some(canceller);
    }

    /// Register a listener for subsequent transitions.
    pub fn add_listener(&self, listener: StateListener) {
        self.listeners.lock().push(listener);
    }

    /// Move to a non-terminal state. Returns false if the transition is not
    /// forward.
    pub fn set_state(&self, state: JobState) -> bool {
        debug_assert!(!state.is_terminal(), "use complete/fail/mark_canceled");
        self.transition(state, None, None)
    }

    pub fn complete(&self, result: Bytes) -> bool {
        self.transition(JobState::Complete, Some(result), None)
    }

    pub fn fail(&self, cause: GridError) -> bool {
        self.transition(JobState::Failed, None, Some(cause))
    }

    /// Record that the job was canceled. Only the canceller should call this.
    pub fn mark_canceled(&self) -> bool {
        self.transition(JobState::Canceled, None, None)
    }

    /// Ask for the job to be canceled. No effect once terminal.
    pub fn cancel(&self) -> bool {
        if self.is_done() {
            return false;
        }
        let canceller = self.canceller.lock().as_ref().and_then(Weak::upgrade);
        match canceller {
            Some(canceller) => canceller.cancel_job(&self.job_id),
            None => self.mark_canceled(),
        }
    }

    /// Wait for a terminal state.
    ///
    /// With a timeout, the total time spent waiting is measured across every
    /// wake-up (non-terminal transitions included), and [`GridError::Timeout`]
    /// is returned only once that total exceeds the bound.
    pub async fn result(&self, timeout: Option<Duration>) -> JobOutcome {
        let mut rx = self.state.subscribe();
        let started = Instant::now();

        loop {
            let outcome = rx.borrow_and_update().outcome();
            if let Some(outcome) = outcome {
                return outcome;
            }

            match timeout {
                None => {
                    if rx.changed().await.is_err() {
                        return Err(GridError::Channel("job future dropped".to_string()));
                    }
                }
                Some(limit) => {
                    let elapsed = started.elapsed();
                    if elapsed >= limit {
                        return Err(GridError::Timeout(limit));
                    }
                    // Either a change or the remaining time running out; both
                    // go back through the checks above.
                    let _ = tokio::time::timeout(limit - elapsed, rx.changed()).await;
                }
            }
        }
    }

    fn transition(&self, state: JobState, result: Option<Bytes>, cause: Option<GridError>) -> bool {
        let changed = self.state.send_if_modified(|snapshot| {
            if snapshot.state.is_terminal() || state <= snapshot.state {
                return false;
            }
            snapshot.state = state;
            snapshot.result = result;
            snapshot.cause = cause;
            true
        });

        if changed {
            debug!("Job {} is now {}", self.job_id, state);
            self.notify(state);
        }
        changed
    }

    fn notify(&self, state: JobState) {
        let listeners = self.listeners.lock().clone();
        if listeners.is_empty() {
            return;
        }
        let fan_out = move || {
            for listener in &listeners {
                listener(state);
            }
        };
        match &self.runtime {
            Some(handle) => {
                handle.spawn(async move { fan_out() });
            }
            None => fan_out(),
        }
    }
}

impl fmt::Debug for JobFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobFuture")
            .field("job_id", &self.job_id)
            .field("state", &self.state())
            .finish()
    }
}
