//! Owner-side view of a job future.
//!
//! The owner of a job usually lives on another node than the coordinator, so
//! every look at the real future is a round trip. The proxy caches the final
//! outcome once delivered and offers a one-shot callback for it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use common::{GridError, GridResult, JobId};

use crate::future::{JobFuture, JobOutcome, JobState};

/// One-shot receiver of a job's final outcome.
pub type FinalResultCallback = Box<dyn FnOnce(JobOutcome) + Send>;

pub struct ClientJobFuture {
    remote: Arc<JobFuture>,
    cached: OnceLock<JobOutcome>,
    on_final: Mutex<Option<FinalResultCallback>>,
    round_trips: AtomicUsize,
}

impl ClientJobFuture {
    pub fn new(remote: Arc<JobFuture>) -> Arc<Self> {
        let proxy = Arc::new(Self {
            remote: remote.clone(),
            cached: OnceLock::new(),
            on_final: Mutex::new(None),
            round_trips: AtomicUsize::new(0),
        });

        let weak = Arc::downgrade(&proxy);
        remote.add_listener(Arc::new(move |state: JobState| {
            if !state.is_terminal() {
                return;
            }
            if let Some(proxy) = weak.upgrade() {
                if let Some(outcome) = proxy.remote.outcome_now() {
                    proxy.deliver(outcome);
                }
            }
        }));

        // The job may already be over by the time the proxy is built.
        if let Some(outcome) = remote.outcome_now() {
            proxy.deliver(outcome);
        }
        proxy
    }

    pub fn job_id(&self) -> &JobId {
        self.remote.job_id()
    }

    /// Whether the final outcome has been delivered locally.
    pub fn is_finished(&self) -> bool {
        self.cached.get().is_some()
    }

    /// How many times the remote future had to be consulted.
    pub fn round_trips(&self) -> usize {
        self.round_trips.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> JobState {
        match self.cached.get() {
            Some(Ok(Some(_))) => JobState::Complete,
            Some(Ok(None)) => JobState::Canceled,
            Some(Err(_)) => JobState::Failed,
            None => {
                self.round_trips.fetch_add(1, Ordering::Relaxed);
                self.remote.state()
            }
        }
    }

    /// Register the one-shot final-result callback.
    ///
    /// Fires immediately if the outcome is already known. A second
    /// registration replaces a callback that has not fired yet.
    pub fn on_final_result(&self, callback: FinalResultCallback) {
        if let Some(outcome) = self.cached.get() {
            callback(outcome.clone());
            return;
        }
        *self.on_final.lock() = Some(callback);
        // Delivery may have raced with the registration.
        if let Some(outcome) = self.cached.get() {
            if let Some(callback) = self.on_final.lock().take() {
                callback(outcome.clone());
            }
        }
    }

    /// Same contract as [`JobFuture::result`], served from the cache once the
    /// outcome has been delivered.
    pub async fn result(&self, timeout: Option<Duration>) -> JobOutcome {
        if let Some(outcome) = self.cached.get() {
            return outcome.clone();
        }
        self.round_trips.fetch_add(1, Ordering::Relaxed);
        let outcome = self.remote.result(timeout).await;
        if !matches!(outcome, Err(GridError::Timeout(_))) {
            self.deliver(outcome.clone());
        }
        outcome
    }

    /// Cancel the job, unless it already finished locally.
    pub fn cancel(&self) -> GridResult<bool> {
        if self.is_finished() {
            return Err(GridError::AlreadyFinished(self.job_id().clone()));
        }
        self.round_trips.fetch_add(1, Ordering::Relaxed);
        Ok(self.remote.cancel())
    }

    fn deliver(&self, outcome: JobOutcome) {
        if self.cached.set(outcome).is_err() {
            return;
        }
        debug!("Final outcome of job {} delivered", self.job_id());
        let callback = self.on_final.lock().take();
        if let (Some(callback), Some(outcome)) = (callback, self.cached.get()) {
            callback(outcome.clone());
        }
    }
}
