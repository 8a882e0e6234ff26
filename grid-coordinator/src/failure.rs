//! Per-job tracking of consecutive task failures per worker.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use common::events::{EventBus, GridEvent};
use common::NodeId;

use crate::profile::JobProfile;

pub struct FailureTracker {
    threshold: u32,
    trace: DashMap<NodeId, u32>,
    bus: Arc<dyn EventBus>,
}

impl FailureTracker {
    pub fn new(threshold: u32, bus: Arc<dyn EventBus>) -> Self {
        Self {
            threshold,
            trace: DashMap::new(),
            bus,
        }
    }

    /// Count a failure of `worker`, banning it from the job once its streak
    /// exceeds the threshold. Returns whether this call banned the worker.
    pub fn record_failure(&self, profile: &JobProfile, worker: &NodeId) -> bool {
        let count = {
            let mut entry = self.trace.entry(worker.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        debug!(
            "Worker {worker} has {count} consecutive failure(s) on job {}",
            profile.job_id()
        );

        if count <= self.threshold {
            return false;
        }
        if !profile.add_banned_node(worker) {
            return false;
        }

        warn!(
            "Banning worker {worker} from job {} after {count} consecutive failures",
            profile.job_id()
        );
        self.bus.publish(GridEvent::NodeBanned {
            worker_id: worker.clone(),
            job_id: profile.job_id().clone(),
        });
        true
    }

    /// A success wipes the worker's streak.
    pub fn clear_success(&self, worker: &NodeId) {
        self.trace.remove(worker);
    }

    /// Current streak of a worker.
    pub fn failures(&self, worker: &NodeId) -> u32 {
        self.trace.get(worker).map(|count| *count).unwrap_or(0)
    }
}
