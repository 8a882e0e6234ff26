//! Lifecycle notifications broadcast across the grid.

use tokio::sync::broadcast;
use tracing::trace;

use crate::{JobId, NodeId};

/// Default number of events a slow subscriber may fall behind by.
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GridEvent {
    JobStarted { job_id: JobId, owner: NodeId },
    JobEnded { job_id: JobId },
    JobCanceled { job_id: JobId },
    NodeBanned { worker_id: NodeId, job_id: JobId },
    NodeUnregistered { node_id: NodeId },
    HeartbeatFailed { node_id: NodeId },
}

impl GridEvent {
    /// The job an event is about, if any. Used as a subscription key filter.
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            GridEvent::JobStarted { job_id, .. }
            | GridEvent::JobEnded { job_id }
            | GridEvent::JobCanceled { job_id }
            | GridEvent::NodeBanned { job_id, .. } => Some(job_id),
            GridEvent::NodeUnregistered { .. } | GridEvent::HeartbeatFailed { .. } => None,
        }
    }

    /// The node that left the grid, for departure events.
    pub fn departed_node(&self) -> Option<&NodeId> {
        match self {
            GridEvent::NodeUnregistered { node_id } | GridEvent::HeartbeatFailed { node_id } => {
                Some(node_id)
            }
            _ => None,
        }
    }

    /// Whether this event ends the given job for workers running it.
    pub fn ends_job(&self, job: &JobId) -> bool {
        matches!(
            self,
            GridEvent::JobEnded { job_id } | GridEvent::JobCanceled { job_id } if job_id == job
        )
    }
}

pub trait EventBus: Send + Sync {
    fn publish(&self, event: GridEvent);

    fn subscribe(&self) -> broadcast::Receiver<GridEvent>;
}

/// In-process event bus on top of a tokio broadcast channel.
pub struct InMemoryEventBus {
    sender: broadcast::Sender<GridEvent>,
}

impl InMemoryEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(&self, event: GridEvent) {
        trace!("Publishing {event:?}");
        // No subscribers is not an error: nobody is interested yet.
        let _ = self.sender.send(event);
    }

    fn subscribe(&self) -> broadcast::Receiver<GridEvent> {
        self.sender.subscribe()
    }
}
