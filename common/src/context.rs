use std::sync::Arc;

use crate::channel::{InMemoryTaskChannel, TaskChannel};
use crate::events::{EventBus, InMemoryEventBus};

/// Process-wide handles shared by every grid component.
///
/// Built once per process and passed around by `Arc`.
#[derive(Clone)]
pub struct GridContext {
    pub cluster_id: String,
    pub channel: Arc<dyn TaskChannel>,
    pub bus: Arc<dyn EventBus>,
}

impl GridContext {
    pub fn new(
        cluster_id: impl Into<String>,
        channel: Arc<dyn TaskChannel>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            channel,
            bus,
        }
    }

    /// A context whose channel and bus live in this process.
    pub fn in_memory(cluster_id: impl Into<String>) -> Self {
        Self::new(
            cluster_id,
            Arc::new(InMemoryTaskChannel::new()),
            Arc::new(InMemoryEventBus::default()),
        )
    }
}
