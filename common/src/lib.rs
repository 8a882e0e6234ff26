//! Users submit jobs which are split into tasks, and those tasks are
//! distributed to workers pulling from a per-job task channel. For
//! simplicity, the transport is abstracted behind [`channel::TaskChannel`]
//! and [`events::EventBus`], with in-process implementations provided.

use std::fmt;
use std::fmt::Formatter;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod archive;
pub mod channel;
pub mod context;
pub mod directory;
pub mod error;
pub mod events;
pub mod job;
pub mod resolver;
pub mod task;
pub mod utils;

pub use context::GridContext;
pub use error::{GridError, GridResult};

/////////////////////////////////////////////////////////////////////////////
// Identifiers
/////////////////////////////////////////////////////////////////////////////

/// Sequence number of a task within its job, assigned in split order.
pub type TaskId = u32;

/// Identity of a node taking part in the grid (owner or worker).
#[derive(Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh node identity.
    pub fn random() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a job.
///
/// Rendered as `{cluster_id}-{owner}-{unique}`. The allocating cluster is kept
/// alongside the rendered id, so cluster ids may themselves contain dashes.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct JobId {
    cluster: String,
    id: String,
}

impl JobId {
    /// Allocate a new job id for `owner` in `cluster_id`.
    pub fn generate(cluster_id: &str, owner: &NodeId) -> Self {
        let unique = Uuid::new_v4().simple();
        Self {
            cluster: cluster_id.to_string(),
            id: format!("{cluster_id}-{owner}-{unique}"),
        }
    }

    /// Wrap an id allocated by `cluster_id`, e.g. one received from a peer.
    pub fn with_cluster(cluster_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            cluster: cluster_id.into(),
            id: id.into(),
        }
    }

    /// Wrap a rendered id whose cluster is everything before the first `-`.
    pub fn from_raw(id: impl Into<String>) -> Self {
        let id = id.into();
        let cluster = id.split('-').next().unwrap_or_default().to_string();
        Self { cluster, id }
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.id
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster
    }

    /// Whether this job was allocated by `cluster_id`.
    pub fn belongs_to(&self, cluster_id: &str) -> bool {
        self.cluster == cluster_id
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// What a worker tells the coordinator about itself when asking for a job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerProfile {
    /// The worker's node id.
    pub id: NodeId,

    /// Human readable name, used in logs only.
    pub name: String,

    /// Number of cores the worker is willing to use.
    pub cores: usize,
}

impl WorkerProfile {
    pub fn new(id: NodeId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            cores: 1,
        }
    }
}
