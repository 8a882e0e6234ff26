//! Kind-specific drivers of a job's execution.

use std::collections::HashMap;
use std::sync::Arc;

use common::job::JobKind;
use common::{GridContext, GridError, GridResult, JobId};

use crate::config::CoordinatorConfig;
use crate::profile::JobProfile;

mod split_aggregate;
mod unbounded;

pub use split_aggregate::SplitAggregateManager;
pub use unbounded::UnboundedManager;

/// Runs jobs of one [`JobKind`].
pub trait ExecutionManager: Send + Sync {
    fn kind(&self) -> JobKind;

    /// Start executing the job. The job's channel already exists.
    fn start(&self, profile: Arc<JobProfile>) -> GridResult<()>;

    /// Tear down whatever the manager runs for the job. Returns false if it
    /// was not running it.
    fn cancel(&self, job_id: &JobId) -> bool;
}

/// Maps declared job kinds to their managers.
#[derive(Default, Clone)]
pub struct ManagerRegistry {
    managers: HashMap<JobKind, Arc<dyn ExecutionManager>>,
}

impl ManagerRegistry {
    /// A registry with the built-in managers for every kind.
    pub fn with_defaults(ctx: &GridContext, config: &CoordinatorConfig) -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(SplitAggregateManager::new(ctx.clone(), config.clone())));
        registry.register(Arc::new(UnboundedManager::new(ctx.clone(), config.clone())));
        registry
    }

    /// Register a manager, replacing any other one of the same kind.
    pub fn register(&mut self, manager: Arc<dyn ExecutionManager>) {
        self.managers.insert(manager.kind(), manager);
    }

    pub fn resolve(&self, kind: JobKind) -> GridResult<Arc<dyn ExecutionManager>> {
        self.managers
            .get(&kind)
            .cloned()
            .ok_or_else(|| GridError::Rejected(format!("job type {kind} not supported")))
    }

    pub fn managers(&self) -> impl Iterator<Item = &Arc<dyn ExecutionManager>> {
        self.managers.values()
    }
}
