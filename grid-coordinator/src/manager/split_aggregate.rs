use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use common::job::{JobDefinition, JobKind};
use common::{GridContext, GridError, GridResult, JobId};

use crate::collector::{Completion, ResultCollector};
use crate::config::CoordinatorConfig;
use crate::manager::ExecutionManager;
use crate::profile::JobProfile;

/// Splits a job up front and aggregates once every task has a result.
pub struct SplitAggregateManager {
    ctx: GridContext,
    config: CoordinatorConfig,
    collectors: DashMap<JobId, Arc<ResultCollector>>,
}

impl SplitAggregateManager {
    pub fn new(ctx: GridContext, config: CoordinatorConfig) -> Self {
        Self {
            ctx,
            config,
            collectors: DashMap::new(),
        }
    }

    pub fn running(&self) -> usize {
        self.collectors.len()
    }
}

impl ExecutionManager for SplitAggregateManager {
    fn kind(&self) -> JobKind {
        JobKind::SplitAggregate
    }

    fn start(&self, profile: Arc<JobProfile>) -> GridResult<()> {
        let JobDefinition::SplitAggregate(job) = profile.definition().clone() else {
            return Err(GridError::Rejected(format!(
                "job {} is not a split-aggregate job",
                profile.job_id()
            )));
        };

        let collector = ResultCollector::start(
            self.ctx.channel.clone(),
            self.ctx.bus.clone(),
            profile.clone(),
            Completion::Aggregate(job.clone()),
            self.config.ban_threshold,
            None,
        )?;
        self.collectors
            .insert(profile.job_id().clone(), collector.clone());
        info!("Starting split-aggregate job {}", profile.job_id());

        let splitter = collector.splitter().clone();
        tokio::spawn(async move { splitter.run(job).await });
        Ok(())
    }

    fn cancel(&self, job_id: &JobId) -> bool {
        match self.collectors.remove(job_id) {
            Some((_, collector)) => {
                collector.cancel();
                debug!("Split-aggregate manager released job {job_id}");
                true
            }
            None => false,
        }
    }
}
