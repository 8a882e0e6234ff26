//! Job-scoped resource resolution.
//!
//! A worker resolves the resources a task asks for through a chain chosen at
//! job start: archived jobs put an [`ArchiveResolver`] in front of the node's
//! own resolver, other jobs use the node resolver directly.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use bytes::Bytes;

use crate::archive::JobArchive;
use crate::JobId;

pub trait ResourceResolver: Send + Sync {
    fn resolve(&self, job_id: &JobId, name: &str) -> Result<Bytes>;
}

/// Node resolver for nodes that have no way to fetch remote resources.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableResolver;

impl ResourceResolver for UnavailableResolver {
    fn resolve(&self, job_id: &JobId, name: &str) -> Result<Bytes> {
        Err(anyhow!("resource `{name}` of job {job_id} is not available"))
    }
}

/// Node resolver backed by a fixed set of resources.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    resources: HashMap<String, Bytes>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.resources.insert(name.into(), data.into());
        self
    }
}

impl ResourceResolver for StaticResolver {
    fn resolve(&self, job_id: &JobId, name: &str) -> Result<Bytes> {
        self.resources
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("resource `{name}` of job {job_id} not found"))
    }
}

/// Answers from a job archive first, then delegates to its parent.
pub struct ArchiveResolver {
    entries: BTreeMap<String, Bytes>,
    parent: Arc<dyn ResourceResolver>,
}

impl ArchiveResolver {
    pub fn new(archive: &JobArchive, parent: Arc<dyn ResourceResolver>) -> Result<Self> {
        Ok(Self {
            entries: archive.entries()?,
            parent,
        })
    }
}

impl ResourceResolver for ArchiveResolver {
    fn resolve(&self, job_id: &JobId, name: &str) -> Result<Bytes> {
        match self.entries.get(name) {
            Some(data) => Ok(data.clone()),
            None => self.parent.resolve(job_id, name),
        }
    }
}

/// Pick the resolver chain for a job.
pub fn for_job(
    archive: Option<&JobArchive>,
    node: Arc<dyn ResourceResolver>,
) -> Result<Arc<dyn ResourceResolver>> {
    match archive {
        Some(archive) => Ok(Arc::new(ArchiveResolver::new(archive, node)?)),
        None => Ok(node),
    }
}
