//! Job archives: named resources shipped alongside a job, protected by a
//! SHA-256 content digest that the coordinator re-checks on submission.

use std::collections::BTreeMap;

use anyhow::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{GridError, GridResult};

/// Lowercase hex SHA-256 of `data`.
pub fn content_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[derive(Serialize, Deserialize)]
struct Manifest {
    entries: BTreeMap<String, Vec<u8>>,
}

/// Raw archive bytes plus the digest the submitter declared for them.
#[derive(Clone, Debug)]
pub struct JobArchive {
    data: Bytes,
    declared_digest: String,
}

impl JobArchive {
    /// Pack named resources into an archive and compute its digest.
    pub fn pack(entries: BTreeMap<String, Bytes>) -> Result<Self> {
        let manifest = Manifest {
            entries: entries
                .into_iter()
                .map(|(name, data)| (name, data.to_vec()))
                .collect(),
        };
        let data = Bytes::from(serde_json::to_vec(&manifest)?);
        let declared_digest = content_digest(&data);
        Ok(Self {
            data,
            declared_digest,
        })
    }

    /// An archive as received over the wire, digest not yet verified.
    pub fn from_parts(data: Bytes, declared_digest: impl Into<String>) -> Self {
        Self {
            data,
            declared_digest: declared_digest.into(),
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn declared_digest(&self) -> &str {
        &self.declared_digest
    }

    /// Recompute the digest and compare it with the declared one.
    pub fn verify(&self) -> GridResult<()> {
        let actual = content_digest(&self.data);
        if actual.eq_ignore_ascii_case(&self.declared_digest) {
            Ok(())
        } else {
            Err(GridError::Rejected(format!(
                "archive digest mismatch: declared {}, computed {}",
                self.declared_digest, actual
            )))
        }
    }

    /// Decode the named resources held by the archive.
    pub fn entries(&self) -> Result<BTreeMap<String, Bytes>> {
        let manifest: Manifest = serde_json::from_slice(&self.data)?;
        Ok(manifest
            .entries
            .into_iter()
            .map(|(name, data)| (name, Bytes::from(data)))
            .collect())
    }
}
