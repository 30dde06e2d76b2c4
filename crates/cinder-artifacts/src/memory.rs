//! In-memory artifact store, used by tests and single-shot runs.

use crate::digest::content_digest;
use crate::retention::RetentionIndex;
use async_trait::async_trait;
use cinder_core::ids::{JobId, RunId};
use cinder_core::ports::{ArtifactStore, StoreStats};
use cinder_core::run::ArtifactRef;
use cinder_core::{Error, Result};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    blobs: DashMap<String, Arc<[u8]>>,
    index: RetentionIndex,
    // Puts hold it shared; garbage collection holds it exclusively.
    gc: RwLock<()>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(
        &self,
        run_id: RunId,
        job_id: &JobId,
        name: &str,
        bytes: Vec<u8>,
    ) -> Result<ArtifactRef> {
        let _guard = self.gc.read().await;
        let digest = content_digest(&bytes);
        let size_bytes = bytes.len() as u64;

        let stored = match self.blobs.entry(digest.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(Arc::from(bytes));
                true
            }
            Entry::Occupied(_) => false,
        };
        debug!(%run_id, job = %job_id, name, %digest, stored, "put artifact");

        let artifact = ArtifactRef {
            digest,
            name: name.to_string(),
            run_id,
            job_id: job_id.clone(),
            size_bytes,
        };
        self.index.record(artifact.clone());
        Ok(artifact)
    }

    async fn get(&self, artifact: &ArtifactRef) -> Result<Vec<u8>> {
        self.blobs
            .get(&artifact.digest)
            .map(|blob| blob.to_vec())
            .ok_or_else(|| Error::ArtifactNotFound(artifact.digest.clone()))
    }

    async fn contains(&self, digest: &str) -> Result<bool> {
        Ok(self.blobs.contains_key(digest))
    }

    async fn retain(&self, run_id: RunId) -> Result<()> {
        let holds = self.index.retain(run_id);
        debug!(%run_id, holds, "retained run artifacts");
        Ok(())
    }

    async fn release(&self, run_id: RunId) -> Result<usize> {
        let _guard = self.gc.write().await;
        let mut removed = 0;
        for digest in self.index.release(run_id) {
            if self.blobs.remove(&digest).is_some() {
                removed += 1;
            }
        }
        debug!(%run_id, removed, "released run artifacts");
        Ok(removed)
    }

    async fn list(&self, run_id: RunId) -> Result<Vec<ArtifactRef>> {
        Ok(self.index.list(run_id))
    }

    async fn stats(&self) -> Result<StoreStats> {
        Ok(StoreStats {
            blobs: self.blobs.len(),
            bytes: self.blobs.iter().map(|b| b.value().len() as u64).sum(),
            runs: self.index.runs(),
        })
    }
}
