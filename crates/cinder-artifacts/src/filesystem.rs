//! Filesystem artifact store.
//!
//! Layout under the root directory:
//!
//! ```text
//! blobs/<aa>/<digest>[.zst]
//! tmp/
//! ```
//!
//! Blobs are written to `tmp/` first and moved into place with a
//! no-clobber rename, so concurrent writers of the same digest never
//! observe a partial file.

use crate::compression::{Compression, compress, decompress};
use crate::digest::{content_digest, is_valid_digest, shard};
use crate::retention::RetentionIndex;
use async_trait::async_trait;
use cinder_core::ids::{JobId, RunId};
use cinder_core::ports::{ArtifactStore, StoreStats};
use cinder_core::run::ArtifactRef;
use cinder_core::{Error, Result};
use std::fmt::Display;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub struct FilesystemArtifactStore {
    root: PathBuf,
    compression: Compression,
    index: RetentionIndex,
    gc: RwLock<()>,
}

fn unavailable(err: impl Display) -> Error {
    Error::ArtifactStoreUnavailable(err.to_string())
}

fn extension(compression: Compression) -> &'static str {
    match compression {
        Compression::None => "",
        Compression::Zstd => ".zst",
    }
}

fn blob_path(root: &Path, digest: &str, compression: Compression) -> PathBuf {
    root.join("blobs")
        .join(shard(digest))
        .join(format!("{}{}", digest, extension(compression)))
}

/// Candidate locations, preferred encoding first.
fn blob_candidates(root: &Path, digest: &str, preferred: Compression) -> [(PathBuf, Compression); 2] {
    let other = match preferred {
        Compression::None => Compression::Zstd,
        Compression::Zstd => Compression::None,
    };
    [
        (blob_path(root, digest, preferred), preferred),
        (blob_path(root, digest, other), other),
    ]
}

impl FilesystemArtifactStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("blobs")).map_err(unavailable)?;
        std::fs::create_dir_all(root.join("tmp")).map_err(unavailable)?;
        Ok(Self {
            root,
            compression: Compression::default(),
            index: RetentionIndex::new(),
            gc: RwLock::new(()),
        })
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn write_blob(root: &Path, digest: &str, data: &[u8], compression: Compression) -> Result<bool> {
    let candidates = blob_candidates(root, digest, compression);
    if candidates.iter().any(|(p, _)| p.exists()) {
        return Ok(false);
    }

    let path = &candidates[0].0;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(unavailable)?;
    }
    let encoded = compress(data, compression)?;
    let mut tmp = tempfile::NamedTempFile::new_in(root.join("tmp")).map_err(unavailable)?;
    tmp.write_all(&encoded).map_err(unavailable)?;
    tmp.as_file().sync_all().map_err(unavailable)?;

    match tmp.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(unavailable(e.error)),
    }
}

fn read_blob(root: &Path, digest: &str, compression: Compression) -> Result<Vec<u8>> {
    if !is_valid_digest(digest) {
        return Err(Error::ArtifactNotFound(digest.to_string()));
    }
    for (path, encoding) in blob_candidates(root, digest, compression) {
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(unavailable(e)),
        };
        let data = decompress(&raw, encoding)?;
        if content_digest(&data) != digest {
            return Err(Error::ArtifactStoreUnavailable(format!(
                "blob {} is corrupt",
                digest
            )));
        }
        return Ok(data);
    }
    Err(Error::ArtifactNotFound(digest.to_string()))
}

fn remove_blob(root: &Path, digest: &str) -> Result<bool> {
    let mut removed = false;
    for (path, _) in blob_candidates(root, digest, Compression::default()) {
        match std::fs::remove_file(&path) {
            Ok(()) => removed = true,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(unavailable(e)),
        }
    }
    Ok(removed)
}

fn scan_blobs(root: &Path) -> Result<(usize, u64)> {
    let mut count = 0;
    let mut bytes = 0;
    for shard in std::fs::read_dir(root.join("blobs")).map_err(unavailable)? {
        let shard = shard.map_err(unavailable)?;
        if !shard.file_type().map_err(unavailable)?.is_dir() {
            continue;
        }
        for blob in std::fs::read_dir(shard.path()).map_err(unavailable)? {
            let meta = blob.map_err(unavailable)?.metadata().map_err(unavailable)?;
            if meta.is_file() {
                count += 1;
                bytes += meta.len();
            }
        }
    }
    Ok((count, bytes))
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("artifact store task failed: {}", e)))?
}

#[async_trait]
impl ArtifactStore for FilesystemArtifactStore {
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

        let root = self.root.clone();
        let compression = self.compression;
        let key = digest.clone();
        let stored = blocking(move || write_blob(&root, &key, &bytes, compression)).await?;
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
        let root = self.root.clone();
        let compression = self.compression;
        let digest = artifact.digest.clone();
        blocking(move || read_blob(&root, &digest, compression)).await
    }

    async fn contains(&self, digest: &str) -> Result<bool> {
        if !is_valid_digest(digest) {
            return Ok(false);
        }
        Ok(blob_candidates(&self.root, digest, self.compression)
            .iter()
            .any(|(p, _)| p.exists()))
    }

    async fn retain(&self, run_id: RunId) -> Result<()> {
        let holds = self.index.retain(run_id);
        debug!(%run_id, holds, "retained run artifacts");
        Ok(())
    }

    async fn release(&self, run_id: RunId) -> Result<usize> {
        let _guard = self.gc.write().await;
        let orphans = self.index.release(run_id);
        if orphans.is_empty() {
            return Ok(0);
        }

        let root = self.root.clone();
        let removed = blocking(move || {
            let mut removed = 0;
            for digest in &orphans {
                match remove_blob(&root, digest) {
                    Ok(true) => removed += 1,
                    Ok(false) => {}
                    Err(e) => warn!(%digest, error = %e, "failed to remove blob"),
                }
            }
            Ok(removed)
        })
        .await?;
        info!(%run_id, removed, "released run artifacts");
        Ok(removed)
    }

    async fn list(&self, run_id: RunId) -> Result<Vec<ArtifactRef>> {
        Ok(self.index.list(run_id))
    }

    async fn stats(&self) -> Result<StoreStats> {
        let root = self.root.clone();
        let (blobs, bytes) = blocking(move || scan_blobs(&root)).await?;
        Ok(StoreStats {
            blobs,
            bytes,
            runs: self.index.runs(),
        })
    }
}
