//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the engine and the outside
//! world: blob storage, credential backends and external tools.

use crate::ids::{JobId, RunId};
use crate::run::ArtifactRef;
use crate::secrets::{SecretBundle, SecretValue};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Content-addressed storage for artifacts passed between jobs.
///
/// Writes are insert-if-absent by digest, so implementations only need
/// atomicity at the blob level.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `bytes` and return a reference carrying the producer.
    async fn put(
        &self,
        run_id: RunId,
        job_id: &JobId,
        name: &str,
        bytes: Vec<u8>,
    ) -> Result<ArtifactRef>;

    /// Read back the bytes behind a reference.
    async fn get(&self, artifact: &ArtifactRef) -> Result<Vec<u8>>;

    /// Whether a blob with this digest is stored.
    async fn contains(&self, digest: &str) -> Result<bool>;

    /// Add a retention hold for a run.
    async fn retain(&self, run_id: RunId) -> Result<()>;

    /// Drop one hold. When the last hold goes, the run's references are
    /// forgotten and unreferenced blobs removed. Returns blobs removed.
    async fn release(&self, run_id: RunId) -> Result<usize>;

    /// Artifacts recorded for a run.
    async fn list(&self, run_id: RunId) -> Result<Vec<ArtifactRef>>;

    async fn stats(&self) -> Result<StoreStats>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub blobs: usize,
    /// Bytes held by the backend.
    pub bytes: u64,
    pub runs: usize,
}

/// Secret backend.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Look a secret up. `Ok(None)` means this provider does not have it.
    async fn get(&self, name: &str) -> Result<Option<SecretValue>>;

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// A single adapter invocation.
#[derive(Debug, Clone)]
pub struct AdapterCall {
    pub name: String,
    /// Parameters with placeholders already resolved.
    pub params: BTreeMap<String, String>,
    pub secrets: SecretBundle,
    pub env: BTreeMap<String, String>,
    pub workspace: PathBuf,
}

impl AdapterCall {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

/// What an external tool returned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: Vec<String>,
    #[serde(default)]
    pub stderr: Vec<String>,
    /// Structured report, e.g. a quality gate response.
    #[serde(default)]
    pub report: Option<Value>,
}

impl RawResult {
    pub fn success() -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            ..Self::default()
        }
    }

    pub fn failure(exit_code: i32) -> Self {
        Self {
            success: false,
            exit_code: Some(exit_code),
            ..Self::default()
        }
    }

    pub fn with_report(mut self, report: Value) -> Self {
        self.report = Some(report);
        self
    }

    pub fn with_stdout(mut self, line: impl Into<String>) -> Self {
        self.stdout.push(line.into());
        self
    }
}

/// Uniform contract for external tools (build, scan, deploy, publish).
#[async_trait]
pub trait Adapter: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, call: &AdapterCall) -> Result<RawResult>;
}
