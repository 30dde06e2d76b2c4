//! Per-job working directories on the host.

use cinder_core::{Error, JobId, Result, RunId};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

use crate::logs::sanitize_file_name;

/// Working directory scope for one job: `<base>/<run>/<job>`.
#[derive(Debug, Clone)]
pub struct Workspace {
    path: PathBuf,
    keep: bool,
}

impl Workspace {
    pub fn new(base: &Path, run_id: RunId, job: &JobId) -> Self {
        Self {
            path: base
                .join(run_id.to_string())
                .join(sanitize_file_name(job.as_str())),
            keep: false,
        }
    }

    /// Leave the directory in place on cleanup.
    pub fn keep(mut self, keep: bool) -> Self {
        self.keep = keep;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn prepare(&self) -> Result<()> {
        debug!(workspace = %self.path.display(), "preparing workspace");
        tokio::fs::create_dir_all(&self.path).await?;
        Ok(())
    }

    /// Resolve a path declared in a pipeline against the workspace,
    /// refusing anything that would land outside it.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let candidate = Path::new(relative);
        let escapes = candidate.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if escapes || relative.trim().is_empty() {
            return Err(Error::InvalidPipeline(format!(
                "path '{}' must be relative to the job workspace",
                relative
            )));
        }
        Ok(self.path.join(candidate))
    }

    pub async fn cleanup(&self) -> Result<()> {
        if self.keep {
            info!(workspace = %self.path.display(), "keeping workspace");
            return Ok(());
        }
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(workspace = %self.path.display(), error = %e, "failed to remove workspace");
                Err(e.into())
            }
        }
    }
}
