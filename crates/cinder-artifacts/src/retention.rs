//! Reference-counted retention of artifact references per run.

use cinder_core::ids::RunId;
use cinder_core::run::ArtifactRef;
use dashmap::DashMap;
use std::collections::BTreeSet;

#[derive(Debug, Default)]
struct RunEntry {
    holds: usize,
    artifacts: Vec<ArtifactRef>,
}

/// Tracks which runs reference which digests, and how many holds keep each
/// run's references alive. Shared by all store backends.
#[derive(Debug, Default)]
pub struct RetentionIndex {
    runs: DashMap<RunId, RunEntry>,
}

impl RetentionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember an artifact. A second put of the same job output replaces
    /// the earlier reference.
    pub fn record(&self, artifact: ArtifactRef) {
        let mut entry = self.runs.entry(artifact.run_id).or_default();
        entry
            .artifacts
            .retain(|a| !(a.job_id == artifact.job_id && a.name == artifact.name));
        entry.artifacts.push(artifact);
    }

    /// Add a hold and return the new hold count.
    pub fn retain(&self, run_id: RunId) -> usize {
        let mut entry = self.runs.entry(run_id).or_default();
        entry.holds += 1;
        entry.holds
    }

    /// Drop one hold. When no holds remain, forget the run and return the
    /// digests that no other run references.
    pub fn release(&self, run_id: RunId) -> Vec<String> {
        let exhausted = match self.runs.get_mut(&run_id) {
            Some(mut entry) => {
                entry.holds = entry.holds.saturating_sub(1);
                entry.holds == 0
            }
            None => return Vec::new(),
        };
        if !exhausted {
            return Vec::new();
        }

        let Some((_, entry)) = self.runs.remove_if(&run_id, |_, e| e.holds == 0) else {
            return Vec::new();
        };
        let mut digests: BTreeSet<String> =
            entry.artifacts.into_iter().map(|a| a.digest).collect();
        digests.retain(|d| !self.is_referenced(d));
        digests.into_iter().collect()
    }

    pub fn is_referenced(&self, digest: &str) -> bool {
        self.runs
            .iter()
            .any(|e| e.artifacts.iter().any(|a| a.digest == digest))
    }

    pub fn list(&self, run_id: RunId) -> Vec<ArtifactRef> {
        self.runs
            .get(&run_id)
            .map(|e| e.artifacts.clone())
            .unwrap_or_default()
    }

    pub fn holds(&self, run_id: RunId) -> usize {
        self.runs.get(&run_id).map(|e| e.holds).unwrap_or(0)
    }

    pub fn runs(&self) -> usize {
        self.runs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_core::ids::JobId;

    fn artifact(run_id: RunId, job: &str, name: &str, digest: &str) -> ArtifactRef {
        ArtifactRef {
            digest: digest.to_string(),
            name: name.to_string(),
            run_id,
            job_id: JobId::new(job),
            size_bytes: 1,
        }
    }

    #[test]
    fn test_shared_digest_survives_first_release() {
        let index = RetentionIndex::new();
        let (a, b) = (RunId::new(), RunId::new());
        index.retain(a);
        index.retain(b);
        index.record(artifact(a, "build", "bin", "d1"));
        index.record(artifact(b, "build", "bin", "d1"));
        index.record(artifact(a, "test", "report", "d2"));

        assert_eq!(index.release(a), vec!["d2".to_string()]);
        assert!(index.is_referenced("d1"));
        assert_eq!(index.release(b), vec!["d1".to_string()]);
        assert_eq!(index.runs(), 0);
    }

    #[test]
    fn test_holds_are_counted() {
        let index = RetentionIndex::new();
        let run = RunId::new();
        index.retain(run);
        index.retain(run);
        index.record(artifact(run, "build", "bin", "d1"));

        assert!(index.release(run).is_empty());
        assert_eq!(index.holds(run), 1);
        assert_eq!(index.release(run), vec!["d1".to_string()]);
    }

    #[test]
    fn test_record_replaces_same_output() {
        let index = RetentionIndex::new();
        let run = RunId::new();
        index.record(artifact(run, "build", "bin", "d1"));
        index.record(artifact(run, "build", "bin", "d2"));
        let list = index.list(run);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].digest, "d2");
    }

    #[test]
    fn test_release_unknown_run() {
        let index = RetentionIndex::new();
        assert!(index.release(RunId::new()).is_empty());
    }
}
