//! Run and execution types.

use crate::gate::GateOutcome;
use crate::ids::{JobId, RunId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match self {
            RunStatus::Pending => next == RunStatus::Running || next == RunStatus::Cancelled,
            RunStatus::Running => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    /// A gate escalated instead of blocking.
    SucceededWithWarning,
    Failed,
    /// Never ran because an upstream job did not succeed.
    Skipped,
    /// Never ran, or was stopped, because the run was cancelled.
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    /// Whether dependents of a job in this state may run.
    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::SucceededWithWarning)
    }

    /// Status changes only move forward.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match self {
            JobStatus::Pending => matches!(
                next,
                JobStatus::Running | JobStatus::Skipped | JobStatus::Cancelled
            ),
            JobStatus::Running => matches!(
                next,
                JobStatus::Succeeded
                    | JobStatus::SucceededWithWarning
                    | JobStatus::Failed
                    | JobStatus::Cancelled
            ),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::SucceededWithWarning => "succeeded_with_warning",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a stored artifact. The digest addresses the content; the
/// rest records who produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactRef {
    pub digest: String,
    pub name: String,
    pub run_id: RunId,
    pub job_id: JobId,
    pub size_bytes: u64,
}

/// Handle to captured step output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LogRef {
    pub path: PathBuf,
    pub lines: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepRecord {
    pub name: String,
    pub success: bool,
    pub attempts: u32,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    /// One log per attempt, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<LogRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobRecord {
    pub job: JobId,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<ArtifactRef>,
    /// Gate evaluations in step order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gates: Vec<GateOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The upstream job whose failure caused this job to be skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped_because: Option<JobId>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(job: JobId) -> Self {
        Self {
            job,
            status: JobStatus::Pending,
            steps: Vec::new(),
            artifacts: Vec::new(),
            gates: Vec::new(),
            error: None,
            skipped_because: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Move to `next`, rejecting backwards or repeated transitions.
    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::Internal(format!(
                "job '{}' cannot move from {} to {}",
                self.job, self.status, next
            )));
        }
        let now = Utc::now();
        if next == JobStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    /// Attempts made by the most retried step.
    pub fn attempts(&self) -> u32 {
        self.steps.iter().map(|s| s.attempts).max().unwrap_or(0)
    }

    /// Exit code of the last step that ran.
    pub fn exit_code(&self) -> Option<i32> {
        self.steps.last().and_then(|s| s.exit_code)
    }

    pub fn duration_ms(&self) -> Option<u64> {
        let (start, end) = (self.started_at?, self.completed_at?);
        Some((end - start).num_milliseconds().max(0) as u64)
    }
}

/// The first error that put any job into a failed or skipped state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RootCause {
    pub job: JobId,
    pub error: String,
}

/// Mutable state of one execution, owned by the engine.
#[derive(Debug, Clone)]
pub struct Run {
    pub id: RunId,
    pub pipeline_name: String,
    pub status: RunStatus,
    /// Set when a gate escalated.
    pub degraded: bool,
    jobs: Vec<JobRecord>,
    root_cause: Option<RootCause>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Create a pending run. `jobs` fixes the report order.
    pub fn new(pipeline_name: impl Into<String>, jobs: impl IntoIterator<Item = JobId>) -> Self {
        Self::with_id(RunId::new(), pipeline_name, jobs)
    }

    pub fn with_id(
        id: RunId,
        pipeline_name: impl Into<String>,
        jobs: impl IntoIterator<Item = JobId>,
    ) -> Self {
        Self {
            id,
            pipeline_name: pipeline_name.into(),
            status: RunStatus::Pending,
            degraded: false,
            jobs: jobs.into_iter().map(JobRecord::new).collect(),
            root_cause: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        self.set_status(RunStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn finish(&mut self, status: RunStatus) -> Result<()> {
        self.set_status(status)?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    fn set_status(&mut self, next: RunStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::Internal(format!(
                "run {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    pub fn jobs(&self) -> &[JobRecord] {
        &self.jobs
    }

    pub fn job(&self, name: &str) -> Option<&JobRecord> {
        self.jobs.iter().find(|j| j.job.as_str() == name)
    }

    pub fn job_mut(&mut self, name: &str) -> Result<&mut JobRecord> {
        self.jobs
            .iter_mut()
            .find(|j| j.job.as_str() == name)
            .ok_or_else(|| Error::Internal(format!("run has no job '{}'", name)))
    }

    /// Record the root cause unless one is already set.
    pub fn note_failure(&mut self, job: &JobId, error: impl Into<String>) {
        if self.root_cause.is_none() {
            self.root_cause = Some(RootCause {
                job: job.clone(),
                error: error.into(),
            });
        }
    }

    pub fn root_cause(&self) -> Option<&RootCause> {
        self.root_cause.as_ref()
    }

    /// Final status derived from job outcomes.
    pub fn outcome(&self, cancelled: bool) -> RunStatus {
        if cancelled {
            RunStatus::Cancelled
        } else if self.jobs.iter().all(|j| j.status.is_success()) {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        }
    }

    pub fn report(&self) -> RunReport {
        let duration_ms = match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        };
        RunReport {
            run_id: self.id,
            pipeline: self.pipeline_name.clone(),
            status: self.status,
            degraded: self.degraded,
            jobs: self.jobs.clone(),
            root_cause: self.root_cause.clone(),
            started_at: self.started_at,
            completed_at: self.completed_at,
            duration_ms,
        }
    }
}

/// Machine-readable summary of a finished run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunReport {
    pub run_id: RunId,
    pub pipeline: String,
    pub status: RunStatus,
    pub degraded: bool,
    pub jobs: Vec<JobRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_cause: Option<RootCause>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl RunReport {
    /// Process exit code: 0 succeeded, 1 failed, 2 cancelled.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Succeeded => 0,
            RunStatus::Cancelled => 2,
            _ => 1,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn job(&self, name: &str) -> Option<&JobRecord> {
        self.jobs.iter().find(|j| j.job.as_str() == name)
    }

    pub fn status_of(&self, name: &str) -> Option<JobStatus> {
        self.job(name).map(|j| j.status)
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &ArtifactRef> {
        self.jobs.iter().flat_map(|j| j.artifacts.iter())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
