//! Progress events emitted by the engine while a run executes.

use crate::gate::{GateDecision, GateStatus};
use crate::ids::*;
use crate::run::{JobStatus, RunStatus};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    RunStarted(RunStartedPayload),
    JobStarted(JobStartedPayload),
    StepCompleted(StepCompletedPayload),
    GateEvaluated(GateEvaluatedPayload),
    JobCompleted(JobCompletedPayload),
    RunCompleted(RunCompletedPayload),
}

impl Event {
    pub fn run_id(&self) -> RunId {
        match self {
            Event::RunStarted(p) => p.run_id,
            Event::JobStarted(p) => p.run_id,
            Event::StepCompleted(p) => p.run_id,
            Event::GateEvaluated(p) => p.run_id,
            Event::JobCompleted(p) => p.run_id,
            Event::RunCompleted(p) => p.run_id,
        }
    }

    /// Dotted topic name, e.g. `run.<id>.job.deploy.completed`.
    pub fn subject(&self) -> String {
        match self {
            Event::RunStarted(p) => format!("run.{}.started", p.run_id),
            Event::JobStarted(p) => format!("run.{}.job.{}.started", p.run_id, p.job),
            Event::StepCompleted(p) => {
                format!("run.{}.job.{}.step.{}.completed", p.run_id, p.job, p.step)
            }
            Event::GateEvaluated(p) => format!("run.{}.job.{}.gate", p.run_id, p.job),
            Event::JobCompleted(p) => format!("run.{}.job.{}.completed", p.run_id, p.job),
            Event::RunCompleted(p) => format!("run.{}.completed", p.run_id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunStartedPayload {
    pub run_id: RunId,
    pub pipeline: String,
    pub jobs: usize,
    pub waves: usize,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobStartedPayload {
    pub run_id: RunId,
    pub job: JobId,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepCompletedPayload {
    pub run_id: RunId,
    pub job: JobId,
    pub step: StepId,
    pub attempt: u32,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    /// Set when another attempt follows.
    pub will_retry: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GateEvaluatedPayload {
    pub run_id: RunId,
    pub job: JobId,
    pub step: StepId,
    pub status: GateStatus,
    pub decision: GateDecision,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobCompletedPayload {
    pub run_id: RunId,
    pub job: JobId,
    pub status: JobStatus,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunCompletedPayload {
    pub run_id: RunId,
    pub status: RunStatus,
    pub degraded: bool,
    pub duration_ms: Option<u64>,
}
