//! Core runner trait and types.

use crate::cancel::CancelToken;
use async_trait::async_trait;
use cinder_core::interpolation::InterpolationContext;
use cinder_core::pipeline::{AdapterKind, StepAction, StepDefinition};
use cinder_core::run::LogRef;
use cinder_core::secrets::SecretBundle;
use cinder_core::{Error, JobId, Result, RunId, StepId};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Output line from step execution.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub content: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Output stream type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// What to execute, with every placeholder resolved.
#[derive(Debug, Clone)]
pub enum StepKind {
    Command {
        script: String,
        shell: String,
    },
    Adapter {
        kind: AdapterKind,
        params: BTreeMap<String, String>,
    },
}

/// One attempt of one step.
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub run_id: RunId,
    pub job: JobId,
    pub step: StepId,
    /// 1-based.
    pub attempt: u32,
    pub kind: StepKind,
    /// Explicit bindings only; nothing is inherited implicitly.
    pub env: BTreeMap<String, String>,
    pub secrets: SecretBundle,
    pub workspace: PathBuf,
    pub timeout: Duration,
    /// Run cancellation; a running step is asked to stop when it fires.
    pub cancel: CancelToken,
}

/// Result of step execution. Output lives behind `log`.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub exit_code: i32,
    pub success: bool,
    pub duration_ms: u64,
    pub log: LogRef,
    /// Structured report from an adapter, if it produced one.
    pub report: Option<Value>,
}

/// Executes a single step attempt.
///
/// Implementations enforce `request.timeout`, returning
/// [`Error::StepTimeout`] after terminating the work. They never retry.
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn run(&self, request: StepRequest) -> Result<StepResult>;
}

/// The resolved action and environment of a step definition.
#[derive(Debug, Clone)]
pub struct PreparedStep {
    pub kind: StepKind,
    pub env: BTreeMap<String, String>,
}

/// Resolve placeholders in a step definition.
///
/// `variables` are the merged pipeline and job variables. The step's
/// environment is layered on top, then its explicitly listed secrets are
/// exported under their own names.
pub fn prepare_step(
    def: &StepDefinition,
    variables: &BTreeMap<String, String>,
    secrets: &SecretBundle,
) -> Result<PreparedStep> {
    let ctx = InterpolationContext::new()
        .with_variables(variables.iter().map(|(k, v)| (k.clone(), v.clone())))
        .with_secrets(secrets);

    let mut env = variables.clone();
    for (key, value) in &def.env {
        env.insert(key.clone(), ctx.interpolate(value)?);
    }
    for name in &def.secrets {
        let value = secrets
            .get(name)
            .ok_or_else(|| Error::SecretNotFound(name.clone()))?;
        env.insert(name.clone(), value.expose().to_string());
    }

    let kind = match def.action()? {
        StepAction::Command { script, shell } => StepKind::Command {
            script: ctx.interpolate(script)?,
            shell: shell.to_string(),
        },
        StepAction::Adapter { kind, params } => StepKind::Adapter {
            kind,
            params: params
                .iter()
                .map(|(k, v)| Ok((k.clone(), ctx.interpolate(v)?)))
                .collect::<Result<_>>()?,
        },
    };

    Ok(PreparedStep { kind, env })
}

/// Configuration shared by the local runners.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Engine environment variables passed through to steps.
    pub inherit_env: Vec<String>,
    pub log_dir: PathBuf,
}

pub const DEFAULT_INHERIT_ENV: &[&str] = &["PATH", "HOME", "LANG", "TMPDIR"];

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            inherit_env: DEFAULT_INHERIT_ENV.iter().map(|s| s.to_string()).collect(),
            log_dir: std::env::temp_dir().join("cinder").join("logs"),
        }
    }
}

impl RunnerConfig {
    /// The allowlisted part of the engine's environment.
    pub fn inherited_env(&self) -> BTreeMap<String, String> {
        self.inherit_env
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|v| (key.clone(), v)))
            .collect()
    }
}
