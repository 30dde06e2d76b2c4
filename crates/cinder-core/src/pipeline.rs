//! Pipeline definition types.
//!
//! These types represent the user-authored pipeline YAML configuration.
//! Structural checks that only need a single job or step live here; checks
//! that need the whole graph (dependencies, cycles, artifact wiring) live in
//! the scheduler's graph builder.

use crate::gate::GatePolicy;
use crate::interpolation::{self, Reference};
use crate::{Error, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineDefinition {
    #[serde(default = "default_version")]
    pub version: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    pub jobs: Vec<JobDefinition>,
}

fn default_version() -> String {
    "1".to_string()
}

impl PipelineDefinition {
    /// Parse a definition from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Load and parse a definition file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Find a job definition by name.
    pub fn job(&self, name: &str) -> Option<&JobDefinition> {
        self.jobs.iter().find(|j| j.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobDefinition {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    pub steps: Vec<StepDefinition>,
    /// Files produced by this job and published to the artifact store.
    #[serde(default)]
    pub outputs: Vec<ArtifactOutput>,
    /// Artifacts from upstream jobs materialised before the first step.
    #[serde(default)]
    pub artifacts: Vec<ArtifactInput>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl JobDefinition {
    /// Check the job in isolation.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidPipeline("job name must not be empty".into()));
        }
        if self.steps.is_empty() {
            return Err(Error::InvalidPipeline(format!(
                "job '{}' has no steps",
                self.name
            )));
        }

        let mut step_names = HashSet::new();
        for step in &self.steps {
            if !step_names.insert(step.name.as_str()) {
                return Err(Error::InvalidPipeline(format!(
                    "job '{}' declares step '{}' more than once",
                    self.name, step.name
                )));
            }
            step.validate().map_err(|e| match e {
                Error::InvalidPipeline(msg) => {
                    Error::InvalidPipeline(format!("job '{}': {}", self.name, msg))
                }
                other => other,
            })?;
        }

        let mut output_names = HashSet::new();
        for output in &self.outputs {
            if output.name.trim().is_empty() || output.path.trim().is_empty() {
                return Err(Error::InvalidPipeline(format!(
                    "job '{}' declares an output without a name or path",
                    self.name
                )));
            }
            if !output_names.insert(output.name.as_str()) {
                return Err(Error::InvalidPipeline(format!(
                    "job '{}' declares output '{}' more than once",
                    self.name, output.name
                )));
            }
        }

        self.retry.validate().map_err(|msg| {
            Error::InvalidPipeline(format!("job '{}': {}", self.name, msg))
        })?;

        Ok(())
    }

    /// Find a declared output by name.
    pub fn output(&self, name: &str) -> Option<&ArtifactOutput> {
        self.outputs.iter().find(|o| o.name == name)
    }

    pub fn has_gate(&self) -> bool {
        self.steps.iter().any(|s| s.gate.is_some())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepDefinition {
    pub name: String,
    /// Shell command. Mutually exclusive with `uses`.
    #[serde(default)]
    pub run: Option<String>,
    #[serde(default)]
    pub shell: Option<String>,
    /// Adapter invocation. Mutually exclusive with `run`.
    #[serde(default)]
    pub uses: Option<AdapterKind>,
    #[serde(default)]
    pub with: BTreeMap<String, String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Secret names exported to the step as environment variables.
    #[serde(default)]
    pub secrets: Vec<String>,
    /// Marks the step as a quality gate.
    #[serde(default)]
    pub gate: Option<GatePolicy>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// What a step does once its definition is validated.
#[derive(Debug, Clone, Copy)]
pub enum StepAction<'a> {
    Command {
        script: &'a str,
        shell: &'a str,
    },
    Adapter {
        kind: AdapterKind,
        params: &'a BTreeMap<String, String>,
    },
}

const DEFAULT_SHELL: &str = "sh";

impl StepDefinition {
    pub fn action(&self) -> Result<StepAction<'_>> {
        match (&self.run, self.uses) {
            (Some(script), None) => Ok(StepAction::Command {
                script,
                shell: self.shell.as_deref().unwrap_or(DEFAULT_SHELL),
            }),
            (None, Some(kind)) => Ok(StepAction::Adapter {
                kind,
                params: &self.with,
            }),
            (Some(_), Some(_)) => Err(Error::InvalidPipeline(format!(
                "step '{}' declares both 'run' and 'uses'",
                self.name
            ))),
            (None, None) => Err(Error::InvalidPipeline(format!(
                "step '{}' declares neither 'run' nor 'uses'",
                self.name
            ))),
        }
    }

    pub fn is_gate(&self) -> bool {
        self.gate.is_some()
    }

    /// Every secret the step needs: explicit `secrets` entries plus
    /// `${{ secrets.NAME }}` placeholders, deduplicated in first-seen order.
    pub fn secret_names(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut names = Vec::new();
        let placeholders = self
            .run
            .iter()
            .chain(self.with.values())
            .chain(self.env.values())
            .flat_map(|v| interpolation::secret_names(v));
        for name in self.secrets.iter().cloned().chain(placeholders) {
            if seen.insert(name.clone()) {
                names.push(name);
            }
        }
        names
    }

    /// Check the step in isolation.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidPipeline("step name must not be empty".into()));
        }

        match self.action()? {
            StepAction::Command { script, .. } => {
                if script.trim().is_empty() {
                    return Err(Error::InvalidPipeline(format!(
                        "step '{}' has an empty command",
                        self.name
                    )));
                }
                if self.gate.is_some() {
                    return Err(Error::InvalidPipeline(format!(
                        "step '{}': only adapter steps can be quality gates",
                        self.name
                    )));
                }
                if !self.with.is_empty() {
                    return Err(Error::InvalidPipeline(format!(
                        "step '{}': 'with' is only valid on adapter steps",
                        self.name
                    )));
                }
            }
            StepAction::Adapter { kind, params } => {
                for required in kind.required_params() {
                    let present = params.get(*required).is_some_and(|v| !v.trim().is_empty());
                    if !present {
                        return Err(Error::InvalidPipeline(format!(
                            "step '{}': adapter '{}' requires parameter '{}'",
                            self.name, kind, required
                        )));
                    }
                }
            }
        }

        for name in &self.secrets {
            if !is_env_name(name) {
                return Err(Error::InvalidPipeline(format!(
                    "step '{}': '{}' is not a valid secret name",
                    self.name, name
                )));
            }
        }
        for key in self.env.keys() {
            if !is_env_name(key) {
                return Err(Error::InvalidPipeline(format!(
                    "step '{}': '{}' is not a valid environment variable name",
                    self.name, key
                )));
            }
        }

        for value in self.run.iter().chain(self.with.values()).chain(self.env.values()) {
            for reference in interpolation::references(value)? {
                if let Reference::Secret(name) = reference
                    && !is_env_name(&name)
                {
                    return Err(Error::InvalidPipeline(format!(
                        "step '{}': '{}' is not a valid secret name",
                        self.name, name
                    )));
                }
            }
        }

        Ok(())
    }
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Recognised adapter names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    Build,
    Scan,
    Deploy,
    Publish,
}

impl AdapterKind {
    pub const ALL: [AdapterKind; 4] = [
        AdapterKind::Build,
        AdapterKind::Scan,
        AdapterKind::Deploy,
        AdapterKind::Publish,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterKind::Build => "build",
            AdapterKind::Scan => "scan",
            AdapterKind::Deploy => "deploy",
            AdapterKind::Publish => "publish",
        }
    }

    /// Parameters that must be present in `with`.
    pub fn required_params(&self) -> &'static [&'static str] {
        match self {
            AdapterKind::Build => &[],
            AdapterKind::Scan => &["project"],
            AdapterKind::Deploy => &["source", "target"],
            AdapterKind::Publish => &["source"],
        }
    }
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AdapterKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        AdapterKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::AdapterNotFound(s.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactOutput {
    pub name: String,
    /// Path of the file, relative to the job workspace.
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactInput {
    /// Producing job.
    pub from: String,
    /// Output name declared by the producing job.
    pub name: String,
    /// Destination inside this job's workspace; defaults to the producer's path.
    #[serde(default)]
    pub path: Option<String>,
}

/// Per-job retry policy applied to every non-gate step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RetryPolicy {
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_true")]
    pub exponential_backoff: bool,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_delay_ms() -> u64 {
    1000
}
fn default_true() -> bool {
    true
}
fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            delay_ms: default_delay_ms(),
            exponential_backoff: true,
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        let millis = if self.exponential_backoff {
            let factor = 2u64.saturating_pow(retry - 1);
            self.delay_ms.saturating_mul(factor)
        } else {
            self.delay_ms
        };
        Duration::from_millis(millis.min(self.max_delay_ms))
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.max_delay_ms < self.delay_ms {
            return Err("retry.max_delay_ms must not be smaller than retry.delay_ms".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter_step(kind: AdapterKind, params: &[(&str, &str)]) -> StepDefinition {
        StepDefinition {
            name: "step".into(),
            run: None,
            shell: None,
            uses: Some(kind),
            with: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            env: BTreeMap::new(),
            secrets: vec![],
            gate: None,
            timeout_seconds: None,
        }
    }

    #[test]
    fn test_adapter_required_params() {
        let step = adapter_step(AdapterKind::Deploy, &[("source", "dist")]);
        let err = step.validate().unwrap_err();
        assert!(err.to_string().contains("requires parameter 'target'"));

        let step = adapter_step(AdapterKind::Deploy, &[("source", "dist"), ("target", "s3://b")]);
        step.validate().unwrap();
    }

    #[test]
    fn test_gate_requires_adapter() {
        let yaml = r#"
name: unit
run: npm test
gate:
  blocking_metrics: [bugs]
"#;
        let step: StepDefinition = serde_yaml::from_str(yaml).unwrap();
        assert!(step.validate().is_err());
    }

    #[test]
    fn test_run_and_uses_are_exclusive() {
        let mut step = adapter_step(AdapterKind::Build, &[]);
        step.run = Some("make".into());
        assert!(matches!(step.action(), Err(Error::InvalidPipeline(_))));
    }

    #[test]
    fn test_secret_names_are_collected() {
        let mut step = adapter_step(
            AdapterKind::Scan,
            &[("project", "app"), ("token", "${{ secrets.SONAR_TOKEN }}")],
        );
        step.secrets = vec!["AWS_KEY".into(), "SONAR_TOKEN".into()];
        assert_eq!(step.secret_names(), vec!["AWS_KEY", "SONAR_TOKEN"]);
    }

    #[test]
    fn test_retry_delay() {
        let policy = RetryPolicy {
            max_retries: 3,
            delay_ms: 100,
            exponential_backoff: true,
            max_delay_ms: 250,
        };
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(250));

        let flat = RetryPolicy {
            exponential_backoff: false,
            ..policy
        };
        assert_eq!(flat.delay_for(3), Duration::from_millis(100));
    }

    #[test]
    fn test_unknown_adapter_fails_to_parse() {
        let yaml = "name: x\nuses: teleport\n";
        assert!(serde_yaml::from_str::<StepDefinition>(yaml).is_err());
    }
}
