//! Quality gate types.
//!
//! A gate step is an adapter step whose report is interpreted as a
//! [`GateResult`]. The scheduler's evaluator turns that result and the
//! step's [`GatePolicy`] into a [`GateDecision`].

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Pass,
    Fail,
    /// The tool was unreachable or its response could not be understood.
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MetricViolation {
    pub metric: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<String>,
}

impl MetricViolation {
    pub fn new(metric: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            actual: None,
            threshold: None,
        }
    }

    pub fn with_values(mut self, actual: impl Into<String>, threshold: impl Into<String>) -> Self {
        self.actual = Some(actual.into());
        self.threshold = Some(threshold.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct GateResult {
    pub status: GateStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<MetricViolation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl GateResult {
    pub fn pass() -> Self {
        Self {
            status: GateStatus::Pass,
            violations: Vec::new(),
            message: None,
        }
    }

    pub fn fail(violations: Vec<MetricViolation>) -> Self {
        Self {
            status: GateStatus::Fail,
            violations,
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: GateStatus::Error,
            violations: Vec::new(),
            message: Some(message.into()),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Interpret an adapter report.
    ///
    /// Two shapes are understood: the native one
    /// (`{"status": "pass", "violations": [{"metric": ..}], "message": ..}`)
    /// and a SonarQube quality gate response (`{"projectStatus": {..}}`).
    /// Anything else is an `Error` result.
    pub fn from_report(report: &Value) -> Self {
        if let Some(project) = report.get("projectStatus") {
            return Self::from_sonar(project);
        }

        let Some(status) = report.get("status").and_then(Value::as_str) else {
            return Self::error("gate report has no status");
        };
        let status = match status.to_ascii_lowercase().as_str() {
            "pass" | "passed" | "ok" => GateStatus::Pass,
            "fail" | "failed" => GateStatus::Fail,
            "error" => GateStatus::Error,
            other => return Self::error(format!("unknown gate status '{}'", other)),
        };

        let violations = match report.get("violations") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => {
                let mut parsed = Vec::with_capacity(items.len());
                for item in items {
                    match parse_violation(item) {
                        Some(v) => parsed.push(v),
                        None => return Self::error("malformed violation in gate report"),
                    }
                }
                parsed
            }
            Some(_) => return Self::error("gate report violations must be a list"),
        };

        Self {
            status,
            violations,
            message: report
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }

    fn from_sonar(project: &Value) -> Self {
        let status = project.get("status").and_then(Value::as_str);
        let violations: Vec<MetricViolation> = project
            .get("conditions")
            .and_then(Value::as_array)
            .map(|conditions| {
                conditions
                    .iter()
                    .filter(|c| c.get("status").and_then(Value::as_str) == Some("ERROR"))
                    .filter_map(|c| {
                        let metric = c.get("metricKey")?.as_str()?;
                        Some(MetricViolation {
                            metric: metric.to_string(),
                            actual: json_string(c.get("actualValue")),
                            threshold: json_string(c.get("errorThreshold")),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        match status {
            Some("OK") => Self::pass(),
            Some("ERROR") => Self::fail(violations),
            Some(other) => Self::error(format!("quality gate status '{}'", other)),
            None => Self::error("quality gate response has no status"),
        }
    }

    /// Names of the violated metrics.
    pub fn violated_metrics(&self) -> impl Iterator<Item = &str> {
        self.violations.iter().map(|v| v.metric.as_str())
    }
}

fn parse_violation(item: &Value) -> Option<MetricViolation> {
    match item {
        Value::String(metric) => Some(MetricViolation::new(metric.clone())),
        Value::Object(map) => Some(MetricViolation {
            metric: map.get("metric")?.as_str()?.to_string(),
            actual: json_string(map.get("actual")),
            threshold: json_string(map.get("threshold")),
        }),
        _ => None,
    }
}

fn json_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Gating configuration attached to a gate step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct GatePolicy {
    /// Treat an unreachable or broken tool as a block. When false the job
    /// proceeds and the run is flagged as degraded.
    #[serde(default = "default_fail_on_error")]
    pub fail_on_error: bool,
    #[serde(default)]
    pub blocking_metrics: BTreeSet<String>,
    #[serde(default)]
    pub warn_only_metrics: BTreeSet<String>,
}

fn default_fail_on_error() -> bool {
    true
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            fail_on_error: true,
            blocking_metrics: BTreeSet::new(),
            warn_only_metrics: BTreeSet::new(),
        }
    }
}

impl GatePolicy {
    pub fn strict() -> Self {
        Self::default()
    }

    pub fn best_effort() -> Self {
        Self {
            fail_on_error: false,
            ..Self::default()
        }
    }

    pub fn blocking<I, S>(mut self, metrics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blocking_metrics.extend(metrics.into_iter().map(Into::into));
        self
    }

    pub fn warn_only<I, S>(mut self, metrics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.warn_only_metrics.extend(metrics.into_iter().map(Into::into));
        self
    }

    pub fn is_blocking(&self, metric: &str) -> bool {
        self.blocking_metrics.contains(metric)
    }

    /// Blocking wins when a metric is listed in both sets.
    pub fn is_warn_only(&self, metric: &str) -> bool {
        !self.is_blocking(metric) && self.warn_only_metrics.contains(metric)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GateDecision {
    Proceed,
    Block { reason: String },
    /// Proceed, but mark the job as succeeded with a warning.
    Escalate { reason: String },
}

impl GateDecision {
    pub fn is_proceed(&self) -> bool {
        matches!(self, GateDecision::Proceed)
    }

    pub fn is_block(&self) -> bool {
        matches!(self, GateDecision::Block { .. })
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            GateDecision::Proceed => None,
            GateDecision::Block { reason } | GateDecision::Escalate { reason } => Some(reason),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            GateDecision::Proceed => "proceed",
            GateDecision::Block { .. } => "block",
            GateDecision::Escalate { .. } => "escalate",
        }
    }
}

/// A gate evaluation recorded against its job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct GateOutcome {
    pub step: String,
    pub result: GateResult,
    pub decision: GateDecision,
}
