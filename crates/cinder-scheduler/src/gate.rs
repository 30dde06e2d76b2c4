//! Quality gate evaluation.

use cinder_core::gate::{GateDecision, GatePolicy, GateResult, GateStatus};
use serde_json::Value;

/// Turns gate results into decisions according to a [`GatePolicy`].
///
/// | result | condition                          | decision |
/// |--------|------------------------------------|----------|
/// | Pass   |                                    | Proceed  |
/// | Fail   | any blocking-metric violation      | Block    |
/// | Fail   | every violation warn-only          | Escalate |
/// | Fail   | otherwise                          | Block    |
/// | Error  | `fail_on_error`                    | Block    |
/// | Error  | `!fail_on_error`                   | Escalate |
#[derive(Debug, Clone, Copy, Default)]
pub struct GateEvaluator;

impl GateEvaluator {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(&self, result: &GateResult, policy: &GatePolicy) -> GateDecision {
        match result.status {
            GateStatus::Pass => GateDecision::Proceed,
            GateStatus::Fail => Self::evaluate_failure(result, policy),
            GateStatus::Error => {
                let detail = result.message.as_deref().unwrap_or("gate tool error");
                if policy.fail_on_error {
                    GateDecision::Block {
                        reason: format!("quality gate errored: {}", detail),
                    }
                } else {
                    GateDecision::Escalate {
                        reason: format!("quality gate errored, continuing: {}", detail),
                    }
                }
            }
        }
    }

    /// Interpret a raw adapter report and evaluate it. A missing report is
    /// treated as a tool error.
    pub fn evaluate_report(&self, report: Option<&Value>, policy: &GatePolicy) -> (GateResult, GateDecision) {
        let result = match report {
            Some(report) => GateResult::from_report(report),
            None => GateResult::error("gate step produced no report"),
        };
        let decision = self.evaluate(&result, policy);
        (result, decision)
    }

    fn evaluate_failure(result: &GateResult, policy: &GatePolicy) -> GateDecision {
        let blocking: Vec<&str> = result
            .violated_metrics()
            .filter(|m| policy.is_blocking(m))
            .collect();
        if !blocking.is_empty() {
            return GateDecision::Block {
                reason: format!("blocking metrics violated: {}", blocking.join(", ")),
            };
        }

        let all_warn_only = !result.violations.is_empty()
            && result.violated_metrics().all(|m| policy.is_warn_only(m));
        if all_warn_only {
            let metrics: Vec<&str> = result.violated_metrics().collect();
            return GateDecision::Escalate {
                reason: format!("warn-only metrics violated: {}", metrics.join(", ")),
            };
        }

        let reason = match (&result.message, result.violations.is_empty()) {
            (Some(message), _) => format!("quality gate failed: {}", message),
            (None, true) => "quality gate failed".to_string(),
            (None, false) => format!(
                "quality gate failed: {}",
                result.violated_metrics().collect::<Vec<_>>().join(", ")
            ),
        };
        GateDecision::Block { reason }
    }
}
