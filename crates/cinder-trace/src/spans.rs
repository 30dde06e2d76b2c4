//! Span creation for pipeline execution.

use tracing::{Level, Span, span};

/// Attributes attached to CI spans.
#[derive(Debug, Default, Clone)]
pub struct CiAttributes {
    pub pipeline_name: Option<String>,
    pub run_id: Option<String>,
    pub job_name: Option<String>,
    pub step_name: Option<String>,
    pub adapter: Option<String>,
    pub attempt: Option<u32>,
}

impl CiAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pipeline(mut self, name: impl Into<String>) -> Self {
        self.pipeline_name = Some(name.into());
        self
    }

    pub fn run(mut self, id: impl ToString) -> Self {
        self.run_id = Some(id.to_string());
        self
    }

    pub fn job(mut self, name: impl Into<String>) -> Self {
        self.job_name = Some(name.into());
        self
    }

    pub fn step(mut self, name: impl Into<String>) -> Self {
        self.step_name = Some(name.into());
        self
    }

    pub fn adapter(mut self, adapter: impl Into<String>) -> Self {
        self.adapter = Some(adapter.into());
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }
}

/// Create a span for a pipeline run.
pub fn run_span(attrs: &CiAttributes) -> Span {
    span!(
        Level::INFO,
        "run.execute",
        ci.pipeline.name = attrs.pipeline_name.as_deref().unwrap_or(""),
        ci.run.id = attrs.run_id.as_deref().unwrap_or(""),
    )
}

/// Create a span for a job.
pub fn job_span(attrs: &CiAttributes) -> Span {
    span!(
        Level::INFO,
        "job.execute",
        ci.run.id = attrs.run_id.as_deref().unwrap_or(""),
        ci.job.name = attrs.job_name.as_deref().unwrap_or(""),
    )
}

/// Create a span for one step attempt.
pub fn step_span(attrs: &CiAttributes) -> Span {
    span!(
        Level::INFO,
        "step.execute",
        ci.job.name = attrs.job_name.as_deref().unwrap_or(""),
        ci.step.name = attrs.step_name.as_deref().unwrap_or(""),
        ci.step.adapter = attrs.adapter.as_deref().unwrap_or(""),
        ci.step.attempt = attrs.attempt.unwrap_or(1),
    )
}

/// Create a span for artifact store operations.
pub fn artifact_span(operation: &str, name: &str) -> Span {
    span!(
        Level::DEBUG,
        "artifact.operation",
        operation = operation,
        artifact.name = name,
    )
}

/// Create a span for secret access. Only the name is recorded.
pub fn secret_span(secret_name: &str) -> Span {
    span!(Level::DEBUG, "secret.access", secret.name = secret_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ci_attributes_builder() {
        let attrs = CiAttributes::new()
            .pipeline("web-app")
            .run("run_0192")
            .job("deploy")
            .step("sync")
            .adapter("deploy")
            .attempt(2);

        assert_eq!(attrs.pipeline_name.as_deref(), Some("web-app"));
        assert_eq!(attrs.job_name.as_deref(), Some("deploy"));
        assert_eq!(attrs.attempt, Some(2));

        // Spans are inert without a subscriber.
        let _span = step_span(&attrs);
    }
}
