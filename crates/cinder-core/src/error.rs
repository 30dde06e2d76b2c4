//! Error types for Cinder CI.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Pipeline definition errors
    #[error("Invalid pipeline definition: {0}")]
    InvalidPipeline(String),

    #[error("Cycle detected in job dependencies: {}", jobs.join(" -> "))]
    Cycle { jobs: Vec<String> },

    #[error("Job '{job}' depends on unknown job '{dependency}'")]
    UnknownDependency { job: String, dependency: String },

    // Step errors
    #[error("Step '{step}' timed out after {seconds}s")]
    StepTimeout { step: String, seconds: u64 },

    #[error("Adapter not found: {0}")]
    AdapterNotFound(String),

    #[error("Adapter invocation failed: {0}")]
    AdapterFailed(String),

    // Gate errors
    #[error("Quality gate blocked job '{job}': {reason}")]
    GateBlocked { job: String, reason: String },

    // Artifact errors
    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Artifact store unavailable: {0}")]
    ArtifactStoreUnavailable(String),

    // Secret errors
    #[error("Secret not found: {0}")]
    SecretNotFound(String),

    #[error("Secret provider not configured: {0}")]
    SecretProviderNotConfigured(String),

    // Run errors
    #[error("Run cancelled")]
    RunCancelled,

    // Infrastructure errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether a step that failed with this error may be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StepTimeout { .. }
                | Error::AdapterNotFound(_)
                | Error::AdapterFailed(_)
                | Error::Io(_)
        )
    }

    /// Whether this error aborts the whole run instead of failing one job.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvalidPipeline(_)
                | Error::Cycle { .. }
                | Error::UnknownDependency { .. }
                | Error::ArtifactNotFound(_)
                | Error::ArtifactStoreUnavailable(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::InvalidPipeline(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::StepTimeout { step: "unit".into(), seconds: 5 }.is_retryable());
        assert!(Error::AdapterNotFound("scan".into()).is_retryable());
        assert!(!Error::SecretNotFound("TOKEN".into()).is_retryable());
        assert!(!Error::GateBlocked { job: "scan".into(), reason: "bugs".into() }.is_retryable());

        assert!(Error::ArtifactNotFound("abc".into()).is_fatal());
        assert!(Error::Cycle { jobs: vec!["a".into(), "b".into()] }.is_fatal());
        assert!(!Error::SecretNotFound("TOKEN".into()).is_fatal());
    }

    #[test]
    fn test_cycle_message() {
        let err = Error::Cycle { jobs: vec!["a".into(), "b".into()] };
        assert_eq!(err.to_string(), "Cycle detected in job dependencies: a -> b");
    }
}
