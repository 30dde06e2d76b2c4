//! Logging setup for Cinder CI.
//!
//! Provides subscriber initialisation with pretty or JSON output and
//! CI-specific span helpers used by the engine.

pub mod spans;
pub mod tracer;

pub use spans::{CiAttributes, artifact_span, job_span, run_span, secret_span, step_span};
pub use tracer::{LogFormat, TracerError, TracingConfig, init_tracing};
