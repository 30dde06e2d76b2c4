//! Pipeline scheduling and orchestration for Cinder CI.

pub mod dag;
pub mod engine;
pub mod gate;

pub use dag::JobGraph;
pub use cinder_runner::CancelToken;
pub use engine::{EngineConfig, PipelineEngine, RunHandle};
pub use gate::GateEvaluator;
