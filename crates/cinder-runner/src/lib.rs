//! Step execution engine for Cinder CI.

pub mod adapter;
pub mod cancel;
pub mod environments;
pub mod local;
pub mod logs;
pub mod runner;
pub mod shell;

pub use adapter::{AdapterOutcome, AdapterRunner};
pub use cancel::CancelToken;
pub use environments::Workspace;
pub use local::LocalStepRunner;
pub use logs::{LogStore, LogWriter, tail};
pub use runner::{
    DEFAULT_INHERIT_ENV, OutputLine, OutputStream, PreparedStep, RunnerConfig, StepKind,
    StepRequest, StepResult, StepRunner, prepare_step,
};
pub use shell::ShellRunner;
