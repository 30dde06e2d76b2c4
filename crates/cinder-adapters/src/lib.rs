//! Adapters wrapping external tools for Cinder CI.
//!
//! The engine only sees the [`Adapter`] contract; concrete scanners,
//! build tools and deployment CLIs are configured as external commands.

pub mod config;
pub mod external;
pub mod registry;

pub use cinder_core::ports::{Adapter, AdapterCall, RawResult};
pub use config::{AdaptersConfig, ExternalToolConfig, ReportConfig};
pub use external::{ExternalToolAdapter, render_template};
pub use registry::AdapterRegistry;
