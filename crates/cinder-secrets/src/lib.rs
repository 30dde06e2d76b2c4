//! Secret resolution for Cinder CI.
//!
//! Secrets are resolved by name at step dispatch time and never written to
//! pipeline definitions or logs.

pub mod native;
pub mod providers;
pub mod store;

pub use cinder_core::ports::SecretProvider;
pub use cinder_core::secrets::{SecretBundle, SecretMasker, SecretValue};
pub use native::NativeProvider;
pub use providers::{DEFAULT_ENV_PREFIX, EnvProvider, FileProvider};
pub use store::{SecretStore, SecretStoreConfig};
