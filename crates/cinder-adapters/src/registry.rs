//! Registry of adapters available to a run.

use crate::config::AdaptersConfig;
use crate::external::ExternalToolAdapter;
use cinder_core::pipeline::AdapterKind;
use cinder_core::ports::Adapter;
use cinder_core::{Error, Result};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Adapters by name. Safe to share between workers.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: DashMap<String, Arc<dyn Adapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry of external tools from configuration.
    ///
    /// Names outside the recognised adapter set are rejected so that a typo
    /// in the config fails at startup rather than at dispatch.
    pub fn from_config(config: &AdaptersConfig) -> Result<Self> {
        let registry = Self::new();
        for (name, tool) in config {
            name.parse::<AdapterKind>().map_err(|_| {
                Error::InvalidPipeline(format!(
                    "unknown adapter '{}' in configuration (expected one of: {})",
                    name,
                    AdapterKind::ALL.map(|k| k.as_str()).join(", ")
                ))
            })?;
            if tool.program.trim().is_empty() {
                return Err(Error::InvalidPipeline(format!(
                    "adapter '{}' has no program",
                    name
                )));
            }
            registry.register(Arc::new(ExternalToolAdapter::new(name.clone(), tool.clone())));
        }
        Ok(registry)
    }

    /// Register an adapter under its own name, replacing any previous one.
    pub fn register(&self, adapter: Arc<dyn Adapter>) {
        let name = adapter.name().to_string();
        if self.adapters.insert(name.clone(), adapter).is_some() {
            warn!(adapter = %name, "replaced registered adapter");
        } else {
            info!(adapter = %name, "registered adapter");
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Adapter>> {
        self.adapters
            .get(name)
            .map(|a| Arc::clone(a.value()))
            .ok_or_else(|| Error::AdapterNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
