//! Adapter-based step execution.

use crate::logs::LogWriter;
use crate::runner::{OutputStream, RunnerConfig, StepRequest};
use cinder_adapters::AdapterRegistry;
use cinder_core::pipeline::AdapterKind;
use cinder_core::ports::AdapterCall;
use cinder_core::{Error, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// What an adapter invocation amounted to.
#[derive(Debug, Clone)]
pub struct AdapterOutcome {
    pub exit_code: i32,
    pub success: bool,
    pub report: Option<Value>,
}

pub struct AdapterRunner {
    registry: Arc<AdapterRegistry>,
    config: RunnerConfig,
}

impl AdapterRunner {
    pub fn new(registry: Arc<AdapterRegistry>, config: RunnerConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub async fn execute(
        &self,
        kind: AdapterKind,
        params: &BTreeMap<String, String>,
        request: &StepRequest,
        log: &mut LogWriter,
    ) -> Result<AdapterOutcome> {
        let adapter = self.registry.get(kind.as_str())?;
        info!(step = %request.step, adapter = %kind, "invoking adapter");

        let mut env = self.config.inherited_env();
        env.extend(request.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        let call = AdapterCall {
            name: kind.as_str().to_string(),
            params: params.clone(),
            secrets: request.secrets.clone(),
            env,
            workspace: request.workspace.clone(),
        };

        let invoked = tokio::select! {
            invoked = timeout(request.timeout, adapter.invoke(&call)) => invoked,
            _ = request.cancel.cancelled() => {
                info!(step = %request.step, adapter = %kind, "cancel requested, dropping adapter call");
                return Err(Error::RunCancelled);
            }
        };
        let raw = match invoked {
            Ok(result) => result?,
            Err(_) => {
                let seconds = request.timeout.as_secs();
                warn!(step = %request.step, adapter = %kind, seconds, "adapter call timed out");
                return Err(Error::StepTimeout {
                    step: request.step.to_string(),
                    seconds,
                });
            }
        };

        for line in &raw.stdout {
            log.write_line(OutputStream::Stdout, line).await?;
        }
        for line in &raw.stderr {
            log.write_line(OutputStream::Stderr, line).await?;
        }

        let exit_code = raw
            .exit_code
            .unwrap_or(if raw.success { 0 } else { -1 });
        debug!(step = %request.step, adapter = %kind, exit_code, "adapter call completed");
        Ok(AdapterOutcome {
            exit_code,
            success: raw.success,
            report: raw.report,
        })
    }
}
