//! Adapter that shells out to a configured command-line tool.

use crate::config::ExternalToolConfig;
use async_trait::async_trait;
use cinder_core::ports::{Adapter, AdapterCall, RawResult};
use cinder_core::{Error, Result};
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;
use tokio::process::Command;
use tracing::{debug, info, warn};

static PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("param pattern is valid"));

/// Replace `{param}` occurrences with values from `params`.
pub fn render_template(template: &str, params: &BTreeMap<String, String>) -> Result<String> {
    let mut output = String::with_capacity(template.len());
    let mut last = 0;
    for caps in PARAM.captures_iter(template) {
        let (Some(whole), Some(key)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = params.get(key.as_str()).ok_or_else(|| {
            Error::AdapterFailed(format!("missing parameter '{}'", key.as_str()))
        })?;
        output.push_str(&template[last..whole.start()]);
        output.push_str(value);
        last = whole.end();
    }
    output.push_str(&template[last..]);
    Ok(output)
}

pub struct ExternalToolAdapter {
    name: String,
    config: ExternalToolConfig,
}

impl ExternalToolAdapter {
    pub fn new(name: impl Into<String>, config: ExternalToolConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    pub fn config(&self) -> &ExternalToolConfig {
        &self.config
    }

    fn build_command(&self, call: &AdapterCall) -> Result<Command> {
        let args = self
            .config
            .args
            .iter()
            .map(|a| render_template(a, &call.params))
            .collect::<Result<Vec<_>>>()?;

        let workdir = match &self.config.working_dir {
            Some(dir) => call.workspace.join(dir),
            None => call.workspace.clone(),
        };

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&args)
            .current_dir(&workdir)
            .env_clear()
            .envs(&call.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, template) in &self.config.env {
            cmd.env(key, render_template(template, &call.params)?);
        }
        for (var, secret) in &self.config.secret_env {
            let value = call
                .secrets
                .get(secret)
                .ok_or_else(|| Error::SecretNotFound(secret.clone()))?;
            cmd.env(var, value.expose());
        }

        Ok(cmd)
    }

    async fn read_report(&self, workdir: &Path, stdout: &str) -> Option<Value> {
        let report = self.config.report.as_ref()?;
        if report.stdout {
            return parse_json(stdout);
        }
        let file = report.file.as_ref()?;
        let path = workdir.join(file);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let parsed = parse_json(&content);
                if parsed.is_none() {
                    warn!(adapter = %self.name, path = %path.display(), "report is not valid JSON");
                }
                parsed
            }
            Err(e) => {
                warn!(adapter = %self.name, path = %path.display(), error = %e, "report not readable");
                None
            }
        }
    }
}

/// Parse JSON from tool output, falling back to the last non-empty line for
/// tools that print progress before the report.
fn parse_json(text: &str) -> Option<Value> {
    serde_json::from_str(text.trim()).ok().or_else(|| {
        text.lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .and_then(|l| serde_json::from_str(l.trim()).ok())
    })
}

#[async_trait]
impl Adapter for ExternalToolAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, call: &AdapterCall) -> Result<RawResult> {
        let mut cmd = self.build_command(call)?;
        info!(adapter = %self.name, program = %self.config.program, "invoking external tool");

        let output = cmd.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::AdapterNotFound(format!("{} ({} not found)", self.name, self.config.program))
            } else {
                Error::AdapterFailed(format!("{}: {}", self.name, e))
            }
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let workdir = match &self.config.working_dir {
            Some(dir) => call.workspace.join(dir),
            None => call.workspace.clone(),
        };
        let report = self.read_report(&workdir, &stdout).await;

        debug!(
            adapter = %self.name,
            exit_code = ?output.status.code(),
            has_report = report.is_some(),
            "external tool finished"
        );

        Ok(RawResult {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: stdout.lines().map(str::to_string).collect(),
            stderr: stderr.lines().map(str::to_string).collect(),
            report,
        })
    }
}
