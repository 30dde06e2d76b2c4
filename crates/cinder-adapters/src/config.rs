//! Adapter configuration.
//!
//! ```yaml
//! adapters:
//!   scan:
//!     program: sonar-scanner
//!     args: ["-Dsonar.projectKey={project}", "-Dsonar.token={token}"]
//!     report:
//!       file: .scannerwork/quality-gate.json
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Adapter name to tool configuration.
pub type AdaptersConfig = BTreeMap<String, ExternalToolConfig>;

/// How to run an external tool for an adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalToolConfig {
    /// Executable, looked up on the step's `PATH`.
    pub program: String,
    /// Arguments; `{param}` is replaced by the step's `with.param`.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment, templated like `args`.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Environment variable name to secret name.
    #[serde(default)]
    pub secret_env: BTreeMap<String, String>,
    #[serde(default)]
    pub report: Option<ReportConfig>,
    /// Working directory relative to the job workspace.
    #[serde(default)]
    pub working_dir: Option<String>,
}

impl ExternalToolConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn secret_env(mut self, var: impl Into<String>, secret: impl Into<String>) -> Self {
        self.secret_env.insert(var.into(), secret.into());
        self
    }

    pub fn report(mut self, report: ReportConfig) -> Self {
        self.report = Some(report);
        self
    }
}

/// Where a tool leaves its structured report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Parse the tool's stdout as JSON.
    #[serde(default)]
    pub stdout: bool,
    /// JSON file relative to the working directory.
    #[serde(default)]
    pub file: Option<String>,
}

impl ReportConfig {
    pub fn stdout() -> Self {
        Self {
            stdout: true,
            file: None,
        }
    }

    pub fn file(path: impl Into<String>) -> Self {
        Self {
            stdout: false,
            file: Some(path.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_adapter_config() {
        let yaml = r#"
scan:
  program: sonar-scanner
  args: ["-Dsonar.projectKey={project}"]
  report:
    file: .scannerwork/quality-gate.json
deploy:
  program: aws
  args: [s3, sync, "{source}", "{target}"]
  secret_env:
    AWS_ACCESS_KEY_ID: AWS_ACCESS_KEY_ID
"#;
        let config: AdaptersConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config["scan"].program, "sonar-scanner");
        assert_eq!(
            config["scan"].report,
            Some(ReportConfig::file(".scannerwork/quality-gate.json"))
        );
        assert_eq!(config["deploy"].args.len(), 4);
        assert_eq!(config["deploy"].secret_env["AWS_ACCESS_KEY_ID"], "AWS_ACCESS_KEY_ID");
    }
}
