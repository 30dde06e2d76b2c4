//! CLI configuration management.

use cinder_adapters::AdaptersConfig;
use cinder_runner::{DEFAULT_INHERIT_ENV, RunnerConfig};
use cinder_scheduler::EngineConfig;
use cinder_secrets::DEFAULT_ENV_PREFIX;
use cinder_trace::{LogFormat, TracingConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Maximum jobs in flight. Defaults to the number of CPUs.
    pub workers: Option<usize>,
    pub cancel_grace_secs: u64,
    pub default_step_timeout_secs: u64,
    pub workspace_dir: Option<PathBuf>,
    pub artifact_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub keep_workspaces: bool,
    pub output_format: OutputFormat,
    pub log_format: LogFormat,
    pub log_level: String,
    /// Environment variables passed through to shell steps.
    pub inherit_env: Vec<String>,
    pub secrets_prefix: String,
    pub adapters: AdaptersConfig,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            workers: None,
            cancel_grace_secs: 10,
            default_step_timeout_secs: 1800,
            workspace_dir: None,
            artifact_dir: None,
            log_dir: None,
            keep_workspaces: false,
            output_format: OutputFormat::Table,
            log_format: LogFormat::Pretty,
            log_level: "warn".to_string(),
            inherit_env: DEFAULT_INHERIT_ENV.iter().map(|s| s.to_string()).collect(),
            secrets_prefix: DEFAULT_ENV_PREFIX.to_string(),
            adapters: AdaptersConfig::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Yaml,
}

impl CliConfig {
    /// Load configuration from `path`, or from the default location.
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, Box<dyn std::error::Error>> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::config_path()?,
        };
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let config = serde_yaml::from_str(&content)
                .map_err(|e| format!("invalid config file {}: {}", path.display(), e))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to `path`.
    pub fn save(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the configuration file path.
    pub fn config_path() -> Result<PathBuf, Box<dyn std::error::Error>> {
        let dirs = project_dirs().ok_or("Could not determine config directory")?;
        Ok(dirs.config_dir().join("config.yaml"))
    }

    /// Set a configuration value.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key {
            "workers" => {
                let workers = parse_number::<usize>(key, value)?;
                if workers == 0 {
                    return Err("workers must be at least 1".to_string());
                }
                self.workers = Some(workers);
            }
            "cancel_grace_secs" => self.cancel_grace_secs = parse_number(key, value)?,
            "default_step_timeout_secs" => {
                self.default_step_timeout_secs = parse_number(key, value)?
            }
            "workspace_dir" => self.workspace_dir = Some(PathBuf::from(value)),
            "artifact_dir" => self.artifact_dir = Some(PathBuf::from(value)),
            "log_dir" => self.log_dir = Some(PathBuf::from(value)),
            "keep_workspaces" => {
                self.keep_workspaces = value
                    .parse()
                    .map_err(|_| format!("Invalid boolean for {}: {}", key, value))?
            }
            "output_format" => {
                self.output_format = match value {
                    "table" => OutputFormat::Table,
                    "json" => OutputFormat::Json,
                    "yaml" => OutputFormat::Yaml,
                    _ => return Err(format!("Invalid output format: {}", value)),
                };
            }
            "log_format" => {
                self.log_format = value
                    .parse()
                    .map_err(|_| format!("Invalid log format: {}", value))?
            }
            "log_level" => self.log_level = value.to_string(),
            "inherit_env" => {
                self.inherit_env = value
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(String::from)
                    .collect()
            }
            "secrets_prefix" => self.secrets_prefix = value.to_string(),
            "adapters" => {
                return Err("adapters are configured by editing the config file".to_string());
            }
            _ => return Err(format!("Unknown config key: {}", key)),
        }
        Ok(())
    }

    pub fn tracing_config(&self) -> TracingConfig {
        TracingConfig::default()
            .with_level(self.log_level.clone())
            .with_format(self.log_format)
    }

    pub fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig {
            cancel_grace: Duration::from_secs(self.cancel_grace_secs),
            default_step_timeout: Duration::from_secs(self.default_step_timeout_secs),
            workspace_dir: self.data_path(&self.workspace_dir, "workspaces"),
            keep_workspaces: self.keep_workspaces,
            ..EngineConfig::default()
        };
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        config
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            inherit_env: self.inherit_env.clone(),
            log_dir: self.data_path(&self.log_dir, "logs"),
        }
    }

    pub fn artifact_dir(&self) -> PathBuf {
        self.data_path(&self.artifact_dir, "artifacts")
    }

    fn data_path(&self, configured: &Option<PathBuf>, name: &str) -> PathBuf {
        match configured {
            Some(path) => path.clone(),
            None => project_dirs()
                .map(|dirs| dirs.data_dir().join(name))
                .unwrap_or_else(|| PathBuf::from(".cinder").join(name)),
        }
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("dev", "cinder", "cinder")
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("Invalid number for {}: {}", key, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_adapters::ExternalToolConfig;

    #[test]
    fn test_set_known_keys() {
        let mut config = CliConfig::default();
        config.set("workers", "3").unwrap();
        config.set("output_format", "json").unwrap();
        config.set("log_format", "json").unwrap();
        config.set("keep_workspaces", "true").unwrap();
        config.set("inherit_env", "PATH, HOME,").unwrap();
        config.set("artifact_dir", "/tmp/cinder-artifacts").unwrap();

        assert_eq!(config.workers, Some(3));
        assert_eq!(config.output_format, OutputFormat::Json);
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(config.keep_workspaces);
        assert_eq!(config.inherit_env, vec!["PATH", "HOME"]);
        assert_eq!(config.artifact_dir(), PathBuf::from("/tmp/cinder-artifacts"));
    }

    #[test]
    fn test_set_rejects_bad_values() {
        let mut config = CliConfig::default();
        assert!(config.set("workers", "0").is_err());
        assert!(config.set("workers", "many").is_err());
        assert!(config.set("output_format", "xml").is_err());
        assert!(config.set("keep_workspaces", "maybe").is_err());
        assert!(config.set("adapters", "{}").is_err());
        assert!(config.set("api_url", "http://localhost").is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");

        let mut config = CliConfig::default();
        config.set("cancel_grace_secs", "3").unwrap();
        config
            .adapters
            .insert("build".to_string(), ExternalToolConfig::new("make").arg("all"));
        config.save(&path).unwrap();

        let loaded = CliConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.cancel_grace_secs, 3);
        assert_eq!(loaded.adapters["build"].program, "make");
        assert_eq!(loaded.engine_config().cancel_grace, Duration::from_secs(3));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "workers: 2\nadapters:\n  deploy:\n    program: aws\n    args: [s3, sync, \"{source}\", \"{target}\"]\n",
        )
        .unwrap();

        let config = CliConfig::load(Some(&path)).unwrap();
        assert_eq!(config.engine_config().workers, 2);
        assert_eq!(config.default_step_timeout_secs, 1800);
        assert_eq!(config.secrets_prefix, DEFAULT_ENV_PREFIX);
        assert_eq!(config.adapters["deploy"].args.len(), 4);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = CliConfig::load(Some(&dir.path().join("absent.yaml"))).unwrap();
        assert_eq!(config.output_format, OutputFormat::Table);
        assert_eq!(config.runner_config().inherit_env.len(), DEFAULT_INHERIT_ENV.len());
    }
}
