//! Subscriber initialization and configuration.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Error)]
pub enum TracerError {
    #[error("Invalid log filter '{0}'")]
    InvalidFilter(String),
    #[error("A global subscriber is already installed")]
    AlreadyInitialized,
}

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = TracerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(TracerError::InvalidFilter(other.to_string())),
        }
    }
}

/// Tracing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingConfig {
    /// Fallback filter directive when `RUST_LOG` is unset.
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Include the event target (module path).
    #[serde(default = "default_true")]
    pub with_target: bool,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::Pretty,
            with_target: true,
        }
    }
}

impl TracingConfig {
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// `RUST_LOG` if set, else the configured level.
    pub fn env_filter(&self) -> Result<EnvFilter, TracerError> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.level)
                .map_err(|_| TracerError::InvalidFilter(self.level.clone())),
        }
    }
}

/// Install the global subscriber. Logs go to stderr so that machine-readable
/// output on stdout stays clean.
pub fn init_tracing(config: &TracingConfig) -> Result<(), TracerError> {
    let env_filter = config.env_filter()?;
    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match config.format {
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(config.with_target),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(config.with_target)
                    .with_current_span(true),
            )
            .try_init(),
    };
    result.map_err(|_| TracerError::AlreadyInitialized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TracingConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, LogFormat::Pretty);
    }

    #[test]
    fn test_config_from_yaml() {
        let config: TracingConfig = serde_yaml::from_str("format: json").unwrap();
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.level, "info");
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_second_init_fails() {
        let config = TracingConfig::default().with_level("warn");
        let first = init_tracing(&config);
        let second = init_tracing(&config);
        // Another test binary may have installed one already; either way the
        // second call must be rejected.
        let _ = first;
        assert!(matches!(second, Err(TracerError::AlreadyInitialized)));
    }
}
