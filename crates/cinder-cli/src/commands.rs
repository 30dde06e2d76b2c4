//! CLI command definitions.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Write a starter pipeline to cinder.yaml
    Init {
        /// Overwrite an existing file without asking
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a pipeline definition
    Validate {
        /// Path to pipeline file (discovered when omitted)
        path: Option<PathBuf>,
    },

    /// Show the execution waves of a pipeline
    Plan {
        /// Path to pipeline file (discovered when omitted)
        path: Option<PathBuf>,
    },

    /// Execute a pipeline locally
    Run {
        /// Path to pipeline file (discovered when omitted)
        path: Option<PathBuf>,

        /// Maximum number of jobs in flight
        #[arg(short, long)]
        workers: Option<usize>,

        /// Dotenv or JSON file with secrets
        #[arg(long)]
        secrets_file: Option<PathBuf>,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,

        /// Keep job workspaces after the run
        #[arg(long)]
        keep_workspaces: bool,

        /// Override a pipeline variable (KEY=VALUE)
        #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_key_val)]
        vars: Vec<(String, String)>,
    },

    /// Print the JSON schema of the pipeline format
    Schema,

    /// Manage CLI configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Set a configuration value
    Set {
        /// Configuration key
        key: String,
        /// Configuration value
        value: String,
    },

    /// Print the configuration file path
    Path,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("empty variable name in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("NODE_ENV=production").unwrap(),
            ("NODE_ENV".to_string(), "production".to_string())
        );
        assert_eq!(
            parse_key_val("URL=a=b").unwrap(),
            ("URL".to_string(), "a=b".to_string())
        );
        assert!(parse_key_val("novalue").is_err());
        assert!(parse_key_val("=x").is_err());
    }
}
