//! Cinder CI CLI entrypoint.

use clap::Parser;
use console::style;
use std::path::PathBuf;
use std::process::ExitCode;

mod commands;
mod config;
mod handlers;
mod output;

use commands::{Commands, ConfigCommands};
use config::CliConfig;
use handlers::RunOptions;

#[derive(Parser)]
#[command(name = "cinder")]
#[command(author, version, about = "Cinder CI pipeline runner", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, overriding the configured level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {}", style("✗").red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let config_path = match cli.config {
        Some(path) => path,
        None => CliConfig::config_path()?,
    };
    let config = CliConfig::load(Some(&config_path))?;

    let mut tracing = config.tracing_config();
    if let Some(level) = cli.log_level {
        tracing = tracing.with_level(level);
    }
    cinder_trace::init_tracing(&tracing)?;

    match cli.command {
        Commands::Init { force } => handlers::init(force).await,
        Commands::Validate { path } => handlers::validate(path.as_deref()).await,
        Commands::Plan { path } => handlers::plan(path.as_deref()).await,
        Commands::Run {
            path,
            workers,
            secrets_file,
            json,
            keep_workspaces,
            vars,
        } => {
            let options = RunOptions {
                path,
                workers,
                secrets_file,
                json,
                keep_workspaces,
                vars,
            };
            handlers::run(&config, options).await
        }
        Commands::Schema => handlers::schema(),
        Commands::Config { command } => match command {
            ConfigCommands::Show => handlers::show_config(&config, &config_path),
            ConfigCommands::Set { key, value } => {
                handlers::set_config(&config_path, &key, &value)
            }
            ConfigCommands::Path => {
                println!("{}", config_path.display());
                Ok(ExitCode::SUCCESS)
            }
        },
    }
}
