//! Command handlers.

use crate::config::{CliConfig, OutputFormat};
use crate::output::{Progress, print_report};
use cinder_adapters::AdapterRegistry;
use cinder_artifacts::FilesystemArtifactStore;
use cinder_core::pipeline::{PipelineDefinition, StepAction};
use cinder_core::ports::ArtifactStore;
use cinder_runner::LocalStepRunner;
use cinder_scheduler::{JobGraph, PipelineEngine};
use cinder_secrets::{EnvProvider, FileProvider, SecretStore, SecretStoreConfig};
use console::style;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

type HandlerResult<T = ExitCode> = Result<T, Box<dyn std::error::Error>>;

/// Pipeline files looked up when no path is given, in order.
pub const PIPELINE_CANDIDATES: &[&str] = &[
    "cinder.yaml",
    "cinder.yml",
    ".cinder/pipeline.yaml",
    ".cinder/pipeline.yml",
];

const TEMPLATE: &str = r#"version: "1"
name: my-pipeline
variables:
  APP_ENV: ci

jobs:
  - name: build
    steps:
      - name: compile
        run: |
          echo "Building in $APP_ENV..."
          mkdir -p dist && echo "hello" > dist/app.txt
    outputs:
      - name: dist
        path: dist/app.txt

  - name: test
    depends_on: [build]
    artifacts:
      - from: build
        name: dist
    steps:
      - name: unit
        run: test -f dist/app.txt
    retry:
      max_retries: 1
"#;

/// Find the pipeline file: `explicit` if given, else the first candidate
/// under `base` that exists.
pub fn discover(base: &Path, explicit: Option<&Path>) -> HandlerResult<PathBuf> {
    if let Some(path) = explicit {
        if !path.is_file() {
            return Err(format!("pipeline file {} not found", path.display()).into());
        }
        return Ok(path.to_path_buf());
    }
    PIPELINE_CANDIDATES
        .iter()
        .map(|candidate| base.join(candidate))
        .find(|path| path.is_file())
        .ok_or_else(|| {
            format!(
                "no pipeline file found (looked for {})",
                PIPELINE_CANDIDATES.join(", ")
            )
            .into()
        })
}

fn load_graph(explicit: Option<&Path>) -> HandlerResult<(PathBuf, JobGraph)> {
    let path = discover(Path::new("."), explicit)?;
    let definition = PipelineDefinition::from_file(&path)?;
    let graph = JobGraph::build(&definition)?;
    debug!(path = %path.display(), jobs = graph.len(), "loaded pipeline");
    Ok((path, graph))
}

/// Write a starter pipeline.
pub async fn init(force: bool) -> HandlerResult {
    let path = Path::new(PIPELINE_CANDIDATES[0]);

    if path.exists() && !force {
        let overwrite = console::user_attended()
            && dialoguer::Confirm::new()
                .with_prompt("cinder.yaml already exists. Overwrite?")
                .default(false)
                .interact()?;
        if !overwrite {
            println!("{} cinder.yaml already exists", style("!").yellow());
            return Ok(ExitCode::SUCCESS);
        }
    }

    std::fs::write(path, TEMPLATE)?;
    println!("{} Created cinder.yaml", style("✓").green());
    Ok(ExitCode::SUCCESS)
}

/// Validate a pipeline definition.
pub async fn validate(path: Option<&Path>) -> HandlerResult {
    let (path, graph) = load_graph(path)?;

    println!(
        "{} Pipeline \"{}\" is valid ({})",
        style("✓").green(),
        graph.name(),
        style(path.display()).dim()
    );
    println!("  Jobs: {}", graph.len());

    for id in graph.job_ids() {
        let Some(job) = graph.job(id.as_str()) else {
            continue;
        };
        let deps = graph.dependencies(id.as_str());
        if deps.is_empty() {
            println!("    - {}", style(&job.name).bold());
        } else {
            let deps: Vec<&str> = deps.iter().map(|d| d.as_str()).collect();
            println!(
                "    - {} {}",
                style(&job.name).bold(),
                style(format!("(needs {})", deps.join(", "))).dim()
            );
        }
        for step in &job.steps {
            let action = match step.action()? {
                StepAction::Command { shell, .. } => format!("run ({})", shell),
                StepAction::Adapter { kind, .. } => format!("uses {}", kind),
            };
            let gate = if step.is_gate() { " [gate]" } else { "" };
            println!("        {} {}{}", step.name, style(action).dim(), gate);
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Print the execution waves.
pub async fn plan(path: Option<&Path>) -> HandlerResult {
    let (_, graph) = load_graph(path)?;
    let batches = graph.topological_batches();

    println!(
        "{} {} jobs in {} waves",
        style(graph.name()).bold(),
        graph.len(),
        batches.len()
    );
    for (index, batch) in batches.iter().enumerate() {
        let names: Vec<&str> = batch.iter().map(|id| id.as_str()).collect();
        println!("  Wave {}: {}", index + 1, names.join(", "));
    }

    Ok(ExitCode::SUCCESS)
}

/// Options for `cinder run` beyond the configuration file.
pub struct RunOptions {
    pub path: Option<PathBuf>,
    pub workers: Option<usize>,
    pub secrets_file: Option<PathBuf>,
    pub json: bool,
    pub keep_workspaces: bool,
    pub vars: Vec<(String, String)>,
}

/// Execute a pipeline locally.
pub async fn run(config: &CliConfig, options: RunOptions) -> HandlerResult {
    let (_, graph) = load_graph(options.path.as_deref())?;

    let mut secrets = SecretStore::new(SecretStoreConfig::default());
    if let Some(file) = &options.secrets_file {
        secrets.add_provider(Arc::new(FileProvider::load(file)?));
    }
    secrets.add_provider(Arc::new(EnvProvider::new(config.secrets_prefix.clone())));

    let registry = AdapterRegistry::from_config(&config.adapters)?;
    let runner = LocalStepRunner::new(config.runner_config(), Arc::new(registry));
    let artifacts = Arc::new(FilesystemArtifactStore::open(config.artifact_dir())?);

    let mut engine_config = config.engine_config();
    if let Some(workers) = options.workers {
        if workers == 0 {
            return Err("--workers must be at least 1".into());
        }
        engine_config.workers = workers;
    }
    engine_config.keep_workspaces |= options.keep_workspaces;
    engine_config.variables.extend(options.vars);

    let format = if options.json {
        OutputFormat::Json
    } else {
        config.output_format
    };
    let progress = match format {
        OutputFormat::Table => Progress::new(graph.len()),
        _ => Progress::hidden(),
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let engine = PipelineEngine::new(
        engine_config,
        Arc::new(runner),
        artifacts.clone(),
        Arc::new(secrets),
    )
    .with_events(tx);

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            progress.handle(&event);
        }
        progress.finish();
    });

    let handle = engine.start(graph);
    drop(engine);

    let cancel = handle.cancel_token();
    let (abort_tx, abort_rx) = oneshot::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!(
                "{} Cancelling run; press Ctrl-C again to abort",
                style("!").yellow()
            );
            cancel.cancel();
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = abort_tx.send(());
            }
        }
    });

    // Returning drops the run task with the runtime; running step process
    // groups are killed as their tasks are dropped.
    let report = tokio::select! {
        report = handle.wait() => report?,
        Ok(()) = abort_rx => {
            eprintln!("{} Run aborted", style("✗").red().bold());
            return Ok(ExitCode::from(130));
        }
    };
    if let Err(e) = printer.await {
        warn!(error = %e, "progress printer stopped");
    }

    match format {
        OutputFormat::Table => print_report(&report),
        OutputFormat::Json => println!("{}", report.to_json()?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(&report)?),
    }

    match artifacts.release(report.run_id).await {
        Ok(removed) => debug!(run_id = %report.run_id, removed, "released run artifacts"),
        Err(e) => warn!(run_id = %report.run_id, error = %e, "failed to release run artifacts"),
    }

    Ok(ExitCode::from(report.exit_code() as u8))
}

/// Print the JSON schema of the pipeline format.
pub fn schema() -> HandlerResult {
    let schema = schemars::schema_for!(PipelineDefinition);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(ExitCode::SUCCESS)
}

/// Show configuration.
pub fn show_config(config: &CliConfig, path: &Path) -> HandlerResult {
    println!("Current configuration:");
    print!("{}", serde_yaml::to_string(config)?);
    println!("\nConfig file: {}", path.display());
    Ok(ExitCode::SUCCESS)
}

/// Set configuration.
pub fn set_config(path: &Path, key: &str, value: &str) -> HandlerResult {
    let mut config = CliConfig::load(Some(path))?;
    config.set(key, value)?;
    config.save(path)?;

    println!("{} Set {} = {}", style("✓").green(), key, value);
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discover_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("custom.yaml");
        std::fs::write(&file, TEMPLATE).unwrap();

        assert_eq!(discover(dir.path(), Some(&file)).unwrap(), file);
        assert!(discover(dir.path(), Some(&dir.path().join("missing.yaml"))).is_err());
    }

    #[test]
    fn test_discover_candidate_order() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover(dir.path(), None).is_err());

        std::fs::create_dir_all(dir.path().join(".cinder")).unwrap();
        std::fs::write(dir.path().join(".cinder/pipeline.yml"), TEMPLATE).unwrap();
        assert_eq!(
            discover(dir.path(), None).unwrap(),
            dir.path().join(".cinder/pipeline.yml")
        );

        std::fs::write(dir.path().join("cinder.yml"), TEMPLATE).unwrap();
        assert_eq!(
            discover(dir.path(), None).unwrap(),
            dir.path().join("cinder.yml")
        );

        std::fs::write(dir.path().join("cinder.yaml"), TEMPLATE).unwrap();
        assert_eq!(
            discover(dir.path(), None).unwrap(),
            dir.path().join("cinder.yaml")
        );
    }

    #[test]
    fn test_template_is_a_valid_pipeline() {
        let definition = PipelineDefinition::from_yaml(TEMPLATE).unwrap();
        let graph = JobGraph::build(&definition).unwrap();
        assert_eq!(graph.topological_batches().len(), 2);
    }

    #[test]
    fn test_set_config_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        set_config(&path, "workers", "2").unwrap();
        assert_eq!(CliConfig::load(Some(&path)).unwrap().workers, Some(2));
        assert!(set_config(&path, "nope", "1").is_err());
    }
}
