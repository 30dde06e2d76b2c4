//! Pipelines executed with the local runner: real `sh` processes, the
//! filesystem artifact store and external tool adapters.

use cinder_adapters::{AdapterRegistry, AdaptersConfig, ExternalToolConfig, ReportConfig};
use cinder_artifacts::FilesystemArtifactStore;
use cinder_core::pipeline::PipelineDefinition;
use cinder_core::ports::ArtifactStore;
use cinder_core::run::{JobStatus, RunReport, RunStatus};
use cinder_runner::{LocalStepRunner, RunnerConfig};
use cinder_scheduler::{CancelToken, EngineConfig, JobGraph, PipelineEngine};
use cinder_secrets::{SecretStore, SecretStoreConfig};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Local {
    dir: TempDir,
    store: Arc<FilesystemArtifactStore>,
    secrets: Arc<SecretStore>,
    adapters: AdaptersConfig,
}

impl Local {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FilesystemArtifactStore::open(dir.path().join("artifacts")).unwrap());
        Self {
            dir,
            store,
            secrets: Arc::new(SecretStore::new(SecretStoreConfig::default())),
            adapters: AdaptersConfig::new(),
        }
    }

    async fn run(&self, yaml: &str) -> RunReport {
        let graph = JobGraph::build(&PipelineDefinition::from_yaml(yaml).unwrap()).unwrap();
        let registry = AdapterRegistry::from_config(&self.adapters).unwrap();
        let runner = LocalStepRunner::new(
            RunnerConfig {
                log_dir: self.dir.path().join("logs"),
                ..RunnerConfig::default()
            },
            Arc::new(registry),
        );
        let config = EngineConfig {
            workers: 2,
            cancel_grace: Duration::from_millis(200),
            default_step_timeout: Duration::from_secs(30),
            workspace_dir: self.dir.path().join("workspaces"),
            keep_workspaces: false,
            variables: BTreeMap::new(),
        };
        PipelineEngine::new(config, Arc::new(runner), self.store.clone(), self.secrets.clone())
            .execute(&graph, CancelToken::new())
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn test_artifact_passes_between_shell_jobs() {
    let local = Local::new();
    let report = local
        .run(
            r#"
name: web-app
variables:
  GREETING: hello
jobs:
  - name: build
    steps:
      - name: compile
        run: mkdir -p dist && echo "$GREETING world" > dist/app.txt
    outputs:
      - name: dist
        path: dist/app.txt
  - name: test
    depends_on: [build]
    artifacts:
      - from: build
        name: dist
        path: input/app.txt
    steps:
      - name: check
        run: grep -q "hello world" input/app.txt
"#,
        )
        .await;

    assert_eq!(report.status, RunStatus::Succeeded, "{:?}", report.root_cause);
    assert_eq!(report.exit_code(), 0);

    let artifact = report.artifacts().next().unwrap();
    assert_eq!(artifact.name, "dist");
    assert_eq!(artifact.size_bytes, "hello world\n".len() as u64);
    assert!(local.store.contains(&artifact.digest).await.unwrap());
}

#[tokio::test]
async fn test_release_after_run_removes_blobs() {
    let local = Local::new();
    let report = local
        .run(
            r#"
name: outputs
jobs:
  - name: build
    steps:
      - name: compile
        run: echo binary > app.bin
    outputs:
      - name: app
        path: app.bin
"#,
        )
        .await;
    assert!(report.is_success());
    assert_eq!(local.store.stats().await.unwrap().blobs, 1);

    assert_eq!(local.store.release(report.run_id).await.unwrap(), 1);
    let stats = local.store.stats().await.unwrap();
    assert_eq!(stats.blobs, 0);
    assert_eq!(stats.runs, 0);
}

#[tokio::test]
async fn test_failure_skips_downstream_and_sets_exit_code() {
    let local = Local::new();
    let report = local
        .run(
            r#"
name: failing
jobs:
  - name: test
    steps:
      - name: unit
        run: echo "2 failed" >&2; exit 3
  - name: lint
    steps:
      - name: fmt
        run: "true"
  - name: deploy
    depends_on: [test, lint]
    steps:
      - name: sync
        run: echo never
"#,
        )
        .await;

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.status_of("test"), Some(JobStatus::Failed));
    assert_eq!(report.status_of("lint"), Some(JobStatus::Succeeded));
    assert_eq!(report.status_of("deploy"), Some(JobStatus::Skipped));

    let test = report.job("test").unwrap();
    assert_eq!(test.exit_code(), Some(3));
    let log = std::fs::read_to_string(&test.steps[0].logs[0].path).unwrap();
    assert!(log.contains("2 failed"));
    assert_eq!(report.root_cause.as_ref().unwrap().job.as_str(), "test");
}

#[tokio::test]
async fn test_secret_is_exported_and_masked_in_logs() {
    let local = Local::new();
    local.secrets.insert("API_TOKEN", "hunter2-secret").await.unwrap();

    let report = local
        .run(
            r#"
name: secrets
jobs:
  - name: publish
    steps:
      - name: auth
        run: echo "token=$API_TOKEN"
        secrets: [API_TOKEN]
"#,
        )
        .await;

    assert!(report.is_success());
    let step = &report.job("publish").unwrap().steps[0];
    let log = std::fs::read_to_string(&step.logs[0].path).unwrap();
    assert!(log.contains("token=***"));
    assert!(!log.contains("hunter2-secret"));
}

#[tokio::test]
async fn test_retry_recovers_flaky_step() {
    let local = Local::new();
    let marker = local.dir.path().join("attempted");
    let yaml = format!(
        r#"
name: flaky
jobs:
  - name: test
    retry:
      max_retries: 2
      delay_ms: 10
    steps:
      - name: unit
        run: if [ -f {marker} ]; then exit 0; else touch {marker}; exit 1; fi
"#,
        marker = marker.display()
    );
    let report = local.run(&yaml).await;

    assert!(report.is_success());
    let step = &report.job("test").unwrap().steps[0];
    assert_eq!(step.attempts, 2);
    assert_eq!(step.logs.len(), 2);
}

#[tokio::test]
async fn test_external_gate_escalates_warn_only_metric() {
    let mut local = Local::new();
    local.adapters.insert(
        "scan".to_string(),
        ExternalToolConfig::new("sh")
            .arg("-c")
            .arg(r#"echo "scanning {project}"; echo '{"status":"fail","violations":["code_smells"]}'"#)
            .report(ReportConfig::stdout()),
    );

    let report = local
        .run(
            r#"
name: gated
jobs:
  - name: scan
    steps:
      - name: sonar
        uses: scan
        with:
          project: web-app
        gate:
          blocking_metrics: [bugs]
          warn_only_metrics: [code_smells]
  - name: deploy
    depends_on: [scan]
    steps:
      - name: sync
        run: "true"
"#,
        )
        .await;

    assert_eq!(report.status, RunStatus::Succeeded);
    assert!(report.degraded);
    assert_eq!(
        report.status_of("scan"),
        Some(JobStatus::SucceededWithWarning)
    );
    assert_eq!(report.status_of("deploy"), Some(JobStatus::Succeeded));
    let gate = &report.job("scan").unwrap().gates[0];
    assert_eq!(gate.decision.label(), "escalate");
}

#[tokio::test]
async fn test_external_gate_blocks_deploy() {
    let mut local = Local::new();
    local.adapters.insert(
        "scan".to_string(),
        ExternalToolConfig::new("sh")
            .arg("-c")
            .arg(r#"echo '{"status":"fail","violations":[{"metric":"bugs","actual":"3","threshold":"0"}]}' > gate.json"#)
            .report(ReportConfig::file("gate.json")),
    );

    let report = local
        .run(
            r#"
name: gated
jobs:
  - name: scan
    steps:
      - name: sonar
        uses: scan
        with:
          project: web-app
        gate:
          blocking_metrics: [bugs]
  - name: deploy
    depends_on: [scan]
    steps:
      - name: sync
        run: "true"
"#,
        )
        .await;

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.status_of("scan"), Some(JobStatus::Failed));
    assert_eq!(report.status_of("deploy"), Some(JobStatus::Skipped));
    assert!(report.job("scan").unwrap().gates[0].decision.is_block());
}

#[tokio::test]
async fn test_step_timeout_fails_job() {
    let local = Local::new();
    let report = local
        .run(
            r#"
name: slow
jobs:
  - name: hang
    steps:
      - name: sleep
        run: sleep 5
        timeout_seconds: 1
"#,
        )
        .await;

    assert_eq!(report.status_of("hang"), Some(JobStatus::Failed));
    let error = report.job("hang").unwrap().error.clone().unwrap_or_default();
    assert!(error.contains("timed out"), "{}", error);
}
