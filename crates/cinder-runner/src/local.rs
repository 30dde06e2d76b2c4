//! Step runner for the local host.

use crate::adapter::{AdapterOutcome, AdapterRunner};
use crate::logs::LogStore;
use crate::runner::{RunnerConfig, StepKind, StepRequest, StepResult, StepRunner};
use crate::shell::ShellRunner;
use async_trait::async_trait;
use cinder_adapters::AdapterRegistry;
use cinder_core::Result;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Dispatches commands to [`ShellRunner`] and adapter calls to
/// [`AdapterRunner`], capturing output in a [`LogStore`].
pub struct LocalStepRunner {
    shell: ShellRunner,
    adapters: AdapterRunner,
    logs: LogStore,
}

impl LocalStepRunner {
    pub fn new(config: RunnerConfig, registry: Arc<AdapterRegistry>) -> Self {
        Self {
            shell: ShellRunner::new(config.clone()),
            adapters: AdapterRunner::new(registry, config.clone()),
            logs: LogStore::new(config.log_dir),
        }
    }

    pub fn logs(&self) -> &LogStore {
        &self.logs
    }
}

#[async_trait]
impl StepRunner for LocalStepRunner {
    async fn run(&self, request: StepRequest) -> Result<StepResult> {
        let start = Instant::now();
        let mut log = self
            .logs
            .create(
                request.run_id,
                &request.job,
                &request.step,
                request.attempt,
                request.secrets.masker(),
            )
            .await?;

        let outcome = match &request.kind {
            StepKind::Command { script, shell } => self
                .shell
                .execute(script, shell, &request, &mut log)
                .await
                .map(|exit_code| AdapterOutcome {
                    exit_code,
                    success: exit_code == 0,
                    report: None,
                }),
            StepKind::Adapter { kind, params } => {
                self.adapters
                    .execute(*kind, params, &request, &mut log)
                    .await
            }
        };
        let log = log.finish().await?;
        let outcome = outcome?;

        let duration_ms = start.elapsed().as_millis() as u64;
        debug!(
            step = %request.step,
            attempt = request.attempt,
            exit_code = outcome.exit_code,
            duration_ms,
            "step attempt finished"
        );
        Ok(StepResult {
            exit_code: outcome.exit_code,
            success: outcome.success,
            duration_ms,
            log,
            report: outcome.report,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::runner::DEFAULT_INHERIT_ENV;
    use async_trait::async_trait;
    use cinder_core::pipeline::AdapterKind;
    use cinder_core::ports::{Adapter, AdapterCall, RawResult};
    use cinder_core::secrets::{SecretBundle, SecretValue};
    use cinder_core::{Error, JobId, RunId, StepId};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        workspace: std::path::PathBuf,
        runner: LocalStepRunner,
    }

    fn fixture(registry: AdapterRegistry) -> Fixture {
        let dir = TempDir::new().unwrap();
        let workspace = dir.path().join("ws");
        std::fs::create_dir_all(&workspace).unwrap();
        let config = RunnerConfig {
            inherit_env: DEFAULT_INHERIT_ENV.iter().map(|s| s.to_string()).collect(),
            log_dir: dir.path().join("logs"),
        };
        Fixture {
            runner: LocalStepRunner::new(config, Arc::new(registry)),
            workspace,
            _dir: dir,
        }
    }

    fn request(fx: &Fixture, kind: StepKind) -> StepRequest {
        StepRequest {
            run_id: RunId::new(),
            job: JobId::new("build"),
            step: StepId::new("compile"),
            attempt: 1,
            kind,
            env: BTreeMap::new(),
            secrets: SecretBundle::default(),
            workspace: fx.workspace.clone(),
            timeout: Duration::from_secs(30),
            cancel: CancelToken::new(),
        }
    }

    fn command(script: &str) -> StepKind {
        StepKind::Command {
            script: script.to_string(),
            shell: "sh".to_string(),
        }
    }

    #[tokio::test]
    async fn test_shell_success_is_logged() {
        let fx = fixture(AdapterRegistry::new());
        let result = fx.runner.run(request(&fx, command("echo hello; echo oops >&2"))).await.unwrap();
        assert!(result.success);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.log.lines, 2);

        let content = std::fs::read_to_string(&result.log.path).unwrap();
        assert!(content.contains("hello\n"));
        assert!(content.contains("[stderr] oops\n"));
        assert!(result.log.path.ends_with("build/compile.1.log"));
    }

    #[tokio::test]
    async fn test_shell_failure_exit_code() {
        let fx = fixture(AdapterRegistry::new());
        let result = fx.runner.run(request(&fx, command("exit 7"))).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, 7);
    }

    #[tokio::test]
    async fn test_shell_runs_in_workspace() {
        let fx = fixture(AdapterRegistry::new());
        fx.runner
            .run(request(&fx, command("echo built > out.txt")))
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(fx.workspace.join("out.txt")).unwrap(),
            "built\n"
        );
    }

    #[tokio::test]
    async fn test_shell_environment_is_explicit() {
        // SAFETY: the variable name is unique to this test.
        unsafe { std::env::set_var("CINDER_RUNNER_TEST_AMBIENT", "leaked") };
        let fx = fixture(AdapterRegistry::new());
        let mut req = request(&fx, command("echo \"[$CINDER_RUNNER_TEST_AMBIENT] [$GIVEN]\""));
        req.env.insert("GIVEN".into(), "yes".into());

        let result = fx.runner.run(req).await.unwrap();
        let content = std::fs::read_to_string(&result.log.path).unwrap();
        assert_eq!(content, "[] [yes]\n");
    }

    #[tokio::test]
    async fn test_secrets_are_masked_in_log() {
        let fx = fixture(AdapterRegistry::new());
        let mut req = request(&fx, command("echo token=$API_TOKEN"));
        req.env.insert("API_TOKEN".into(), "tok-very-secret".into());
        req.secrets
            .insert("API_TOKEN", SecretValue::new("tok-very-secret"));

        let result = fx.runner.run(req).await.unwrap();
        let content = std::fs::read_to_string(&result.log.path).unwrap();
        assert_eq!(content, "token=***\n");
    }

    #[tokio::test]
    async fn test_shell_timeout() {
        let fx = fixture(AdapterRegistry::new());
        let mut req = request(&fx, command("sleep 30"));
        req.timeout = Duration::from_millis(200);

        let start = Instant::now();
        let err = fx.runner.run(req).await.unwrap_err();
        assert!(matches!(err, Error::StepTimeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_multiline_secret_is_masked_in_log() {
        let fx = fixture(AdapterRegistry::new());
        let key = "-----BEGIN KEY-----\nMIIEsecretmaterialAAAA\n-----END KEY-----\n";
        let mut req = request(&fx, command("printf '%s\\n' \"$DEPLOY_KEY\"; echo pin=$PIN"));
        req.env.insert("DEPLOY_KEY".into(), key.into());
        req.env.insert("PIN".into(), "x9z".into());
        req.secrets.insert("DEPLOY_KEY", SecretValue::new(key));
        req.secrets.insert("PIN", SecretValue::new("x9z"));

        let result = fx.runner.run(req).await.unwrap();
        let content = std::fs::read_to_string(&result.log.path).unwrap();
        assert!(!content.contains("MIIEsecretmaterialAAAA"), "{}", content);
        assert!(!content.contains("BEGIN KEY"), "{}", content);
        assert!(content.contains("pin=***\n"), "{}", content);
    }

    #[tokio::test]
    async fn test_background_process_does_not_hold_step() {
        let fx = fixture(AdapterRegistry::new());
        let mut req = request(&fx, command("sleep 5 & echo started"));
        req.timeout = Duration::from_secs(2);

        let start = Instant::now();
        let result = fx.runner.run(req).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(start.elapsed() < Duration::from_secs(2));
        let content = std::fs::read_to_string(&result.log.path).unwrap();
        assert_eq!(content, "started\n");
    }

    #[tokio::test]
    async fn test_shell_timeout_kills_background_children() {
        let fx = fixture(AdapterRegistry::new());
        let ticks = fx.workspace.join("ticks.txt");
        let mut req = request(
            &fx,
            command("(while true; do echo tick >> ticks.txt; sleep 0.1; done) & wait"),
        );
        req.timeout = Duration::from_millis(500);

        let err = fx.runner.run(req).await.unwrap_err();
        assert!(matches!(err, Error::StepTimeout { .. }));

        let written = std::fs::metadata(&ticks).unwrap().len();
        assert!(written > 0);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(std::fs::metadata(&ticks).unwrap().len(), written);
    }

    #[tokio::test]
    async fn test_shell_cancel_stops_step() {
        let fx = fixture(AdapterRegistry::new());
        let req = request(&fx, command("sleep 30"));
        let cancel = req.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });

        let start = Instant::now();
        let err = fx.runner.run(req).await.unwrap_err();
        assert!(matches!(err, Error::RunCancelled));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    struct ReportingScanner;

    #[async_trait]
    impl Adapter for ReportingScanner {
        fn name(&self) -> &str {
            "scan"
        }

        async fn invoke(&self, call: &AdapterCall) -> cinder_core::Result<RawResult> {
            Ok(RawResult::success()
                .with_stdout(format!("scanning {}", call.param("project").unwrap_or("?")))
                .with_report(json!({"status": "pass"})))
        }
    }

    struct SlowAdapter;

    #[async_trait]
    impl Adapter for SlowAdapter {
        fn name(&self) -> &str {
            "deploy"
        }

        async fn invoke(&self, _call: &AdapterCall) -> cinder_core::Result<RawResult> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(RawResult::success())
        }
    }

    fn adapter(kind: AdapterKind, params: &[(&str, &str)]) -> StepKind {
        StepKind::Adapter {
            kind,
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_adapter_report_and_log() {
        let registry = AdapterRegistry::new();
        registry.register(Arc::new(ReportingScanner));
        let fx = fixture(registry);

        let result = fx
            .runner
            .run(request(&fx, adapter(AdapterKind::Scan, &[("project", "web-app")])))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.report, Some(json!({"status": "pass"})));
        let content = std::fs::read_to_string(&result.log.path).unwrap();
        assert_eq!(content, "scanning web-app\n");
    }

    #[tokio::test]
    async fn test_unregistered_adapter() {
        let fx = fixture(AdapterRegistry::new());
        let err = fx
            .runner
            .run(request(&fx, adapter(AdapterKind::Build, &[])))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AdapterNotFound(name) if name == "build"));
    }

    #[tokio::test]
    async fn test_adapter_timeout() {
        let registry = AdapterRegistry::new();
        registry.register(Arc::new(SlowAdapter));
        let fx = fixture(registry);
        let mut req = request(&fx, adapter(AdapterKind::Deploy, &[]));
        req.timeout = Duration::from_millis(100);

        let err = fx.runner.run(req).await.unwrap_err();
        assert!(matches!(err, Error::StepTimeout { .. }));
    }

    #[tokio::test]
    async fn test_adapter_cancel() {
        let registry = AdapterRegistry::new();
        registry.register(Arc::new(SlowAdapter));
        let fx = fixture(registry);
        let req = request(&fx, adapter(AdapterKind::Deploy, &[]));
        req.cancel.cancel();

        let err = fx.runner.run(req).await.unwrap_err();
        assert!(matches!(err, Error::RunCancelled));
    }
}
