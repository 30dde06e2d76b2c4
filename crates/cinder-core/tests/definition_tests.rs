//! Parsing tests for pipeline definitions and run reports.

use cinder_core::gate::{GateDecision, GateOutcome, GateResult, GateStatus};
use cinder_core::ids::*;
use cinder_core::pipeline::*;
use cinder_core::run::*;
use pretty_assertions::assert_eq;

const WEB_APP: &str = r#"
version: "1"
name: web-app
variables:
  NODE_ENV: production
jobs:
  - name: test
    steps:
      - name: install
        run: npm ci
      - name: unit
        run: npm test
        timeout_seconds: 600
    outputs:
      - name: coverage
        path: coverage/lcov.info
    retry:
      max_retries: 2
      delay_ms: 1000
      exponential_backoff: true
  - name: scan
    depends_on: [test]
    artifacts:
      - from: test
        name: coverage
        path: coverage/lcov.info
    steps:
      - name: sonar
        uses: scan
        with:
          project: web-app
          token: ${{ secrets.SONAR_TOKEN }}
        gate:
          fail_on_error: true
          blocking_metrics: [bugs, vulnerabilities]
          warn_only_metrics: [code_smells]
  - name: deploy
    depends_on: [scan]
    steps:
      - name: sync
        uses: deploy
        with:
          source: dist
          target: s3://bucket/site
        secrets: [AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY]
"#;

#[test]
fn test_parse_web_app_pipeline() {
    let pipeline = PipelineDefinition::from_yaml(WEB_APP).expect("parse");
    assert_eq!(pipeline.name, "web-app");
    assert_eq!(pipeline.jobs.len(), 3);
    assert_eq!(pipeline.variables.get("NODE_ENV").map(String::as_str), Some("production"));

    for job in &pipeline.jobs {
        job.validate().expect("job is valid");
    }

    let test = pipeline.job("test").unwrap();
    assert_eq!(test.retry.max_retries, 2);
    assert_eq!(test.retry.max_delay_ms, 60_000);
    assert_eq!(test.steps[1].timeout_seconds, Some(600));
    assert_eq!(test.output("coverage").unwrap().path, "coverage/lcov.info");

    let scan = pipeline.job("scan").unwrap();
    assert!(scan.has_gate());
    assert_eq!(scan.depends_on, vec!["test".to_string()]);
    let gate = scan.steps[0].gate.as_ref().unwrap();
    assert!(gate.is_blocking("bugs"));
    assert!(gate.is_warn_only("code_smells"));
    assert_eq!(scan.steps[0].secret_names(), vec!["SONAR_TOKEN"]);

    let deploy = pipeline.job("deploy").unwrap();
    match deploy.steps[0].action().unwrap() {
        StepAction::Adapter { kind, params } => {
            assert_eq!(kind, AdapterKind::Deploy);
            assert_eq!(params.get("target").map(String::as_str), Some("s3://bucket/site"));
        }
        other => panic!("expected adapter step, got {:?}", other),
    }
    assert_eq!(
        deploy.steps[0].secret_names(),
        vec!["AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY"]
    );
}

#[test]
fn test_command_step_defaults_to_sh() {
    let pipeline = PipelineDefinition::from_yaml(WEB_APP).unwrap();
    match pipeline.jobs[0].steps[0].action().unwrap() {
        StepAction::Command { script, shell } => {
            assert_eq!(script, "npm ci");
            assert_eq!(shell, "sh");
        }
        other => panic!("expected command step, got {:?}", other),
    }
}

#[test]
fn test_missing_required_field_is_invalid_pipeline() {
    let err = PipelineDefinition::from_yaml("name: broken\n").unwrap_err();
    assert!(matches!(err, cinder_core::Error::InvalidPipeline(_)));
}

#[test]
fn test_empty_job_is_rejected() {
    let yaml = r#"
name: p
jobs:
  - name: lonely
    steps: []
"#;
    let pipeline = PipelineDefinition::from_yaml(yaml).unwrap();
    let err = pipeline.jobs[0].validate().unwrap_err();
    assert!(err.to_string().contains("has no steps"));
}

#[test]
fn test_unknown_placeholder_namespace_is_rejected() {
    let yaml = r#"
name: p
jobs:
  - name: build
    steps:
      - name: compile
        run: make ${{ matrix.target }}
"#;
    let pipeline = PipelineDefinition::from_yaml(yaml).unwrap();
    assert!(pipeline.jobs[0].validate().is_err());
}

#[test]
fn test_report_json_shape() {
    let mut run = Run::new("web-app", [JobId::new("scan"), JobId::new("deploy")]);
    run.start().unwrap();

    let scan = run.job_mut("scan").unwrap();
    scan.transition(JobStatus::Running).unwrap();
    scan.gates.push(GateOutcome {
        step: "sonar".into(),
        result: GateResult::error("scanner unreachable"),
        decision: GateDecision::Escalate {
            reason: "scanner unreachable".into(),
        },
    });
    scan.transition(JobStatus::SucceededWithWarning).unwrap();
    run.degraded = true;

    let deploy = run.job_mut("deploy").unwrap();
    deploy.transition(JobStatus::Running).unwrap();
    deploy.transition(JobStatus::Succeeded).unwrap();

    let status = run.outcome(false);
    run.finish(status).unwrap();
    let report = run.report();

    let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
    assert_eq!(json["status"], "succeeded");
    assert_eq!(json["degraded"], true);
    assert_eq!(json["jobs"][0]["status"], "succeeded_with_warning");
    assert_eq!(json["jobs"][0]["gates"][0]["decision"]["decision"], "escalate");
    assert_eq!(json["jobs"][0]["gates"][0]["result"]["status"], "error");
    assert_eq!(report.exit_code(), 0);

    let parsed: RunReport = serde_json::from_value(json).unwrap();
    assert_eq!(parsed.status_of("scan"), Some(JobStatus::SucceededWithWarning));
    assert_eq!(
        parsed.job("scan").unwrap().gates[0].result.status,
        GateStatus::Error
    );
}
