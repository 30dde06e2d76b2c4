//! Run orchestration.
//!
//! The engine drives a [`JobGraph`] wave by wave. Each job runs in its own
//! task with its steps executed sequentially; at most `workers` jobs of a
//! wave are in flight at once. Job tasks report back to the owner loop,
//! which is the only place job status changes.

use crate::dag::JobGraph;
use crate::gate::GateEvaluator;
use cinder_core::events::*;
use cinder_core::gate::{GateDecision, GateOutcome, GateResult};
use cinder_core::pipeline::{JobDefinition, StepDefinition};
use cinder_core::ports::ArtifactStore;
use cinder_core::run::{ArtifactRef, JobStatus, Run, RunReport, StepRecord};
use cinder_core::{Error, JobId, Result, RunId, StepId};
use cinder_runner::{
    CancelToken, StepKind, StepRequest, StepResult, StepRunner, Workspace, prepare_step,
};
use cinder_secrets::SecretStore;
use cinder_trace::{CiAttributes, artifact_span, job_span, run_span, secret_span, step_span};
use chrono::Utc;
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{Instrument, debug, error, info, warn};

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of jobs in flight.
    pub workers: usize,
    /// How long in-flight jobs may keep running after a cancel request.
    pub cancel_grace: Duration,
    /// Used when neither the step nor its job sets a timeout.
    pub default_step_timeout: Duration,
    pub workspace_dir: PathBuf,
    pub keep_workspaces: bool,
    /// Layered over the pipeline's variables.
    pub variables: BTreeMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            cancel_grace: Duration::from_secs(10),
            default_step_timeout: Duration::from_secs(1800),
            workspace_dir: std::env::temp_dir().join("cinder").join("workspaces"),
            keep_workspaces: false,
            variables: BTreeMap::new(),
        }
    }
}

/// A run executing in the background.
pub struct RunHandle {
    run_id: RunId,
    cancel: CancelToken,
    task: JoinHandle<Result<RunReport>>,
}

impl RunHandle {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Request cancellation. Returns immediately.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub async fn wait(self) -> Result<RunReport> {
        self.task
            .await
            .map_err(|e| Error::Internal(format!("run task failed: {}", e)))?
    }
}

/// Executes job graphs.
#[derive(Clone)]
pub struct PipelineEngine {
    config: Arc<EngineConfig>,
    runner: Arc<dyn StepRunner>,
    artifacts: Arc<dyn ArtifactStore>,
    secrets: Arc<SecretStore>,
    events: Option<mpsc::UnboundedSender<Event>>,
    gates: GateEvaluator,
}

impl PipelineEngine {
    pub fn new(
        config: EngineConfig,
        runner: Arc<dyn StepRunner>,
        artifacts: Arc<dyn ArtifactStore>,
        secrets: Arc<SecretStore>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            runner,
            artifacts,
            secrets,
            events: None,
            gates: GateEvaluator::new(),
        }
    }

    /// Send progress events to `sink`.
    pub fn with_events(mut self, sink: mpsc::UnboundedSender<Event>) -> Self {
        self.events = Some(sink);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execute a graph to completion.
    ///
    /// Job failures are contained and reported. Fatal errors (artifact store
    /// failures, internal errors) abort the run and are returned as `Err`.
    pub async fn execute(&self, graph: &JobGraph, cancel: CancelToken) -> Result<RunReport> {
        self.execute_run(RunId::new(), graph, cancel).await
    }

    /// Execute a graph on a background task.
    pub fn start(&self, graph: JobGraph) -> RunHandle {
        let run_id = RunId::new();
        let cancel = CancelToken::new();
        let engine = self.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { engine.execute_run(run_id, &graph, token).await });
        RunHandle {
            run_id,
            cancel,
            task,
        }
    }

    async fn execute_run(
        &self,
        run_id: RunId,
        graph: &JobGraph,
        cancel: CancelToken,
    ) -> Result<RunReport> {
        let span = run_span(&CiAttributes::new().pipeline(graph.name()).run(run_id));
        self.drive(run_id, graph, cancel).instrument(span).await
    }

    async fn drive(&self, run_id: RunId, graph: &JobGraph, cancel: CancelToken) -> Result<RunReport> {
        let mut run = Run::with_id(run_id, graph.name(), graph.job_ids());
        let batches = graph.topological_batches();

        self.artifacts.retain(run_id).await?;
        run.start()?;
        info!(
            run_id = %run_id,
            pipeline = %graph.name(),
            jobs = graph.len(),
            waves = batches.len(),
            "run started"
        );
        self.emit(Event::RunStarted(RunStartedPayload {
            run_id,
            pipeline: graph.name().to_string(),
            jobs: graph.len(),
            waves: batches.len(),
            started_at: Utc::now(),
        }));

        let mut variables = graph.variables().clone();
        variables.extend(self.config.variables.clone());

        if let Err(e) = self
            .run_waves(&mut run, graph, &batches, &variables, &cancel)
            .await
        {
            error!(run_id = %run_id, error = %e, "run aborted");
            if let Err(release_err) = self.artifacts.release(run_id).await {
                warn!(run_id = %run_id, error = %release_err, "failed to release run artifacts");
            }
            return Err(e);
        }

        self.cancel_pending(&mut run)?;
        let cancelled = run.jobs().iter().any(|j| j.status == JobStatus::Cancelled);
        let status = run.outcome(cancelled);
        run.finish(status)?;

        let report = run.report();
        info!(
            run_id = %run_id,
            status = %status,
            degraded = run.degraded,
            duration_ms = report.duration_ms.unwrap_or(0),
            "run completed"
        );
        self.emit(Event::RunCompleted(RunCompletedPayload {
            run_id,
            status,
            degraded: run.degraded,
            duration_ms: report.duration_ms,
        }));
        Ok(report)
    }

    async fn run_waves(
        &self,
        run: &mut Run,
        graph: &JobGraph,
        batches: &[Vec<JobId>],
        variables: &BTreeMap<String, String>,
        cancel: &CancelToken,
    ) -> Result<()> {
        let workers = self.config.workers.max(1);

        for (wave, batch) in batches.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(wave, "cancellation requested, not starting further waves");
                break;
            }

            let mut queue: VecDeque<JobId> = batch
                .iter()
                .filter(|id| {
                    run.job(id.as_str())
                        .is_some_and(|j| j.status == JobStatus::Pending)
                })
                .cloned()
                .collect();
            debug!(wave, jobs = queue.len(), "dispatching wave");

            let mut tasks: JoinSet<(JobId, Result<JobOutcome>)> = JoinSet::new();
            let mut grace_deadline: Option<Instant> = None;

            loop {
                while tasks.len() < workers && !cancel.is_cancelled() {
                    let Some(id) = queue.pop_front() else {
                        break;
                    };
                    let task = self.prepare_job(run, graph, &id, variables, cancel)?;
                    run.job_mut(id.as_str())?.transition(JobStatus::Running)?;
                    self.emit(Event::JobStarted(JobStartedPayload {
                        run_id: run.id,
                        job: id.clone(),
                        started_at: Utc::now(),
                    }));
                    let span = job_span(&CiAttributes::new().run(run.id).job(id.as_str()));
                    tasks.spawn(
                        async move {
                            let outcome = task.run().await;
                            (id, outcome)
                        }
                        .instrument(span),
                    );
                }

                if tasks.is_empty() {
                    break;
                }

                let deadline = grace_deadline;
                tokio::select! {
                    joined = tasks.join_next() => {
                        if let Some(joined) = joined {
                            self.collect(run, graph, joined, &mut tasks)?;
                        }
                    }
                    _ = cancel.cancelled(), if deadline.is_none() => {
                        info!(
                            in_flight = tasks.len(),
                            grace_ms = self.config.cancel_grace.as_millis() as u64,
                            "cancellation requested, waiting for in-flight jobs"
                        );
                        grace_deadline = Some(grace_deadline_from(
                            Instant::now(),
                            self.config.cancel_grace,
                        ));
                    }
                    _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                        warn!(in_flight = tasks.len(), "grace period elapsed, terminating jobs");
                        tasks.abort_all();
                        while let Some(joined) = tasks.join_next().await {
                            match joined {
                                Err(e) if e.is_cancelled() => {}
                                joined => self.collect(run, graph, joined, &mut tasks)?,
                            }
                        }
                        self.terminate_running(run)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Apply one finished job task. Fatal errors stop every other task.
    fn collect(
        &self,
        run: &mut Run,
        graph: &JobGraph,
        joined: std::result::Result<(JobId, Result<JobOutcome>), tokio::task::JoinError>,
        tasks: &mut JoinSet<(JobId, Result<JobOutcome>)>,
    ) -> Result<()> {
        match joined {
            Ok((id, Ok(outcome))) => self.apply(run, graph, &id, outcome),
            Ok((id, Err(e))) => {
                tasks.abort_all();
                run.note_failure(&id, e.to_string());
                Err(e)
            }
            Err(e) => {
                tasks.abort_all();
                Err(Error::Internal(format!("job task failed: {}", e)))
            }
        }
    }

    fn prepare_job(
        &self,
        run: &Run,
        graph: &JobGraph,
        id: &JobId,
        variables: &BTreeMap<String, String>,
        cancel: &CancelToken,
    ) -> Result<JobTask> {
        let def = graph
            .job(id.as_str())
            .ok_or_else(|| Error::Internal(format!("graph has no job '{}'", id)))?
            .clone();

        let mut inputs = Vec::with_capacity(def.artifacts.len());
        for input in &def.artifacts {
            let artifact = run
                .job(&input.from)
                .and_then(|record| record.artifacts.iter().find(|a| a.name == input.name))
                .cloned()
                .ok_or_else(|| {
                    Error::ArtifactNotFound(format!("{}/{}", input.from, input.name))
                })?;
            let destination = match &input.path {
                Some(path) => path.clone(),
                None => graph
                    .job(&input.from)
                    .and_then(|producer| producer.output(&input.name))
                    .map(|output| output.path.clone())
                    .ok_or_else(|| {
                        Error::ArtifactNotFound(format!("{}/{}", input.from, input.name))
                    })?,
            };
            inputs.push(MaterializedInput {
                artifact,
                destination,
            });
        }

        let mut job_variables = variables.clone();
        job_variables.extend(def.variables.clone());

        Ok(JobTask {
            run_id: run.id,
            job: id.clone(),
            workspace: Workspace::new(&self.config.workspace_dir, run.id, id)
                .keep(self.config.keep_workspaces),
            def,
            variables: job_variables,
            inputs,
            default_timeout: self.config.default_step_timeout,
            runner: self.runner.clone(),
            artifacts: self.artifacts.clone(),
            secrets: self.secrets.clone(),
            events: self.events.clone(),
            gates: self.gates,
            cancel: cancel.clone(),
        })
    }

    fn apply(&self, run: &mut Run, graph: &JobGraph, id: &JobId, outcome: JobOutcome) -> Result<()> {
        let record = run.job_mut(id.as_str())?;
        record.steps = outcome.steps;
        record.artifacts = outcome.artifacts;
        record.gates = outcome.gates;
        record.error = outcome.error.clone();
        record.transition(outcome.status)?;
        let duration_ms = record.duration_ms();

        info!(
            job = %id,
            status = %outcome.status,
            duration_ms = duration_ms.unwrap_or(0),
            "job completed"
        );
        self.emit(Event::JobCompleted(JobCompletedPayload {
            run_id: run.id,
            job: id.clone(),
            status: outcome.status,
            error: outcome.error.clone(),
            duration_ms,
        }));

        if outcome.degraded {
            run.degraded = true;
        }
        if outcome.status == JobStatus::Failed {
            let error = outcome.error.unwrap_or_else(|| "job failed".to_string());
            run.note_failure(id, error);
            self.skip_downstream(run, graph, id)?;
        }
        Ok(())
    }

    fn skip_downstream(&self, run: &mut Run, graph: &JobGraph, failed: &JobId) -> Result<()> {
        for id in graph.downstream(failed.as_str()) {
            let record = run.job_mut(id.as_str())?;
            if record.status != JobStatus::Pending {
                continue;
            }
            record.transition(JobStatus::Skipped)?;
            record.skipped_because = Some(failed.clone());
            let error = format!("upstream job '{}' failed", failed);
            record.error = Some(error.clone());
            info!(job = %id, upstream = %failed, "job skipped");
            self.emit(Event::JobCompleted(JobCompletedPayload {
                run_id: run.id,
                job: id,
                status: JobStatus::Skipped,
                error: Some(error),
                duration_ms: None,
            }));
        }
        Ok(())
    }

    fn terminate_running(&self, run: &mut Run) -> Result<()> {
        self.close_jobs(
            run,
            JobStatus::Running,
            "terminated after the cancellation grace period",
        )
    }

    fn cancel_pending(&self, run: &mut Run) -> Result<()> {
        self.close_jobs(run, JobStatus::Pending, "run cancelled before the job started")
    }

    fn close_jobs(&self, run: &mut Run, from: JobStatus, reason: &str) -> Result<()> {
        let ids: Vec<JobId> = run
            .jobs()
            .iter()
            .filter(|j| j.status == from)
            .map(|j| j.job.clone())
            .collect();
        for id in ids {
            let record = run.job_mut(id.as_str())?;
            record.transition(JobStatus::Cancelled)?;
            record.error = Some(reason.to_string());
            let duration_ms = record.duration_ms();
            self.emit(Event::JobCompleted(JobCompletedPayload {
                run_id: run.id,
                job: id,
                status: JobStatus::Cancelled,
                error: Some(reason.to_string()),
                duration_ms,
            }));
        }
        Ok(())
    }

    fn emit(&self, event: Event) {
        emit(&self.events, event);
    }
}

fn emit(sink: &Option<mpsc::UnboundedSender<Event>>, event: Event) {
    if let Some(sink) = sink {
        // A closed receiver only means nobody is watching.
        let _ = sink.send(event);
    }
}

/// An upstream artifact to place in the workspace before the first step.
struct MaterializedInput {
    artifact: ArtifactRef,
    destination: String,
}

/// Far enough out that an unrepresentable grace period means "wait for the
/// jobs to finish".
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn grace_deadline_from(now: Instant, grace: Duration) -> Instant {
    now.checked_add(grace)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// What a job task reports back to the owner loop.
#[derive(Debug)]
struct JobOutcome {
    status: JobStatus,
    steps: Vec<StepRecord>,
    artifacts: Vec<ArtifactRef>,
    gates: Vec<GateOutcome>,
    error: Option<String>,
    degraded: bool,
}

impl JobOutcome {
    fn new() -> Self {
        Self {
            status: JobStatus::Succeeded,
            steps: Vec::new(),
            artifacts: Vec::new(),
            gates: Vec::new(),
            error: None,
            degraded: false,
        }
    }

    fn fail(&mut self, error: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.error = Some(error.into());
    }

    fn cancel(&mut self, reason: impl Into<String>) {
        self.status = JobStatus::Cancelled;
        self.error = Some(reason.into());
    }
}

/// Everything one job needs, owned so it can run on its own task.
struct JobTask {
    run_id: RunId,
    job: JobId,
    def: JobDefinition,
    variables: BTreeMap<String, String>,
    inputs: Vec<MaterializedInput>,
    workspace: Workspace,
    default_timeout: Duration,
    runner: Arc<dyn StepRunner>,
    artifacts: Arc<dyn ArtifactStore>,
    secrets: Arc<SecretStore>,
    events: Option<mpsc::UnboundedSender<Event>>,
    gates: GateEvaluator,
    cancel: CancelToken,
}

/// Whether the job goes on after a step.
enum Flow {
    Continue,
    Stop,
}

impl JobTask {
    async fn run(self) -> Result<JobOutcome> {
        if let Err(e) = self.workspace.prepare().await {
            let mut outcome = JobOutcome::new();
            outcome.fail(format!("failed to prepare workspace: {}", e));
            return Ok(outcome);
        }
        let outcome = self.run_in_workspace().await;
        if let Err(e) = self.workspace.cleanup().await {
            warn!(job = %self.job, error = %e, "workspace cleanup failed");
        }
        outcome
    }

    async fn run_in_workspace(&self) -> Result<JobOutcome> {
        let mut outcome = JobOutcome::new();

        for input in &self.inputs {
            let name = &input.artifact.name;
            let bytes = self
                .artifacts
                .get(&input.artifact)
                .instrument(artifact_span("get", name))
                .await?;
            if let Err(e) = self.write_input(&input.destination, &bytes).await {
                outcome.fail(format!(
                    "failed to place artifact '{}' at '{}': {}",
                    name, input.destination, e
                ));
                return Ok(outcome);
            }
            debug!(job = %self.job, artifact = %name, bytes = bytes.len(), "artifact materialised");
        }

        for step in &self.def.steps {
            if self.cancel.is_cancelled() {
                outcome.cancel(format!("run cancelled before step '{}'", step.name));
                return Ok(outcome);
            }
            if let Flow::Stop = self.run_step(step, &mut outcome).await? {
                return Ok(outcome);
            }
        }

        for output in &self.def.outputs {
            let bytes = match self.read_output(&output.path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    outcome.fail(format!(
                        "declared output '{}' could not be read from '{}': {}",
                        output.name, output.path, e
                    ));
                    return Ok(outcome);
                }
            };
            let artifact = self
                .artifacts
                .put(self.run_id, &self.job, &output.name, bytes)
                .instrument(artifact_span("put", &output.name))
                .await?;
            info!(
                job = %self.job,
                artifact = %artifact.name,
                digest = %artifact.digest,
                size_bytes = artifact.size_bytes,
                "artifact stored"
            );
            outcome.artifacts.push(artifact);
        }

        Ok(outcome)
    }

    async fn write_input(&self, destination: &str, bytes: &[u8]) -> Result<()> {
        let path = self.workspace.resolve(destination)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }

    async fn read_output(&self, relative: &str) -> Result<Vec<u8>> {
        let path = self.workspace.resolve(relative)?;
        Ok(tokio::fs::read(&path).await?)
    }

    fn timeout_for(&self, step: &StepDefinition) -> Duration {
        step.timeout_seconds
            .or(self.def.timeout_seconds)
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout)
    }

    async fn run_step(&self, step: &StepDefinition, outcome: &mut JobOutcome) -> Result<Flow> {
        let mut record = StepRecord {
            name: step.name.clone(),
            success: false,
            attempts: 0,
            exit_code: None,
            duration_ms: 0,
            logs: Vec::new(),
            error: None,
        };

        // Missing secrets fail the step at once; another attempt cannot help.
        let names = step.secret_names();
        let resolved = self
            .secrets
            .resolve_all(names.as_slice())
            .instrument(secret_span(&names.join(",")))
            .await;
        let prepared = resolved.and_then(|bundle| {
            let prepared = prepare_step(step, &self.variables, &bundle)?;
            Ok((bundle, prepared))
        });
        let (bundle, prepared) = match prepared {
            Ok(ready) => ready,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(job = %self.job, step = %step.name, error = %e, "step could not be prepared");
                let message = format!("step '{}' failed: {}", step.name, e);
                record.error = Some(e.to_string());
                outcome.steps.push(record);
                outcome.fail(message);
                return Ok(Flow::Stop);
            }
        };

        let step_id = StepId::new(&step.name);
        let adapter = match &prepared.kind {
            StepKind::Adapter { kind, .. } => Some(kind.as_str()),
            StepKind::Command { .. } => None,
        };
        let timeout = self.timeout_for(step);
        let max_attempts = if step.is_gate() {
            1
        } else {
            self.def.retry.max_attempts()
        };

        let mut attempt = 0;
        let mut interrupted = false;
        let result: Result<StepResult> = loop {
            attempt += 1;
            let request = StepRequest {
                run_id: self.run_id,
                job: self.job.clone(),
                step: step_id.clone(),
                attempt,
                kind: prepared.kind.clone(),
                env: prepared.env.clone(),
                secrets: bundle.clone(),
                workspace: self.workspace.path().to_path_buf(),
                timeout,
                cancel: self.cancel.clone(),
            };
            let mut attrs = CiAttributes::new()
                .job(self.job.as_str())
                .step(&step.name)
                .attempt(attempt);
            if let Some(adapter) = adapter {
                attrs = attrs.adapter(adapter);
            }

            let started = Instant::now();
            let result = match self.runner.run(request).instrument(step_span(&attrs)).await {
                Err(e) if e.is_fatal() => return Err(e),
                other => other,
            };

            record.attempts = attempt;
            let (success, retryable) = match &result {
                Ok(r) => {
                    record.exit_code = Some(r.exit_code);
                    record.duration_ms += r.duration_ms;
                    record.logs.push(r.log.clone());
                    record.error = None;
                    (r.success, !r.success)
                }
                Err(e) => {
                    record.duration_ms += started.elapsed().as_millis() as u64;
                    record.error = Some(e.to_string());
                    (false, e.is_retryable() && !matches!(e, Error::SecretNotFound(_)))
                }
            };
            let will_retry =
                !success && retryable && attempt < max_attempts && !self.cancel.is_cancelled();

            emit(
                &self.events,
                Event::StepCompleted(StepCompletedPayload {
                    run_id: self.run_id,
                    job: self.job.clone(),
                    step: step_id.clone(),
                    attempt,
                    success,
                    exit_code: record.exit_code,
                    duration_ms: record.duration_ms,
                    will_retry,
                }),
            );

            if !will_retry {
                break result;
            }
            let delay = self.def.retry.delay_for(attempt);
            warn!(
                job = %self.job,
                step = %step.name,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                "step failed, retrying"
            );
            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.cancel.cancelled() => {
                    interrupted = true;
                    break result;
                }
            }
        };

        if let Some(policy) = &step.gate
            && !matches!(result, Err(Error::SecretNotFound(_)) | Err(Error::RunCancelled))
        {
            let (gate_result, decision) = match &result {
                Ok(r) if r.success || r.report.is_some() => {
                    self.gates.evaluate_report(r.report.as_ref(), policy)
                }
                Ok(r) => {
                    let gate_result =
                        GateResult::error(format!("gate tool exited with code {}", r.exit_code));
                    let decision = self.gates.evaluate(&gate_result, policy);
                    (gate_result, decision)
                }
                Err(e) => {
                    let gate_result = GateResult::error(e.to_string());
                    let decision = self.gates.evaluate(&gate_result, policy);
                    (gate_result, decision)
                }
            };
            return Ok(self.record_gate(step, &step_id, record, gate_result, decision, outcome));
        }

        let success = matches!(&result, Ok(r) if r.success);
        record.success = success;
        outcome.steps.push(record);
        if success {
            return Ok(Flow::Continue);
        }
        if interrupted {
            outcome.cancel(format!("run cancelled while step '{}' awaited a retry", step.name));
            return Ok(Flow::Stop);
        }
        if matches!(result, Err(Error::RunCancelled)) {
            outcome.cancel(format!("step '{}' was stopped by cancellation", step.name));
            return Ok(Flow::Stop);
        }
        let message = match &result {
            Ok(r) => format!("step '{}' failed with exit code {}", step.name, r.exit_code),
            Err(e) => format!("step '{}' failed: {}", step.name, e),
        };
        warn!(job = %self.job, step = %step.name, attempts = attempt, "{}", message);
        outcome.fail(message);
        Ok(Flow::Stop)
    }

    fn record_gate(
        &self,
        step: &StepDefinition,
        step_id: &StepId,
        mut record: StepRecord,
        result: GateResult,
        decision: GateDecision,
        outcome: &mut JobOutcome,
    ) -> Flow {
        info!(
            job = %self.job,
            step = %step.name,
            status = ?result.status,
            decision = decision.label(),
            "quality gate evaluated"
        );
        emit(
            &self.events,
            Event::GateEvaluated(GateEvaluatedPayload {
                run_id: self.run_id,
                job: self.job.clone(),
                step: step_id.clone(),
                status: result.status,
                decision: decision.clone(),
            }),
        );

        record.success = !decision.is_block();
        outcome.steps.push(record);
        outcome.gates.push(GateOutcome {
            step: step.name.clone(),
            result,
            decision: decision.clone(),
        });

        match decision {
            GateDecision::Proceed => Flow::Continue,
            GateDecision::Escalate { reason } => {
                warn!(job = %self.job, step = %step.name, %reason, "quality gate escalated");
                outcome.status = JobStatus::SucceededWithWarning;
                outcome.degraded = true;
                Flow::Continue
            }
            GateDecision::Block { reason } => {
                let blocked = Error::GateBlocked {
                    job: self.job.to_string(),
                    reason,
                };
                outcome.fail(blocked.to_string());
                Flow::Stop
            }
        }
    }
}
