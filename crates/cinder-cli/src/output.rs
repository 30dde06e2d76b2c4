//! Terminal rendering of run progress and reports.

use cinder_core::events::Event;
use cinder_core::gate::GateDecision;
use cinder_core::run::{JobRecord, JobStatus, RunReport, RunStatus};
use console::{StyledObject, Term, style};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Progress output for a running pipeline. Draws a bar on interactive
/// terminals and plain lines otherwise.
pub struct Progress {
    bar: Option<ProgressBar>,
}

impl Progress {
    pub fn new(jobs: usize) -> Self {
        let bar = Term::stderr().is_term().then(|| {
            let bar = ProgressBar::new(jobs as u64);
            if let Ok(template) =
                ProgressStyle::with_template("{spinner:.cyan} [{pos}/{len}] {wide_msg}")
            {
                bar.set_style(template);
            }
            bar.enable_steady_tick(Duration::from_millis(120));
            bar
        });
        Self { bar }
    }

    /// A progress that prints nothing but still consumes events.
    pub fn hidden() -> Self {
        Self {
            bar: Some(ProgressBar::hidden()),
        }
    }

    fn line(&self, message: String) {
        match &self.bar {
            Some(bar) => bar.println(message),
            None => eprintln!("{}", message),
        }
    }

    pub fn handle(&self, event: &Event) {
        match event {
            Event::RunStarted(p) => {
                if let Some(bar) = &self.bar {
                    bar.set_message(p.pipeline.clone());
                }
                self.line(format!(
                    "{} Running {} ({} jobs, {} waves) as {}",
                    style("▶").cyan(),
                    style(&p.pipeline).bold(),
                    p.jobs,
                    p.waves,
                    style(p.run_id).dim()
                ));
            }
            Event::JobStarted(p) => {
                self.line(format!("{} {}", style("▶").cyan(), style(&p.job).bold()));
            }
            Event::StepCompleted(p) => {
                let duration = format_duration(p.duration_ms);
                let line = if p.success {
                    format!("  {} {} ({})", style("✓").green(), p.step, duration)
                } else {
                    let exit = p
                        .exit_code
                        .map(|code| format!("exit {}", code))
                        .unwrap_or_else(|| "error".to_string());
                    let retry = if p.will_retry { ", retrying" } else { "" };
                    format!(
                        "  {} {} ({}, {}{})",
                        style("✗").red(),
                        p.step,
                        exit,
                        duration,
                        retry
                    )
                };
                self.line(format!("{} {}", style(format!("[{}]", p.job)).dim(), line));
            }
            Event::GateEvaluated(p) => {
                let decision = match &p.decision {
                    GateDecision::Proceed => style("proceed".to_string()).green(),
                    GateDecision::Block { reason } => style(format!("block: {}", reason)).red(),
                    GateDecision::Escalate { reason } => {
                        style(format!("escalate: {}", reason)).yellow()
                    }
                };
                self.line(format!(
                    "{}   gate {} {:?}: {}",
                    style(format!("[{}]", p.job)).dim(),
                    p.step,
                    p.status,
                    decision
                ));
            }
            Event::JobCompleted(p) => {
                if let Some(bar) = &self.bar {
                    bar.inc(1);
                }
                let duration = p.duration_ms.map(format_duration).unwrap_or_default();
                let mut line = format!(
                    "{} {} {} {}",
                    status_mark(p.status),
                    style(&p.job).bold(),
                    job_status(p.status),
                    style(duration).dim()
                );
                if let Some(error) = &p.error {
                    line.push_str(&format!(" {}", style(error).dim()));
                }
                self.line(line);
            }
            Event::RunCompleted(_) => {}
        }
    }

    pub fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
    }
}

/// Print a finished run as a table.
pub fn print_report(report: &RunReport) {
    println!();
    println!(
        "Run {} of {}: {}{}",
        style(report.run_id).dim(),
        style(&report.pipeline).bold(),
        run_status(report.status),
        report
            .duration_ms
            .map(|ms| format!(" in {}", format_duration(ms)))
            .unwrap_or_default()
    );
    println!();
    println!(
        "  {:<24} {:<24} {:>8} {:>6} {:>10}  {}",
        "JOB", "STATUS", "ATTEMPTS", "EXIT", "DURATION", "NOTE"
    );
    for job in &report.jobs {
        println!(
            "  {:<24} {:<24} {:>8} {:>6} {:>10}  {}",
            job.job.as_str(),
            job.status.as_str(),
            job.attempts(),
            job.exit_code()
                .map(|code| code.to_string())
                .unwrap_or_else(|| "-".to_string()),
            job.duration_ms()
                .map(format_duration)
                .unwrap_or_else(|| "-".to_string()),
            job_note(job)
        );
    }

    let artifacts: Vec<_> = report.artifacts().collect();
    if !artifacts.is_empty() {
        println!();
        println!("Artifacts:");
        for artifact in artifacts {
            println!(
                "  {}/{} {} ({} bytes)",
                artifact.job_id,
                artifact.name,
                style(short_digest(&artifact.digest)).dim(),
                artifact.size_bytes
            );
        }
    }

    if report.degraded {
        println!();
        println!(
            "{} A quality gate escalated; the run completed in degraded mode",
            style("!").yellow()
        );
    }
    if let Some(cause) = &report.root_cause {
        println!();
        println!(
            "{} Root cause: {}: {}",
            style("✗").red(),
            style(&cause.job).bold(),
            cause.error
        );
    }
}

fn job_note(job: &JobRecord) -> String {
    // The last gate that did not simply proceed explains the status best.
    let gate = job
        .gates
        .iter()
        .rev()
        .find(|g| !g.decision.is_proceed())
        .or(job.gates.last());
    if let Some(gate) = gate {
        return match gate.decision.reason() {
            Some(reason) => format!("gate {}: {}", gate.decision.label(), reason),
            None => format!("gate {}", gate.decision.label()),
        };
    }
    if let Some(upstream) = &job.skipped_because {
        return format!("upstream '{}' failed", upstream);
    }
    job.error.clone().unwrap_or_default()
}

fn status_mark(status: JobStatus) -> StyledObject<&'static str> {
    match status {
        JobStatus::Succeeded => style("✓").green(),
        JobStatus::SucceededWithWarning => style("!").yellow(),
        JobStatus::Failed => style("✗").red(),
        JobStatus::Skipped | JobStatus::Cancelled => style("-").dim(),
        JobStatus::Pending | JobStatus::Running => style("▶").cyan(),
    }
}

fn job_status(status: JobStatus) -> StyledObject<&'static str> {
    let text = status.as_str();
    match status {
        JobStatus::Succeeded => style(text).green(),
        JobStatus::SucceededWithWarning => style(text).yellow(),
        JobStatus::Failed => style(text).red(),
        _ => style(text).dim(),
    }
}

fn run_status(status: RunStatus) -> StyledObject<&'static str> {
    let text = status.as_str();
    match status {
        RunStatus::Succeeded => style(text).green().bold(),
        RunStatus::Failed => style(text).red().bold(),
        RunStatus::Cancelled => style(text).yellow().bold(),
        _ => style(text).dim(),
    }
}

fn short_digest(digest: &str) -> &str {
    digest.get(..12).unwrap_or(digest)
}

/// Human-readable duration: `850ms`, `4.2s`, `3m07s`.
pub fn format_duration(ms: u64) -> String {
    if ms < 1000 {
        format!("{}ms", ms)
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        let secs = ms / 1000;
        format!("{}m{:02}s", secs / 60, secs % 60)
    }
}
