//! Shell-based step execution on the host.
//!
//! Each step runs in its own process group. Timeouts and cancellation
//! signal the whole group, so processes the script started in the
//! background go down with it.

use crate::logs::LogWriter;
use crate::runner::{OutputLine, OutputStream, RunnerConfig, StepRequest};
use cinder_core::{Error, Result};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// How long output is still collected after the shell exits. Background
/// processes holding the pipes open do not keep the step alive past this.
const OUTPUT_GRACE: Duration = Duration::from_millis(500);

/// Time between SIGTERM and SIGKILL when a step is stopped.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Shell runner for executing commands on the host.
pub struct ShellRunner {
    config: RunnerConfig,
}

enum Exit {
    Completed(std::io::Result<ExitStatus>),
    TimedOut,
    LogFailed(Error),
}

impl ShellRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    /// Run `script` with `shell -c` and return its exit code. Output goes to
    /// `log` as it is produced.
    ///
    /// A cancel request sends SIGTERM to the step's process group; the step
    /// then reports [`Error::RunCancelled`] once the shell has exited.
    pub async fn execute(
        &self,
        script: &str,
        shell: &str,
        request: &StepRequest,
        log: &mut LogWriter,
    ) -> Result<i32> {
        info!(
            step = %request.step,
            shell,
            workspace = %request.workspace.display(),
            "executing shell command"
        );

        let mut cmd = Command::new(shell);
        cmd.arg("-c")
            .arg(script)
            .current_dir(&request.workspace)
            .env_clear()
            .envs(self.config.inherited_env())
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        let mut group = ProcessGroup::new(child.id());

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("stdout was not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Internal("stderr was not captured".into()))?;

        let (tx, mut rx) = mpsc::channel(256);
        tokio::spawn(forward_lines(stdout, OutputStream::Stdout, tx.clone()));
        tokio::spawn(forward_lines(stderr, OutputStream::Stderr, tx));

        let deadline = sleep(request.timeout);
        tokio::pin!(deadline);
        let mut cancelled = false;

        let exit = loop {
            tokio::select! {
                Some(line) = rx.recv() => {
                    if let Err(e) = log.write(&line).await {
                        break Exit::LogFailed(e);
                    }
                }
                status = child.wait() => break Exit::Completed(status),
                _ = &mut deadline => break Exit::TimedOut,
                _ = request.cancel.cancelled(), if !cancelled => {
                    info!(step = %request.step, "cancel requested, terminating step");
                    cancelled = true;
                    group.signal(GroupSignal::Terminate);
                }
            }
        };

        match exit {
            Exit::Completed(status) => {
                if cancelled {
                    group.signal(GroupSignal::Kill);
                }
                group.disarm();
                let exit_code = status?.code().unwrap_or(-1);

                let drain = async {
                    while let Some(line) = rx.recv().await {
                        log.write(&line).await?;
                    }
                    Ok::<_, Error>(())
                };
                match timeout(OUTPUT_GRACE, drain).await {
                    Ok(drained) => drained?,
                    Err(_) => {
                        debug!(step = %request.step, "output still open after exit, leaving background processes")
                    }
                }

                if cancelled {
                    return Err(Error::RunCancelled);
                }
                debug!(step = %request.step, exit_code, "command completed");
                Ok(exit_code)
            }
            Exit::TimedOut => {
                let seconds = request.timeout.as_secs();
                warn!(step = %request.step, seconds, "command timed out, terminating process group");
                group.terminate(&mut child).await;
                Err(Error::StepTimeout {
                    step: request.step.to_string(),
                    seconds,
                })
            }
            Exit::LogFailed(e) => {
                group.terminate(&mut child).await;
                Err(e)
            }
        }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

/// The process group a step's shell leads. Killed on drop unless disarmed,
/// which covers a job task being aborted mid-step.
struct ProcessGroup {
    pid: Option<u32>,
    armed: bool,
}

impl ProcessGroup {
    fn new(pid: Option<u32>) -> Self {
        Self { pid, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    #[cfg(unix)]
    fn signal(&self, signal: GroupSignal) {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return;
        };
        let sig = match signal {
            GroupSignal::Terminate => Signal::SIGTERM,
            GroupSignal::Kill => Signal::SIGKILL,
        };
        if let Err(e) = killpg(Pid::from_raw(pid as i32), sig)
            && e != Errno::ESRCH
        {
            warn!(pid, ?signal, error = %e, "failed to signal process group");
        }
    }

    #[cfg(not(unix))]
    fn signal(&self, _signal: GroupSignal) {}

    /// SIGTERM, a short grace, then SIGKILL for whatever is left.
    async fn terminate(&mut self, child: &mut Child) {
        self.signal(GroupSignal::Terminate);
        if timeout(KILL_GRACE, child.wait()).await.is_err() {
            warn!(pid = ?self.pid, "process group ignored SIGTERM");
        }
        self.signal(GroupSignal::Kill);
        self.disarm();
        if let Err(e) = child.kill().await {
            debug!(error = %e, "shell already gone");
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if self.armed {
            self.signal(GroupSignal::Kill);
        }
    }
}

async fn forward_lines<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(content)) = lines.next_line().await {
        let line = OutputLine {
            stream,
            content,
            timestamp: chrono::Utc::now(),
        };
        if tx.send(line).await.is_err() {
            break;
        }
    }
}
