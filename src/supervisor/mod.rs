//! Process supervisor.
//!
//! One supervisor exists per in-flight execution. It owns the workspace and
//! the spawned child, walks the state machine
//! `Idle → Spawning → Running → {Completed, Failed, Killed}`, and destroys
//! the workspace exactly once on whichever terminal transition is reached.
//!
//! Pipelines are executed step by step: compile steps run to completion and
//! short-circuit on non-zero exit (their diagnostics surface as the
//! program's own output, there is no separate compile-error channel), then
//! the run step becomes the live process.

pub mod kill;

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use crate::error::ExecError;
use crate::languages::{CommandPipeline, CommandStep};
use crate::multiplexer::{self, OutputEvent, StreamKind};
use crate::workspace::Workspace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Spawning,
    Running,
    Completed,
    Failed,
    Killed,
}

/// Supervises one execution from spawn to cleanup
pub struct Supervisor {
    state: SupervisorState,
    workspace: Option<Workspace>,
}

/// Captured result of a batch execution
#[derive(Debug)]
pub struct BatchOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

/// Output of one pipeline step run to completion
struct StepCapture {
    stdout: String,
    stderr: String,
    exit_code: i32,
    timed_out: bool,
}

/// Build the command for a pipeline step.
///
/// On POSIX the child gets its own process group so [`kill::terminate`] can
/// signal the whole tree.
pub(crate) fn command_for(step: &CommandStep, dir: &Path) -> Command {
    let mut cmd = Command::new(&step.program);
    cmd.args(&step.args)
        .current_dir(dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);
    cmd
}

impl Supervisor {
    pub fn new(workspace: Workspace) -> Self {
        Self {
            state: SupervisorState::Idle,
            workspace: Some(workspace),
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    fn transition(&mut self, next: SupervisorState) {
        debug!("Supervisor: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Enter a terminal state and destroy the workspace
    async fn finish(&mut self, terminal: SupervisorState) {
        self.transition(terminal);
        if let Some(workspace) = self.workspace.take() {
            workspace.destroy().await;
        }
    }

    /// Run the pipeline to completion, capturing all output, within one
    /// wall-clock budget. Consumes the supervisor.
    pub async fn run_batch(
        mut self,
        pipeline: &CommandPipeline,
        time_limit: Duration,
    ) -> Result<BatchOutcome, ExecError> {
        let deadline = Instant::now() + time_limit;
        let root = self.workspace_root();
        self.transition(SupervisorState::Spawning);

        for step in &pipeline.compile {
            let capture = match self.capture_step(step, &root, deadline).await {
                Ok(capture) => capture,
                Err(e) => {
                    self.finish(SupervisorState::Failed).await;
                    return Err(e);
                }
            };

            if capture.timed_out {
                self.finish(SupervisorState::Killed).await;
                return Ok(with_timeout_note(capture, time_limit));
            }
            if capture.exit_code != 0 {
                // Compile failure is not a distinct error path
                self.finish(SupervisorState::Completed).await;
                return Ok(BatchOutcome {
                    stdout: capture.stdout,
                    stderr: capture.stderr,
                    exit_code: capture.exit_code,
                    timed_out: false,
                });
            }
            self.transition(SupervisorState::Spawning);
        }

        let capture = match self.capture_step(&pipeline.run, &root, deadline).await {
            Ok(capture) => capture,
            Err(e) => {
                self.finish(SupervisorState::Failed).await;
                return Err(e);
            }
        };

        if capture.timed_out {
            self.finish(SupervisorState::Killed).await;
            return Ok(with_timeout_note(capture, time_limit));
        }

        self.finish(SupervisorState::Completed).await;
        Ok(BatchOutcome {
            stdout: capture.stdout,
            stderr: capture.stderr,
            exit_code: capture.exit_code,
            timed_out: false,
        })
    }

    /// Spawn one step with no stdin and capture its output until exit or
    /// deadline. On deadline the process tree is terminated and whatever was
    /// captured so far is returned.
    async fn capture_step(
        &mut self,
        step: &CommandStep,
        dir: &Path,
        deadline: Instant,
    ) -> Result<StepCapture, ExecError> {
        let mut child = command_for(step, dir)
            .stdin(Stdio::null())
            .spawn()
            .map_err(ExecError::Spawn)?;
        self.transition(SupervisorState::Running);

        let (stdout_task, stderr_task) = collect_pipes(&mut child);

        let (exit_code, timed_out) = match timeout_at(deadline, child.wait()).await {
            Ok(Ok(status)) => (exit_code_of(&status), false),
            Ok(Err(e)) => {
                kill::terminate(&mut child).await;
                return Err(ExecError::Internal(
                    anyhow::Error::new(e).context("Failed waiting for child process"),
                ));
            }
            Err(_) => {
                kill::terminate(&mut child).await;
                (-1, true)
            }
        };

        Ok(StepCapture {
            stdout: lossy(stdout_task.await.unwrap_or_default()),
            stderr: lossy(stderr_task.await.unwrap_or_default()),
            exit_code,
            timed_out,
        })
    }

    /// Stream the pipeline live: compile diagnostics and run output are
    /// relayed as events, stdin lines are forwarded, and `cancel` kills the
    /// process tree. Always ends with one `system` event, then destroys the
    /// workspace. Consumes the supervisor.
    ///
    /// The event sender is unbounded, so this task never blocks on a reader
    /// and a `kill` waiting for it always completes.
    pub async fn run_interactive(
        mut self,
        pipeline: CommandPipeline,
        entry: String,
        events: mpsc::UnboundedSender<OutputEvent>,
        input_rx: mpsc::Receiver<String>,
        cancel: Arc<Notify>,
    ) {
        let root = self.workspace_root();
        let _ = events.send(OutputEvent::system(format!("Launching {}", entry)));
        self.transition(SupervisorState::Spawning);

        for step in &pipeline.compile {
            let mut child = match command_for(step, &root).stdin(Stdio::null()).spawn() {
                Ok(child) => child,
                Err(e) => {
                    let _ = events.send(OutputEvent::system(format!(
                        "Failed to start {}: {}",
                        step.program, e
                    )));
                    self.finish(SupervisorState::Failed).await;
                    return;
                }
            };
            self.transition(SupervisorState::Running);

            let (stdout_task, stderr_task) = collect_pipes(&mut child);

            let status = tokio::select! {
                _ = cancel.notified() => {
                    kill::terminate(&mut child).await;
                    let _ = stdout_task.await;
                    let _ = stderr_task.await;
                    let _ = events.send(OutputEvent::system("Process terminated"));
                    self.finish(SupervisorState::Killed).await;
                    return;
                }
                res = child.wait() => res,
            };

            let stdout = lossy(stdout_task.await.unwrap_or_default());
            let stderr = lossy(stderr_task.await.unwrap_or_default());
            if !stdout.is_empty() {
                let _ = events.send(OutputEvent::new(StreamKind::Stdout, stdout));
            }
            if !stderr.is_empty() {
                let _ = events.send(OutputEvent::new(StreamKind::Stderr, stderr));
            }

            match status {
                Ok(status) if status.success() => {
                    self.transition(SupervisorState::Spawning);
                }
                Ok(status) => {
                    let _ = events.send(OutputEvent::system(format!(
                        "Process exited with code {}",
                        exit_code_of(&status)
                    )));
                    self.finish(SupervisorState::Completed).await;
                    return;
                }
                Err(e) => {
                    let _ =
                        events.send(OutputEvent::system(format!("Execution failed: {}", e)));
                    self.finish(SupervisorState::Failed).await;
                    return;
                }
            }
        }

        let mut child = match command_for(&pipeline.run, &root).spawn() {
            Ok(child) => child,
            Err(e) => {
                let _ = events.send(OutputEvent::system(format!(
                    "Failed to start {}: {}",
                    pipeline.run.program, e
                )));
                self.finish(SupervisorState::Failed).await;
                return;
            }
        };
        self.transition(SupervisorState::Running);

        let pumps = multiplexer::attach(&mut child, events.clone(), input_rx);

        let outcome = tokio::select! {
            _ = cancel.notified() => {
                kill::terminate(&mut child).await;
                None
            }
            res = child.wait() => res.ok(),
        };

        // Drain remaining output before announcing the terminal event; the
        // pumps end at pipe EOF, which the kill above forces too.
        pumps.join().await;

        match outcome {
            Some(status) => {
                let _ = events.send(OutputEvent::system(format!(
                    "Process exited with code {}",
                    exit_code_of(&status)
                )));
                self.finish(SupervisorState::Completed).await;
            }
            None => {
                let _ = events.send(OutputEvent::system("Process terminated"));
                self.finish(SupervisorState::Killed).await;
            }
        }
    }

    fn workspace_root(&self) -> std::path::PathBuf {
        self.workspace
            .as_ref()
            .expect("workspace owned until terminal transition")
            .root()
            .to_path_buf()
    }
}

/// Spawn read-to-end collectors for the child's stdout and stderr
fn collect_pipes(child: &mut Child) -> (JoinHandle<Vec<u8>>, JoinHandle<Vec<u8>>) {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = stdout {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = stderr {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });

    (stdout_task, stderr_task)
}

fn with_timeout_note(mut capture: StepCapture, limit: Duration) -> BatchOutcome {
    if !capture.stderr.is_empty() && !capture.stderr.ends_with('\n') {
        capture.stderr.push('\n');
    }
    capture.stderr.push_str(&format!(
        "Execution timed out after {} ms and was terminated",
        limit.as_millis()
    ));

    BatchOutcome {
        stdout: capture.stdout,
        stderr: capture.stderr,
        exit_code: capture.exit_code,
        timed_out: true,
    }
}

fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    status.code().unwrap_or(-1)
}

fn lossy(bytes: Vec<u8>) -> String {
    String::from_utf8_lossy(&bytes).into_owned()
}
