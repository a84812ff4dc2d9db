// src/executor.rs
//! Runs job commands as child processes.

use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::utils::constants::MAX_ERROR_LEN;

/// Result of one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub ok: bool,
    pub stderr: Option<String>,
}

impl ExecutionOutcome {
    pub fn success() -> Self {
        Self {
            ok: true,
            stderr: None,
        }
    }

    pub fn failure(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            stderr: Some(truncate(detail.into())),
        }
    }

    /// Text stored as `last_error` for a failed attempt.
    pub fn error_text(&self) -> String {
        match &self.stderr {
            Some(text) if !text.trim().is_empty() => text.trim().to_string(),
            _ => "command failed".to_string(),
        }
    }
}

/// Starts executions. The engine is generic over this so tests can swap in
/// deterministic runners.
pub trait CommandRunner: Send + Sync + 'static {
    fn spawn(&self, command: &str) -> io::Result<Box<dyn Execution>>;
}

/// An in-flight execution, owned by exactly one worker loop.
#[async_trait]
pub trait Execution: Send {
    /// Wait for the process to finish.
    async fn wait(&mut self) -> ExecutionOutcome;

    /// Force-terminate the process. There is no cooperative cancellation.
    async fn kill(&mut self);
}

/// Runs commands through the platform shell.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    fn spawn(&self, command: &str) -> io::Result<Box<dyn Execution>> {
        let mut cmd = shell_command(command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let stderr = child.stderr.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                if let Err(e) = pipe.read_to_end(&mut buf).await {
                    debug!(error = %e, "stderr read interrupted");
                }
                String::from_utf8_lossy(&buf).into_owned()
            })
        });

        Ok(Box::new(ShellExecution { child, stderr }))
    }
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

struct ShellExecution {
    child: Child,
    stderr: Option<JoinHandle<String>>,
}

impl ShellExecution {
    async fn collect_stderr(&mut self) -> String {
        match self.stderr.take() {
            Some(reader) => reader.await.unwrap_or_default(),
            None => String::new(),
        }
    }
}

#[async_trait]
impl Execution for ShellExecution {
    async fn wait(&mut self) -> ExecutionOutcome {
        match self.child.wait().await {
            Ok(status) if status.success() => {
                // drain so the reader task does not outlive us
                self.collect_stderr().await;
                ExecutionOutcome::success()
            }
            Ok(status) => {
                let stderr = self.collect_stderr().await;
                if stderr.trim().is_empty() {
                    let detail = match status.code() {
                        Some(code) => format!("exited with status {code}"),
                        None => format!("terminated: {status}"),
                    };
                    ExecutionOutcome::failure(detail)
                } else {
                    ExecutionOutcome::failure(stderr)
                }
            }
            Err(e) => ExecutionOutcome::failure(format!("failed to wait for command: {e}")),
        }
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(error = %e, "failed to kill command");
        }
        if let Some(reader) = self.stderr.take() {
            reader.abort();
        }
    }
}

fn truncate(mut text: String) -> String {
    if text.len() > MAX_ERROR_LEN {
        let mut cut = MAX_ERROR_LEN;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn zero_exit_is_success() {
        let mut run = ShellRunner.spawn("true").unwrap();
        assert_eq!(run.wait().await, ExecutionOutcome::success());
    }

    #[tokio::test]
    async fn non_zero_exit_captures_stderr() {
        let mut run = ShellRunner.spawn("echo boom >&2; exit 3").unwrap();
        let outcome = run.wait().await;
        assert!(!outcome.ok);
        assert_eq!(outcome.error_text(), "boom");
    }

    #[tokio::test]
    async fn silent_failure_reports_exit_status() {
        let mut run = ShellRunner.spawn("exit 4").unwrap();
        let outcome = run.wait().await;
        assert!(!outcome.ok);
        assert_eq!(outcome.error_text(), "exited with status 4");
    }

    #[tokio::test]
    async fn kill_stops_a_running_command() {
        let started = Instant::now();
        let mut run = ShellRunner.spawn("sleep 30").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        run.kill().await;
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn long_errors_are_truncated() {
        let outcome = ExecutionOutcome::failure("x".repeat(MAX_ERROR_LEN * 2));
        assert_eq!(outcome.stderr.unwrap().len(), MAX_ERROR_LEN);
    }
}
