//! Command execution.
//!
//! The worker pool talks to a [`CommandRunner`] trait object, so tests
//! can script outcomes without touching a shell.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Result of one command execution. Failures are data fed to the retry
/// machinery, never errors.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    /// Human-readable failure reason; `None` on success. Recorded as the
    /// job's `last_error`.
    pub error: Option<String>,
}

impl ExecOutcome {
    /// Successful execution with captured output.
    pub fn ok(stdout: String, stderr: String) -> Self {
        Self {
            success: true,
            stdout,
            stderr,
            error: None,
        }
    }

    /// Failed execution with a reason.
    pub fn failed(error: impl Into<String>, stdout: String, stderr: String) -> Self {
        Self {
            success: false,
            stdout,
            stderr,
            error: Some(error.into()),
        }
    }
}

/// Executes an opaque command string within a timeout.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str) -> ExecOutcome;
}

/// Production runner: spawns `sh -c <command>`, captures output, and
/// kills the child if it outlives the configured timeout. A timeout is
/// reported as an ordinary failed outcome.
pub struct ShellRunner {
    timeout: Duration,
}

impl ShellRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, command: &str) -> ExecOutcome {
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                return ExecOutcome::failed(
                    format!("failed to spawn shell: {e}"),
                    String::new(),
                    String::new(),
                )
            }
        };

        // Dropping the future on timeout kills the child via kill_on_drop.
        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                if output.status.success() {
                    ExecOutcome::ok(stdout, stderr)
                } else {
                    ExecOutcome::failed(format!("command failed: {}", output.status), stdout, stderr)
                }
            }
            Ok(Err(e)) => ExecOutcome::failed(
                format!("failed to collect command output: {e}"),
                String::new(),
                String::new(),
            ),
            Err(_) => ExecOutcome::failed(
                format!("command timed out after {:?}", self.timeout),
                String::new(),
                String::new(),
            ),
        }
    }
}
