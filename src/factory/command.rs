use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// An external command to run inside a workspace directory.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: &str, args: &[&str], cwd: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            cwd: cwd.into(),
            timeout,
        }
    }

    /// `program arg1 arg2`, for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Result of running a command to completion or to its deadline.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Exited(CommandOutput),
    /// The deadline passed and the process was killed.
    TimedOut,
}

/// Abstraction over sandboxed process execution.
/// Real implementation: `ProcessRunner`. Tests provide scripted doubles.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutcome>;
}

/// Runs commands as child processes via `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutcome> {
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn `{}`", spec.display()))?;

        let mut stdout = child
            .stdout
            .take()
            .context("Failed to capture stdout from child process")?;
        let mut stderr = child
            .stderr
            .take()
            .context("Failed to capture stderr from child process")?;

        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stdout.read_to_end(&mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            buf
        });

        let status = match tokio::time::timeout(spec.timeout, child.wait()).await {
            Ok(status) => status.context("Failed to wait for child process")?,
            Err(_) => {
                tracing::warn!(
                    command = %spec.display(),
                    timeout_secs = spec.timeout.as_secs(),
                    "command timed out, killing"
                );
                if let Err(e) = child.start_kill() {
                    tracing::warn!(error = %e, "failed to kill timed out process");
                }
                let _ = child.wait().await;
                stdout_task.abort();
                stderr_task.abort();
                return Ok(CommandOutcome::TimedOut);
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        Ok(CommandOutcome::Exited(CommandOutput {
            // Killed by a signal: no exit code, report -1.
            exit_code: status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        }))
    }
}
