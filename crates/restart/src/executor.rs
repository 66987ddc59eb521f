//! Subprocess execution for cluster-management CLIs.
//!
//! Every cluster operation in this crate ends up as a `kubectl` invocation.
//! The [`CommandExecutor`] trait is the seam between workflow logic and the
//! operating system so the workflow can be exercised without a cluster.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::ExecutionError;

/// Default timeout for a single kubectl call.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// A single command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterCommand {
    /// Program followed by its arguments
    pub argv: Vec<String>,
    /// Kill the process after this long
    pub timeout: Duration,
    /// Extra environment variables for the child process
    pub env: BTreeMap<String, String>,
    /// Data piped to the child's stdin (manifests for `kubectl create -f -`)
    pub stdin: Option<String>,
}

impl ClusterCommand {
    /// Build a command from a program and its arguments.
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv = vec![program.to_string()];
        argv.extend(args.into_iter().map(Into::into));
        Self {
            argv,
            timeout: DEFAULT_COMMAND_TIMEOUT,
            env: BTreeMap::new(),
            stdin: None,
        }
    }

    /// Build a `kubectl` command.
    pub fn kubectl<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new("kubectl", args)
    }

    /// Override the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Add an environment override.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Pipe `input` to the process.
    #[must_use]
    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Program name (first element of argv).
    #[must_use]
    pub fn program(&self) -> &str {
        self.argv.first().map_or("", String::as_str)
    }

    /// Arguments after the program name.
    #[must_use]
    pub fn args(&self) -> &[String] {
        self.argv.get(1..).unwrap_or_default()
    }
}

impl std::fmt::Display for ClusterCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.argv.join(" "))
    }
}

/// Captured output of a command that exited successfully.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandResult {
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
    /// Process exit code
    pub exit_code: i32,
}

impl CommandResult {
    /// Successful result with the given stdout.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
        }
    }
}

/// Runs commands. No retries happen at this layer.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `cmd` to completion.
    ///
    /// Timeouts, non-zero exits and launch failures are all errors; a
    /// [`CommandResult`] is only returned for a zero exit.
    async fn execute(&self, cmd: &ClusterCommand) -> Result<CommandResult, ExecutionError>;
}

/// Executor backed by real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessExecutor;

impl ProcessExecutor {
    /// Create a new process executor.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn execute(&self, cmd: &ClusterCommand) -> Result<CommandResult, ExecutionError> {
        let program = cmd.program().to_string();
        let launch_failure = |source: std::io::Error| ExecutionError::LaunchFailure {
            program: program.clone(),
            source,
        };

        if program.is_empty() {
            return Err(launch_failure(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty command line",
            )));
        }

        debug!(command = %cmd, timeout_secs = cmd.timeout.as_secs(), "Executing command");

        let mut child = Command::new(&program)
            .args(cmd.args())
            .envs(&cmd.env)
            // Plain output, no pager or color codes from kubectl
            .env("TERM", "dumb")
            .stdin(if cmd.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(launch_failure)?;

        if let Some(input) = &cmd.stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes())
                    .await
                    .map_err(launch_failure)?;
            }
        }

        // Dropping the wait future on timeout drops the child, which kills it
        let output = match tokio::time::timeout(cmd.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(launch_failure)?,
            Err(_) => {
                return Err(ExecutionError::Timeout {
                    program,
                    timeout: cmd.timeout,
                })
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code().unwrap_or(-1);

        if !output.status.success() {
            return Err(ExecutionError::NonZeroExit {
                program,
                exit_code,
                stdout,
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(CommandResult {
            stdout,
            stderr,
            exit_code,
        })
    }
}
