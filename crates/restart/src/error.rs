//! Error and warning types.

use std::time::Duration;

use thiserror::Error;

/// Why a cluster command could not produce a usable result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionErrorKind {
    /// The command exceeded its timeout and was killed
    Timeout,
    /// The command ran but exited with a non-zero status
    NonZeroExit,
    /// The process could not be spawned at all
    LaunchFailure,
}

/// Errors raised by the command executor.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Command timed out; its output is discarded
    #[error("`{program}` timed out after {}s", timeout.as_secs())]
    Timeout {
        /// Program that was running
        program: String,
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// Command exited non-zero
    #[error("`{program}` exited with code {exit_code}: {stderr}")]
    NonZeroExit {
        /// Program that was running
        program: String,
        /// Exit code (-1 when terminated by a signal)
        exit_code: i32,
        /// Captured stdout
        stdout: String,
        /// Captured stderr
        stderr: String,
    },

    /// Process could not be launched
    #[error("failed to launch `{program}`: {source}")]
    LaunchFailure {
        /// Program that could not be started
        program: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

impl ExecutionError {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ExecutionErrorKind {
        match self {
            Self::Timeout { .. } => ExecutionErrorKind::Timeout,
            Self::NonZeroExit { .. } => ExecutionErrorKind::NonZeroExit,
            Self::LaunchFailure { .. } => ExecutionErrorKind::LaunchFailure,
        }
    }

    /// Stderr of a failed command, if it ran at all.
    #[must_use]
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::NonZeroExit { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

/// Errors raised by [`crate::cluster::ClusterApi`] implementations.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The underlying kubectl command failed
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// kubectl output could not be parsed
    #[error("failed to parse kubectl output: {0}")]
    Parse(#[from] serde_json::Error),

    /// A manifest could not be serialized for kubectl
    #[error("invalid manifest: {0}")]
    Manifest(String),
}

/// Errors raised while stopping or starting the environment.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// A kubectl call failed
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// The job finished unsuccessfully
    #[error("job {job} failed")]
    JobFailed {
        /// Job name
        job: String,
    },

    /// The job did not finish in time
    #[error("job {job} did not finish within {}s", timeout.as_secs())]
    JobTimedOut {
        /// Job name
        job: String,
        /// How long we waited
        timeout: Duration,
    },
}

/// Errors raised while backing up container logs.
#[derive(Debug, Error)]
pub enum BackupError {
    /// Pods could not be listed
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// The backup directory could not be written
    #[error("failed to write {}: {source}", path.display())]
    Io {
        /// Path being written
        path: std::path::PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

/// Non-fatal conditions surfaced to the operator at the end of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowWarning {
    /// The consensus store was still unhealthy once the retry budget ran out
    #[error("{service} is still unhealthy after {attempts} remediation attempt(s)")]
    QuorumUnrecovered {
        /// Statefulset that was remediated
        service: String,
        /// Automated attempts that ran
        attempts: usize,
    },

    /// A workflow step failed but the workflow carried on
    #[error("step `{step}` failed: {detail}")]
    StepFailed {
        /// Step name
        step: String,
        /// What went wrong
        detail: String,
    },
}

impl ClusterError {
    /// Whether the error reports a missing resource.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Execution(e) if e.stderr().is_some_and(|s| s.contains("NotFound") || s.contains("not found")))
    }
}
