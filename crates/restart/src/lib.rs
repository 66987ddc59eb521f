//! SAS Viya 4 environment restart library.
//!
//! Stops and starts a Viya 4 namespace, backs up container logs, and repairs
//! a consul server set that lost quorum by resetting each replica's raft log
//! through short-lived helper pods. All cluster access goes through
//! `kubectl` behind the [`ClusterApi`] trait.
//!
//! # Example
//!
//! ```ignore
//! use viya_restart::{
//!     run_restart_workflow, AutoApprove, KubectlCluster, ProcessExecutor, RestartConfig,
//!     WorkflowContext,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RestartConfig::default();
//!     let cluster = KubectlCluster::new(ProcessExecutor::new(), "abcprod");
//!     let context = WorkflowContext::from_config(&config, "abcprod", Some("ABC-123"));
//!     let outcome = run_restart_workflow(&cluster, &context, &AutoApprove).await;
//!     println!("healthy: {}", outcome.healthy);
//!     Ok(())
//! }
//! ```

pub mod backup;
pub mod cluster;
pub mod config;
pub mod confirm;
pub mod error;
pub mod executor;
pub mod health;
pub mod lifecycle;
pub mod monitor;
pub mod orchestrator;
pub mod remediation;
pub mod ui;
pub mod wait;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types at the crate root
pub use cluster::{ClusterApi, KubectlCluster};
pub use config::{ConfigurationItem, RestartConfig};
pub use confirm::{AutoApprove, ConfirmationPort, TerminalConfirmation};
pub use error::{ClusterError, ExecutionError, WorkflowWarning};
pub use executor::{ClusterCommand, CommandExecutor, CommandResult, ProcessExecutor};
pub use health::{HealthCheck, PodHealthInspector, PodStatus};
pub use orchestrator::{run_restart_workflow, RestartOrchestrator, WorkflowContext, WorkflowOutcome};
pub use remediation::{HelperPodRegistry, QuorumRemediator, RemediationAttempt};
