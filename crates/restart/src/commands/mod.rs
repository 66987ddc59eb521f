//! CLI subcommands.

pub mod backup;
pub mod check;
pub mod ci;
pub mod monitor;
pub mod remediate;
pub mod restart;

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Args;
use tracing::info;
use viya_restart::confirm::ManualInterventionPolicy;
use viya_restart::orchestrator::{RestartOrchestrator, WorkflowContext, WorkflowOutcome};
use viya_restart::{
    ui, AutoApprove, ConfigurationItem, ConfirmationPort, HelperPodRegistry, KubectlCluster,
    ProcessExecutor, RestartConfig, TerminalConfirmation,
};

/// Flags shared by every command that talks to a cluster.
#[derive(Args, Debug, Clone)]
pub struct TargetArgs {
    /// Kubernetes namespace (overrides the configuration item).
    #[arg(short, long, value_name = "NAMESPACE")]
    namespace: Option<String>,

    /// Configuration item, e.g. ABC_SAS_VIYA4_PROD; the namespace is derived from it.
    #[arg(long, value_name = "CI")]
    ci: Option<String>,

    /// JSON configuration file.
    #[arg(short, long, value_name = "FILE", env = "VIYA_CONFIG")]
    config: Option<PathBuf>,

    /// kubeconfig for kubectl.
    #[arg(long, env = "KUBECONFIG", value_name = "FILE")]
    kubeconfig: Option<String>,
}

/// Resolved configuration plus a kubectl handle for the target namespace.
pub struct Session {
    pub config: RestartConfig,
    pub namespace: String,
    pub cluster: KubectlCluster<ProcessExecutor>,
}

impl TargetArgs {
    /// Configuration file, then `VIYA_*` environment, then these flags.
    pub fn load_config(&self) -> Result<RestartConfig> {
        let mut config = RestartConfig::load(self.config.as_deref())?;
        config.apply_env()?;
        if let Some(ci) = &self.ci {
            let item = ConfigurationItem::parse(ci)?;
            info!(ci = %ci, namespace = %item.namespace, "Parsed configuration item");
            config.namespace = Some(item.namespace);
        }
        if let Some(ns) = &self.namespace {
            config.namespace = Some(ns.clone());
        }
        if let Some(path) = &self.kubeconfig {
            config.kubeconfig = Some(path.clone());
        }
        Ok(config)
    }

    /// Load configuration and connect to the namespace.
    pub fn session(&self) -> Result<Session> {
        let config = self.load_config()?;
        let namespace = config.require_namespace()?.to_string();
        let mut cluster = KubectlCluster::new(ProcessExecutor::new(), namespace.clone())
            .with_timeout(config.command_timeout());
        if let Some(path) = &config.kubeconfig {
            cluster = cluster.with_kubeconfig(path.clone());
        }
        Ok(Session {
            config,
            namespace,
            cluster,
        })
    }
}

/// Flags that shape the consul repair loop.
#[derive(Args, Debug, Clone, Default)]
pub struct RemediationArgs {
    /// Answer every confirmation with yes.
    #[arg(short = 'y', long)]
    auto_approve: bool,

    /// Automated remediation attempts after the first failed health check.
    #[arg(long, value_name = "N")]
    max_retries: Option<u32>,

    /// Offer a manual raft log cleanup once automated attempts are used up.
    #[arg(long)]
    manual_intervention: bool,

    /// The manual cleanup uses one of the retry slots.
    #[arg(long, requires = "manual_intervention")]
    manual_counts_against_retries: bool,
}

impl RemediationArgs {
    pub fn apply(&self, config: &mut RestartConfig) {
        if self.auto_approve {
            config.auto_approve = true;
        }
        if let Some(n) = self.max_retries {
            config.max_retries = n;
        }
        if self.manual_intervention {
            config.manual_intervention = ManualInterventionPolicy {
                enabled: true,
                counts_against_retries: self.manual_counts_against_retries,
            };
        }
    }
}

/// Confirmation port for the configured mode.
pub fn confirmation<'a>(
    config: &RestartConfig,
    terminal: &'a TerminalConfirmation,
) -> &'a dyn ConfirmationPort {
    if config.auto_approve {
        &AutoApprove
    } else {
        terminal
    }
}

/// Run the workflow, force-deleting helper pods if the operator interrupts.
pub async fn run_interruptible(
    session: &Session,
    context: &WorkflowContext,
) -> Result<WorkflowOutcome> {
    let registry = HelperPodRegistry::new();
    let executor = ProcessExecutor::new();
    let terminal = TerminalConfirmation::new();
    let orchestrator = RestartOrchestrator::new(
        &session.cluster,
        context,
        confirmation(&session.config, &terminal),
    )
    .with_registry(registry.clone())
    .with_archiver(&executor);

    let outcome = tokio::select! {
        outcome = orchestrator.run() => Some(outcome),
        _ = tokio::signal::ctrl_c() => None,
        () = terminal.interrupted() => None,
    };

    let leftovers = registry.live();
    if !leftovers.is_empty() {
        ui::print_warning(&format!("Removing {} leftover helper pod(s)", leftovers.len()));
        let removed = registry.cleanup(&session.cluster).await;
        if removed < leftovers.len() {
            ui::print_error(&format!(
                "Could not remove: {}",
                registry.live().join(", ")
            ));
        }
    }

    match outcome {
        Some(outcome) => Ok(outcome),
        None => bail!("Interrupted by operator"),
    }
}

/// Print the end-of-run summary.
pub fn print_outcome(outcome: &WorkflowOutcome) {
    ui::print_section("Summary");
    for step in &outcome.steps {
        ui::print_check_result(&step.step, step.success, Some(&step.detail));
    }

    println!();
    ui::print_info(&format!(
        "Health checks: {}, remediation attempts: {}",
        outcome.health_checks,
        outcome.attempts.len()
    ));
    for attempt in &outcome.attempts {
        ui::print_progress(&format!(
            "Attempt {}: {} claim(s) cleaned, {} error(s)",
            attempt.attempt_number + 1,
            attempt.volume_claims_processed.len(),
            attempt.errors.len()
        ));
    }
    if let Some(manual) = &outcome.manual_intervention {
        ui::print_progress(&format!(
            "Manual intervention {}",
            if manual.acknowledged {
                "completed"
            } else {
                "not completed"
            }
        ));
    }

    println!();
    ui::print_comparison_table(&outcome.pre_pods, &outcome.post_pods);

    if !outcome.warnings.is_empty() {
        println!();
        for warning in &outcome.warnings {
            ui::print_warning(warning);
        }
    }

    if let Some(duration) = outcome.duration() {
        println!();
        let secs = duration.as_secs();
        ui::print_info(&format!("Time taken: {} minutes, {} seconds", secs / 60, secs % 60));
    }
}

/// Print `outcome` as text or JSON, failing when consul ended unhealthy.
pub fn report_outcome(outcome: &WorkflowOutcome, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
    } else {
        print_outcome(outcome);
    }

    if outcome.healthy {
        if !json {
            ui::print_success("Workflow completed");
        }
        Ok(())
    } else {
        bail!(
            "Workflow finished without consul quorum ({} warning(s))",
            outcome.warnings.len()
        )
    }
}
