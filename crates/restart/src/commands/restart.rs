//! Restart command - the full workflow.

use anyhow::Result;
use clap::Args;
use viya_restart::orchestrator::WorkflowContext;
use viya_restart::ui;

use super::{report_outcome, run_interruptible, RemediationArgs, TargetArgs};

/// Run the full restart workflow.
#[derive(Args, Debug)]
pub struct RestartCommand {
    /// Ticket number; names the backup directory.
    #[arg(value_name = "TICKET")]
    ticket: Option<String>,

    #[command(flatten)]
    target: TargetArgs,

    #[command(flatten)]
    remediation: RemediationArgs,

    /// Do not stop the environment first.
    #[arg(long)]
    skip_stop: bool,

    /// Do not back up container logs.
    #[arg(long)]
    skip_backup: bool,

    /// Do not delete finished jobs.
    #[arg(long)]
    skip_delete_jobs: bool,

    /// Do not start the environment.
    #[arg(long)]
    skip_start: bool,

    /// Do not monitor pods at the end.
    #[arg(long)]
    skip_monitor: bool,

    /// Print the outcome as JSON.
    #[arg(long)]
    json: bool,
}

impl RestartCommand {
    pub async fn run(&self) -> Result<()> {
        let mut session = self.target.session()?;
        self.remediation.apply(&mut session.config);
        let steps = &mut session.config.steps;
        steps.stop &= !self.skip_stop;
        steps.backup &= !self.skip_backup;
        steps.delete_jobs &= !self.skip_delete_jobs;
        steps.start &= !self.skip_start;
        steps.monitor &= !self.skip_monitor;

        let context =
            WorkflowContext::from_config(&session.config, &session.namespace, self.ticket.as_deref());

        if !self.json {
            ui::print_section("SAS Viya 4 Environment Restart");
            ui::print_info(&format!("Namespace: {}", context.namespace));
            ui::print_info(&format!("Ticket: {}", context.ticket));
            ui::print_info(&format!(
                "Consul: {} ({} replicas, max retries {})",
                context.consul.statefulset, context.consul.replicas, context.max_retries
            ));
        }

        let outcome = run_interruptible(&session, &context).await?;
        report_outcome(&outcome, self.json)
    }
}
