//! Remediate command - consul check and repair only.

use anyhow::Result;
use clap::Args;
use viya_restart::orchestrator::WorkflowContext;
use viya_restart::ui;

use super::{report_outcome, run_interruptible, RemediationArgs, TargetArgs};

/// Verify consul and reset raft logs if it has no quorum.
#[derive(Args, Debug)]
pub struct RemediateCommand {
    #[command(flatten)]
    target: TargetArgs,

    #[command(flatten)]
    remediation: RemediationArgs,

    /// Print the outcome as JSON.
    #[arg(long)]
    json: bool,
}

impl RemediateCommand {
    pub async fn run(&self) -> Result<()> {
        let mut session = self.target.session()?;
        self.remediation.apply(&mut session.config);
        let context =
            WorkflowContext::from_config(&session.config, &session.namespace, None).quorum_only();

        if !self.json {
            ui::print_section(&format!("Consul quorum remediation: {}", context.namespace));
        }

        let outcome = run_interruptible(&session, &context).await?;
        report_outcome(&outcome, self.json)
    }
}
