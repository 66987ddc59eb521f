//! Check command - one consul health check.

use anyhow::{bail, Result};
use clap::Args;
use viya_restart::{ui, PodHealthInspector};

use super::TargetArgs;

/// Check consul server health.
#[derive(Args, Debug)]
pub struct CheckCommand {
    #[command(flatten)]
    target: TargetArgs,

    /// Label selector to check instead of the consul servers.
    #[arg(short = 'l', long, value_name = "SELECTOR")]
    selector: Option<String>,

    /// Print the result as JSON.
    #[arg(long)]
    json: bool,
}

impl CheckCommand {
    pub async fn run(&self) -> Result<()> {
        let session = self.target.session()?;
        let selector = self
            .selector
            .clone()
            .unwrap_or_else(|| session.config.consul.selector());

        let check = PodHealthInspector::new(&session.cluster)
            .check_health(&selector)
            .await;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&check)?);
        } else {
            ui::print_section(&format!("Health: {selector} in {}", session.namespace));
            ui::print_pod_table(&check.statuses);
            println!();
        }

        if check.all_healthy {
            if !self.json {
                ui::print_success("All pods healthy");
            }
            Ok(())
        } else if check.statuses.is_empty() {
            bail!("No pods found for {selector}")
        } else {
            bail!("Unhealthy pods: {}", check.unhealthy_pods().join(", "))
        }
    }
}
