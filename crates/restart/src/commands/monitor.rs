//! Monitor command - watch pods settle.

use std::time::Duration;

use anyhow::{bail, Result};
use clap::Args;
use viya_restart::monitor::PodMonitor;
use viya_restart::ui;

use super::TargetArgs;

/// Watch pod counts until every pod is running or completed.
#[derive(Args, Debug)]
pub struct MonitorCommand {
    #[command(flatten)]
    target: TargetArgs,

    /// Seconds between passes.
    #[arg(long, value_name = "SECS")]
    interval: Option<u64>,

    /// Give up after this many seconds.
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Print the summary as JSON.
    #[arg(long)]
    json: bool,
}

impl MonitorCommand {
    pub async fn run(&self) -> Result<()> {
        let session = self.target.session()?;
        let mut settings = session.config.monitor_settings();
        if let Some(secs) = self.interval {
            settings.interval = Duration::from_secs(secs);
        }
        if let Some(secs) = self.timeout {
            settings.timeout = Duration::from_secs(secs);
        }

        if !self.json {
            ui::print_section(&format!("Pod monitoring: {}", session.namespace));
            ui::print_info("Press Ctrl+C to stop monitoring");
        }

        let monitor = PodMonitor::new(&session.cluster, settings);
        let summary = tokio::select! {
            summary = monitor.run() => summary,
            _ = tokio::signal::ctrl_c() => {
                ui::print_warning("Monitoring stopped by user");
                return Ok(());
            }
        };

        if self.json {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        } else {
            println!();
            ui::print_info(&format!(
                "Time taken: {} minutes, {} seconds",
                summary.elapsed_secs / 60,
                summary.elapsed_secs % 60
            ));
        }

        if summary.settled {
            if !self.json {
                ui::print_success("All pods are Running or Completed");
            }
            Ok(())
        } else {
            bail!(
                "Pods had not settled after {} pass(es)",
                summary.iterations
            )
        }
    }
}
