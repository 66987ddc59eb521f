//! Backup command - container logs only.

use anyhow::{Context, Result};
use clap::Args;
use viya_restart::backup::LogBackup;
use viya_restart::orchestrator::DEFAULT_TICKET;
use viya_restart::{ui, ProcessExecutor};

use super::TargetArgs;

/// Back up container logs of every running pod.
#[derive(Args, Debug)]
pub struct BackupCommand {
    /// Ticket number; names the backup directory.
    #[arg(value_name = "TICKET")]
    ticket: Option<String>,

    #[command(flatten)]
    target: TargetArgs,

    /// Concurrent `kubectl logs` calls.
    #[arg(long, value_name = "N")]
    max_workers: Option<usize>,

    /// Leave the logs unarchived.
    #[arg(long)]
    no_archive: bool,

    /// Print the report as JSON.
    #[arg(long)]
    json: bool,
}

impl BackupCommand {
    pub async fn run(&self) -> Result<()> {
        let session = self.target.session()?;
        let mut settings = session.config.backup_settings();
        if let Some(n) = self.max_workers {
            settings.max_workers = n;
        }
        if self.no_archive {
            settings.archive = false;
        }
        let ticket = self.ticket.as_deref().unwrap_or(DEFAULT_TICKET);

        if !self.json {
            ui::print_section(&format!("Log backup: {} ({ticket})", session.namespace));
        }

        let executor = ProcessExecutor::new();
        let backup = LogBackup::new(&session.cluster, settings).with_archiver(&executor);
        let report = backup.run(ticket).await.context("Log backup failed")?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }

        for pod in &report.pods {
            println!();
            ui::print_step(&format!("Backing up logs for {}", pod.pod));
            for log in &pod.containers {
                let label = if log.init {
                    format!("{} (init)", log.container)
                } else {
                    log.container.clone()
                };
                ui::print_check_result(&label, log.collected, log.error.as_deref());
            }
        }
        println!();
        ui::print_success(&format!(
            "{} container log(s) written to {}",
            report.collected(),
            report.directory.display()
        ));
        ui::print_info(&format!(
            "Time taken: {} minutes, {} seconds",
            report.elapsed_secs / 60,
            report.elapsed_secs % 60
        ));
        Ok(())
    }
}
