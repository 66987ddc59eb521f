//! SAS Viya 4 environment restart CLI.
//!
//! Restarts a Viya namespace end to end and repairs consul quorum when the
//! servers come back without a leader.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

mod commands;

use commands::backup::BackupCommand;
use commands::check::CheckCommand;
use commands::ci::ParseCiCommand;
use commands::monitor::MonitorCommand;
use commands::remediate::RemediateCommand;
use commands::restart::RestartCommand;

/// SAS Viya 4 environment restart automation.
#[derive(Parser)]
#[command(
    name = "viya-restart",
    version,
    about = "Restart a SAS Viya 4 environment and repair consul quorum",
    long_about = "Restart a SAS Viya 4 environment and repair consul quorum.\n\n\
                  Stops the environment, backs up container logs, deletes finished\n\
                  jobs, starts it again and verifies the consul servers. When they\n\
                  cannot elect a leader, each replica's raft log is removed through\n\
                  a helper pod and health is checked again."
)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write DEBUG logs to this file.
    #[arg(long, global = true, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full restart workflow.
    ///
    /// Stop, back up logs, delete finished jobs, start, verify and repair
    /// consul quorum, then monitor pods until they settle.
    Restart(RestartCommand),

    /// Check consul server health.
    Check(CheckCommand),

    /// Verify consul and reset raft logs if it has no quorum.
    Remediate(RemediateCommand),

    /// Watch pod counts until every pod is running or completed.
    Monitor(MonitorCommand),

    /// Back up container logs.
    Backup(BackupCommand),

    /// Derive namespace, cluster and resource group from a configuration item.
    ParseCi(ParseCiCommand),
}

fn init_tracing(verbose: bool, log_file: Option<&Path>, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("info,viya_restart=debug")
        } else {
            EnvFilter::new("warn,viya_restart=info")
        }
    });

    let console = if json {
        fmt::layer()
            .json()
            .with_target(false)
            .with_filter(filter)
            .boxed()
    } else {
        fmt::layer().with_target(false).with_filter(filter).boxed()
    };

    let file = match log_file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("Failed to create log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(file))
                    .with_filter(LevelFilter::DEBUG),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_file.as_deref(), cli.json_logs)?;

    match cli.command {
        Commands::Restart(cmd) => cmd.run().await,
        Commands::Check(cmd) => cmd.run().await,
        Commands::Remediate(cmd) => cmd.run().await,
        Commands::Monitor(cmd) => cmd.run().await,
        Commands::Backup(cmd) => cmd.run().await,
        Commands::ParseCi(cmd) => cmd.run(),
    }
}
