//! Parse-CI command.

use anyhow::Result;
use clap::Args;
use viya_restart::{ui, ConfigurationItem};

/// Derive namespace, cluster and resource group from a configuration item.
#[derive(Args, Debug)]
pub struct ParseCiCommand {
    /// Configuration item, e.g. ABC_SAS_VIYA4_PROD.
    #[arg(value_name = "CI")]
    ci: String,

    /// Print the result as JSON.
    #[arg(long)]
    json: bool,
}

impl ParseCiCommand {
    pub fn run(&self) -> Result<()> {
        let item = ConfigurationItem::parse(&self.ci)?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&item)?);
        } else {
            ui::print_success("Environment variables initialized");
            ui::print_progress(&format!("NS: {}", item.namespace));
            ui::print_progress(&format!("AKSN: {}", item.aks_cluster));
            ui::print_progress(&format!("RGN: {}", item.resource_group));
        }
        Ok(())
    }
}
