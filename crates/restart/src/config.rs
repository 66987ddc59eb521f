//! Configuration for a restart run.
//!
//! Values come from an optional JSON file, then `VIYA_*` environment
//! variables, then command-line flags. Every field has a default, so an empty
//! file (or none at all) is a valid configuration.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::backup::{BackupSettings, DEFAULT_MAX_WORKERS};
use crate::confirm::ManualInterventionPolicy;
use crate::lifecycle::LifecycleSettings;
use crate::monitor::MonitorSettings;
use crate::remediation::RemediationSettings;

/// Namespace override.
pub const ENV_NAMESPACE: &str = "VIYA_NAMESPACE";
/// Skip every confirmation prompt.
pub const ENV_AUTO_APPROVE: &str = "VIYA_AUTO_APPROVE";
/// Automated remediation budget.
pub const ENV_MAX_RETRIES: &str = "VIYA_MAX_RETRIES";
/// Image for raft cleanup helper pods.
pub const ENV_HELPER_IMAGE: &str = "VIYA_HELPER_IMAGE";
/// Root directory for log backups.
pub const ENV_BACKUP_DIR: &str = "VIYA_BACKUP_DIR";

/// Default automated remediation budget.
pub const DEFAULT_MAX_RETRIES: u32 = 1;

/// `TLA_<anything>_VIYA4_ENV`, e.g. `ABC_SAS_VIYA4_PROD`.
static CONFIGURATION_ITEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Z]{3})_.*_VIYA4_([A-Z]+)$").expect("configuration item pattern is valid")
});

/// Environment coordinates derived from a configuration item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigurationItem {
    /// Three-letter customer code, lowercase
    pub tla: String,
    /// Environment name, lowercase
    pub environment: String,
    /// Kubernetes namespace, `<tla><env>`
    pub namespace: String,
    /// AKS cluster name, `<tla>-<env>`
    pub aks_cluster: String,
    /// Azure resource group, same as the cluster name
    pub resource_group: String,
}

impl ConfigurationItem {
    /// Parse a configuration item such as `ABC_SAS_VIYA4_PROD`.
    pub fn parse(ci: &str) -> Result<Self> {
        let Some(caps) = CONFIGURATION_ITEM.captures(ci) else {
            bail!("Invalid configuration item format: {ci} (expected TLA_..._VIYA4_ENV)");
        };
        let tla = caps[1].to_lowercase();
        let environment = caps[2].to_lowercase();
        let aks_cluster = format!("{tla}-{environment}");
        Ok(Self {
            namespace: format!("{tla}{environment}"),
            resource_group: aks_cluster.clone(),
            aks_cluster,
            tla,
            environment,
        })
    }
}

/// The consul server statefulset and its data volumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsulConfig {
    /// Statefulset name
    pub statefulset: String,
    /// Replica count to restore after remediation
    pub replicas: u32,
    /// Prefix of the per-replica claim; the ordinal is appended
    pub claim_prefix: String,
    /// Explicit claim names, overriding `claim_prefix`
    pub claims: Vec<String>,
    /// Seconds to wait for replicas to terminate
    pub termination_timeout_secs: u64,
    /// Polls before giving up on a helper pod
    pub helper_attempts: u32,
    /// Seconds between helper pod polls
    pub helper_interval_secs: u64,
    /// Seconds to wait after scaling back up
    pub settle_secs: u64,
    /// Helper pod image
    pub helper_image: String,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        let remediation = RemediationSettings::default();
        Self {
            statefulset: "sas-consul-server".to_string(),
            replicas: 3,
            claim_prefix: "sas-viya-consul-data-volume-sas-consul-server-".to_string(),
            claims: Vec::new(),
            termination_timeout_secs: remediation.termination_timeout.as_secs(),
            helper_attempts: remediation.helper_attempts,
            helper_interval_secs: remediation.helper_interval.as_secs(),
            settle_secs: remediation.settle_period.as_secs(),
            helper_image: remediation.helper_image,
        }
    }
}

impl ConsulConfig {
    /// Claim names in replica order.
    #[must_use]
    pub fn claim_names(&self) -> Vec<String> {
        if !self.claims.is_empty() {
            return self.claims.clone();
        }
        (0..self.replicas)
            .map(|i| format!("{}{i}", self.claim_prefix))
            .collect()
    }

    /// Label selector for the replicas.
    #[must_use]
    pub fn selector(&self) -> String {
        crate::remediation::service_selector(&self.statefulset)
    }

    /// Remediation timing.
    #[must_use]
    pub fn remediation_settings(&self) -> RemediationSettings {
        RemediationSettings {
            termination_timeout: Duration::from_secs(self.termination_timeout_secs),
            helper_attempts: self.helper_attempts,
            helper_interval: Duration::from_secs(self.helper_interval_secs),
            settle_period: Duration::from_secs(self.settle_secs),
            helper_image: self.helper_image.clone(),
            ..RemediationSettings::default()
        }
    }
}

/// Which workflow steps run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepToggles {
    pub stop: bool,
    pub backup: bool,
    pub delete_jobs: bool,
    pub start: bool,
    pub monitor: bool,
}

impl Default for StepToggles {
    fn default() -> Self {
        Self {
            stop: true,
            backup: true,
            delete_jobs: true,
            start: true,
            monitor: true,
        }
    }
}

/// Log backup options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Root directory
    pub dir: PathBuf,
    /// Concurrent `kubectl logs` calls
    pub max_workers: usize,
    /// Archive the backup with `tar`
    pub archive: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: BackupSettings::default().root,
            max_workers: DEFAULT_MAX_WORKERS,
            archive: true,
        }
    }
}

/// Stop/start job timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub job_timeout_secs: u64,
    pub job_interval_secs: u64,
    pub start_settle_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        let settings = LifecycleSettings::default();
        Self {
            job_timeout_secs: settings.job_timeout.as_secs(),
            job_interval_secs: settings.job_interval.as_secs(),
            start_settle_secs: settings.start_settle.as_secs(),
        }
    }
}

/// Final pod monitoring bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        let settings = MonitorSettings::default();
        Self {
            interval_secs: settings.interval.as_secs(),
            timeout_secs: settings.timeout.as_secs(),
        }
    }
}

/// Everything a restart run can be configured with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    /// Target namespace
    pub namespace: Option<String>,
    /// kubeconfig passed to kubectl
    pub kubeconfig: Option<String>,
    /// Answer every confirmation with yes
    pub auto_approve: bool,
    /// Automated remediation attempts after the first failed health check
    pub max_retries: u32,
    /// Per-kubectl-call timeout in seconds
    pub command_timeout_secs: u64,
    pub consul: ConsulConfig,
    pub manual_intervention: ManualInterventionPolicy,
    pub steps: StepToggles,
    pub backup: BackupConfig,
    pub lifecycle: LifecycleConfig,
    pub monitor: MonitorConfig,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            kubeconfig: None,
            auto_approve: false,
            max_retries: DEFAULT_MAX_RETRIES,
            command_timeout_secs: crate::executor::DEFAULT_COMMAND_TIMEOUT.as_secs(),
            consul: ConsulConfig::default(),
            manual_intervention: ManualInterventionPolicy::default(),
            steps: StepToggles::default(),
            backup: BackupConfig::default(),
            lifecycle: LifecycleConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl RestartConfig {
    /// Load from a JSON file, or defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Apply `VIYA_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, keyed by environment variable name.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ns) = lookup(ENV_NAMESPACE).filter(|v| !v.trim().is_empty()) {
            self.namespace = Some(ns.trim().to_string());
        }
        if let Some(raw) = lookup(ENV_AUTO_APPROVE) {
            self.auto_approve = parse_bool(&raw)
                .with_context(|| format!("{ENV_AUTO_APPROVE} must be a boolean, got {raw:?}"))?;
        }
        if let Some(raw) = lookup(ENV_MAX_RETRIES) {
            self.max_retries = raw
                .trim()
                .parse()
                .with_context(|| format!("{ENV_MAX_RETRIES} must be a non-negative integer, got {raw:?}"))?;
        }
        if let Some(image) = lookup(ENV_HELPER_IMAGE).filter(|v| !v.trim().is_empty()) {
            self.consul.helper_image = image;
        }
        if let Some(dir) = lookup(ENV_BACKUP_DIR).filter(|v| !v.trim().is_empty()) {
            self.backup.dir = PathBuf::from(dir);
        }
        Ok(())
    }

    /// Namespace to operate on; an error if none was configured.
    pub fn require_namespace(&self) -> Result<&str> {
        self.namespace
            .as_deref()
            .context("No namespace configured; pass --namespace, a configuration item, or set VIYA_NAMESPACE")
    }

    /// kubectl call timeout.
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Lifecycle job timing.
    #[must_use]
    pub fn lifecycle_settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            job_timeout: Duration::from_secs(self.lifecycle.job_timeout_secs),
            job_interval: Duration::from_secs(self.lifecycle.job_interval_secs),
            start_settle: Duration::from_secs(self.lifecycle.start_settle_secs),
        }
    }

    /// Monitor bounds.
    #[must_use]
    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            interval: Duration::from_secs(self.monitor.interval_secs),
            timeout: Duration::from_secs(self.monitor.timeout_secs),
        }
    }

    /// Backup location and parallelism.
    #[must_use]
    pub fn backup_settings(&self) -> BackupSettings {
        BackupSettings {
            root: self.backup.dir.clone(),
            max_workers: self.backup.max_workers,
            archive: self.backup.archive,
        }
    }
}
