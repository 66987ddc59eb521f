//! The restart workflow.
//!
//! Stop the environment, back up logs, clear finished jobs, start it again,
//! then make sure consul has quorum. When it does not, the raft logs are reset
//! and health is checked again, a bounded number of times. Pod monitoring
//! runs last regardless of how the consul check ended.
//!
//! Nothing here aborts the workflow. Step failures become [`StepRecord`]s and
//! warnings so that an operator in the middle of an outage always gets to
//! the end with a summary.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::backup::{BackupReport, BackupSettings, LogBackup};
use crate::cluster::ClusterApi;
use crate::config::{RestartConfig, StepToggles};
use crate::confirm::{
    ConfirmationPort, ManualInterventionPolicy, ManualInterventionRecord,
    ManualInterventionRequest,
};
use crate::error::WorkflowWarning;
use crate::executor::CommandExecutor;
use crate::health::{HealthCheck, PodHealthInspector, PodStatus};
use crate::lifecycle::{EnvironmentLifecycle, LifecycleSettings};
use crate::monitor::{MonitorSettings, MonitorSummary, PodMonitor};
use crate::remediation::{
    service_selector, HelperPodRegistry, QuorumRemediator, RemediationAttempt,
    RemediationSettings,
};
use crate::ui;

/// Ticket used for backups when none is given.
pub const DEFAULT_TICKET: &str = "adhoc";

/// The consensus store being verified and repaired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsulTarget {
    /// Statefulset name
    pub statefulset: String,
    /// Label selector for its pods
    pub selector: String,
    /// Replica count to restore
    pub replicas: u32,
    /// Data volume claims, in replica order
    pub claims: Vec<String>,
}

impl ConsulTarget {
    /// Target `statefulset` with `replicas` claims named `<prefix><ordinal>`.
    pub fn new(statefulset: &str, replicas: u32, claim_prefix: &str) -> Self {
        Self {
            statefulset: statefulset.to_string(),
            selector: service_selector(statefulset),
            replicas,
            claims: (0..replicas).map(|i| format!("{claim_prefix}{i}")).collect(),
        }
    }
}

/// Everything one workflow run needs, passed explicitly to every step.
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    pub namespace: String,
    pub ticket: String,
    pub consul: ConsulTarget,
    /// Automated remediation attempts allowed after the first failed check
    pub max_retries: u32,
    pub manual_intervention: ManualInterventionPolicy,
    pub steps: StepToggles,
    pub remediation: RemediationSettings,
    pub lifecycle: LifecycleSettings,
    pub backup: BackupSettings,
    pub monitor: MonitorSettings,
}

impl WorkflowContext {
    /// Build a context from loaded configuration.
    pub fn from_config(config: &RestartConfig, namespace: &str, ticket: Option<&str>) -> Self {
        Self {
            namespace: namespace.to_string(),
            ticket: ticket.unwrap_or(DEFAULT_TICKET).to_string(),
            consul: ConsulTarget {
                statefulset: config.consul.statefulset.clone(),
                selector: config.consul.selector(),
                replicas: config.consul.replicas,
                claims: config.consul.claim_names(),
            },
            max_retries: config.max_retries,
            manual_intervention: config.manual_intervention,
            steps: config.steps,
            remediation: config.consul.remediation_settings(),
            lifecycle: config.lifecycle_settings(),
            backup: config.backup_settings(),
            monitor: config.monitor_settings(),
        }
    }

    /// Only the consul check and repair loop; every other step off.
    #[must_use]
    pub fn quorum_only(mut self) -> Self {
        self.steps = StepToggles {
            stop: false,
            backup: false,
            delete_jobs: false,
            start: false,
            monitor: false,
        };
        self
    }
}

/// Where the workflow is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkflowState {
    Stopping,
    Stopped,
    BackingUp,
    DeletingJobs,
    Starting,
    HealthChecking,
    Remediating,
    ManualInterventionRequested,
    Healthy,
    Monitoring,
    Done { healthy: bool },
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopping => f.write_str("stopping"),
            Self::Stopped => f.write_str("stopped"),
            Self::BackingUp => f.write_str("backing-up"),
            Self::DeletingJobs => f.write_str("deleting-jobs"),
            Self::Starting => f.write_str("starting"),
            Self::HealthChecking => f.write_str("health-checking"),
            Self::Remediating => f.write_str("remediating"),
            Self::ManualInterventionRequested => f.write_str("manual-intervention-requested"),
            Self::Healthy => f.write_str("healthy"),
            Self::Monitoring => f.write_str("monitoring"),
            Self::Done { healthy: true } => f.write_str("done(healthy)"),
            Self::Done { healthy: false } => f.write_str("done(unhealthy)"),
        }
    }
}

/// One workflow step and how it went.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRecord {
    pub step: String,
    pub success: bool,
    pub detail: String,
}

/// Everything a workflow run produced.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowOutcome {
    pub namespace: String,
    /// Consul ended healthy
    pub healthy: bool,
    /// Automated remediation attempts, in order
    pub attempts: Vec<RemediationAttempt>,
    /// Statuses from the first health check
    pub pre_pods: Vec<PodStatus>,
    /// Statuses from the last health check
    pub post_pods: Vec<PodStatus>,
    /// Health checks performed
    pub health_checks: u32,
    pub steps: Vec<StepRecord>,
    pub manual_intervention: Option<ManualInterventionRecord>,
    pub backup: Option<BackupReport>,
    pub monitor: Option<MonitorSummary>,
    /// States entered, in order
    pub states: Vec<WorkflowState>,
    pub warnings: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowOutcome {
    fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            healthy: false,
            attempts: Vec::new(),
            pre_pods: Vec::new(),
            post_pods: Vec::new(),
            health_checks: 0,
            steps: Vec::new(),
            manual_intervention: None,
            backup: None,
            monitor: None,
            states: Vec::new(),
            warnings: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    fn enter(&mut self, state: WorkflowState) {
        info!(namespace = %self.namespace, %state, "Workflow state");
        self.states.push(state);
    }

    fn record(&mut self, step: &str, result: Result<String, String>) {
        let record = match result {
            Ok(detail) => {
                ui::print_success(&detail);
                StepRecord {
                    step: step.to_string(),
                    success: true,
                    detail,
                }
            }
            Err(detail) => {
                ui::print_error(&detail);
                self.warn(WorkflowWarning::StepFailed {
                    step: step.to_string(),
                    detail: detail.clone(),
                });
                StepRecord {
                    step: step.to_string(),
                    success: false,
                    detail,
                }
            }
        };
        self.steps.push(record);
    }

    fn warn(&mut self, warning: WorkflowWarning) {
        warn!(namespace = %self.namespace, %warning, "Workflow warning");
        self.warnings.push(warning.to_string());
    }

    fn observe(&mut self, check: &HealthCheck) {
        if self.health_checks == 0 {
            self.pre_pods.clone_from(&check.statuses);
        }
        self.health_checks += 1;
        self.post_pods.clone_from(&check.statuses);
        self.healthy = check.all_healthy;
    }

    /// Elapsed time, once finished.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        self.finished_at
            .and_then(|end| (end - self.started_at).to_std().ok())
    }
}

/// Runs the restart workflow against one namespace.
pub struct RestartOrchestrator<'a, C: ?Sized> {
    cluster: &'a C,
    context: &'a WorkflowContext,
    confirm: &'a dyn ConfirmationPort,
    registry: HelperPodRegistry,
    archiver: Option<&'a dyn CommandExecutor>,
}

impl<'a, C: ClusterApi + ?Sized> RestartOrchestrator<'a, C> {
    pub fn new(
        cluster: &'a C,
        context: &'a WorkflowContext,
        confirm: &'a dyn ConfirmationPort,
    ) -> Self {
        Self {
            cluster,
            context,
            confirm,
            registry: HelperPodRegistry::new(),
            archiver: None,
        }
    }

    /// Share a helper pod registry with the caller.
    #[must_use]
    pub fn with_registry(mut self, registry: HelperPodRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Archive log backups through `executor`.
    #[must_use]
    pub fn with_archiver(mut self, executor: &'a dyn CommandExecutor) -> Self {
        self.archiver = Some(executor);
        self
    }

    fn total_steps(&self) -> u8 {
        let steps = self.context.steps;
        let enabled = [
            steps.stop,
            steps.backup,
            steps.delete_jobs,
            steps.start,
            true,
            steps.monitor,
        ];
        enabled.iter().filter(|on| **on).count() as u8
    }

    /// Run every enabled step and return what happened.
    pub async fn run(&self) -> WorkflowOutcome {
        let ctx = self.context;
        let mut outcome = WorkflowOutcome::new(&ctx.namespace);
        let total = self.total_steps();
        let mut current = 0u8;
        let mut next_step = |message: &str| {
            current += 1;
            ui::print_progress_step(current, total, message);
        };
        let lifecycle = EnvironmentLifecycle::new(self.cluster, ctx.lifecycle.clone());

        if ctx.steps.stop {
            next_step("Stopping environment");
            outcome.enter(WorkflowState::Stopping);
            let result = lifecycle
                .stop()
                .await
                .map(|job| format!("Environment stopped by job {job}"))
                .map_err(|e| format!("Stop failed: {e}"));
            outcome.record("stop", result);
            outcome.enter(WorkflowState::Stopped);
        }

        if ctx.steps.backup {
            next_step("Backing up container logs");
            outcome.enter(WorkflowState::BackingUp);
            let mut backup = LogBackup::new(self.cluster, ctx.backup.clone());
            if let Some(archiver) = self.archiver {
                backup = backup.with_archiver(archiver);
            }
            match backup.run(&ctx.ticket).await {
                Ok(report) => {
                    outcome.record(
                        "backup",
                        Ok(format!(
                            "Backed up {} container log(s) to {}",
                            report.collected(),
                            report.directory.display()
                        )),
                    );
                    outcome.backup = Some(report);
                }
                Err(e) => outcome.record("backup", Err(format!("Backup failed: {e}"))),
            }
        }

        if ctx.steps.delete_jobs {
            next_step("Deleting finished jobs");
            outcome.enter(WorkflowState::DeletingJobs);
            let result = match lifecycle.delete_finished_jobs().await {
                Ok(cleanup) if cleanup.failed.is_empty() => {
                    Ok(format!("Deleted {} finished job(s)", cleanup.deleted.len()))
                }
                Ok(cleanup) => Err(format!(
                    "Could not delete job(s): {}",
                    cleanup.failed.join(", ")
                )),
                Err(e) => Err(format!("Listing jobs failed: {e}")),
            };
            outcome.record("delete-jobs", result);
        }

        if ctx.steps.start {
            next_step("Starting environment");
            outcome.enter(WorkflowState::Starting);
            let result = lifecycle
                .start()
                .await
                .map(|job| format!("Environment started by job {job}"))
                .map_err(|e| format!("Start failed: {e}"));
            outcome.record("start", result);
        }

        next_step(&format!("Verifying {} quorum", ctx.consul.statefulset));
        self.recover_quorum(&mut outcome).await;
        let quorum = if outcome.healthy {
            Ok(format!("{} is healthy", ctx.consul.statefulset))
        } else {
            Err(format!("{} is unhealthy", ctx.consul.statefulset))
        };
        outcome.steps.push(StepRecord {
            step: "quorum".to_string(),
            success: quorum.is_ok(),
            detail: quorum.unwrap_or_else(|e| e),
        });

        if ctx.steps.monitor {
            next_step("Monitoring pods");
            outcome.enter(WorkflowState::Monitoring);
            let summary = PodMonitor::new(self.cluster, ctx.monitor.clone()).run().await;
            let result = if summary.settled {
                Ok(format!(
                    "All {} pods running or completed",
                    summary.final_counts.total
                ))
            } else {
                Err(format!(
                    "Pods had not settled after {} pass(es)",
                    summary.iterations
                ))
            };
            outcome.record("monitor", result);
            outcome.monitor = Some(summary);
        }

        outcome.enter(WorkflowState::Done {
            healthy: outcome.healthy,
        });
        outcome.finished_at = Some(Utc::now());
        outcome
    }

    /// Health check, remediate, check again, within the retry budget, then
    /// the manual step if it is enabled.
    pub async fn recover_quorum(&self, outcome: &mut WorkflowOutcome) {
        let ctx = self.context;
        let consul = &ctx.consul;
        let inspector = PodHealthInspector::new(self.cluster);
        let remediator = QuorumRemediator::new(self.cluster, ctx.remediation.clone())
            .with_registry(self.registry.clone());
        let policy = ctx.manual_intervention;
        let slots = policy.automated_slots(ctx.max_retries);

        loop {
            outcome.enter(WorkflowState::HealthChecking);
            let check = inspector.check_health(&consul.selector).await;
            outcome.observe(&check);
            ui::print_pod_table(&check.statuses);

            if check.all_healthy {
                outcome.enter(WorkflowState::Healthy);
                ui::print_success(&format!("{} has quorum", consul.statefulset));
                return;
            }

            let attempts = outcome.attempts.len() as u32;
            if attempts >= slots {
                break;
            }

            let prompt = format!(
                "{} in {} is unhealthy. Reset raft logs (attempt {} of {})?",
                consul.statefulset,
                ctx.namespace,
                attempts + 1,
                slots
            );
            if !self.confirm.confirm(&prompt) {
                ui::print_warning("Remediation declined");
                info!(namespace = %ctx.namespace, "Operator declined remediation");
                break;
            }

            outcome.enter(WorkflowState::Remediating);
            let attempt = remediator
                .remediate(&consul.statefulset, consul.replicas, &consul.claims)
                .await;
            outcome.attempts.push(attempt);
        }

        if policy.allows_manual(ctx.max_retries) {
            self.manual_intervention(outcome, &inspector).await;
        }

        if !outcome.healthy {
            let warning = WorkflowWarning::QuorumUnrecovered {
                service: consul.statefulset.clone(),
                attempts: outcome.attempts.len(),
            };
            ui::print_warning(&warning.to_string());
            outcome.warn(warning);
        }
    }

    async fn manual_intervention(
        &self,
        outcome: &mut WorkflowOutcome,
        inspector: &PodHealthInspector<'_, C>,
    ) {
        let ctx = self.context;
        outcome.enter(WorkflowState::ManualInterventionRequested);
        let request = ManualInterventionRequest {
            namespace: ctx.namespace.clone(),
            service: ctx.consul.statefulset.clone(),
            volume_claims: ctx.consul.claims.clone(),
        };
        ui::print_warning("Automated remediation did not restore quorum; manual cleanup requested");
        let acknowledged = self.confirm.acknowledge_manual(&request);
        outcome.manual_intervention = Some(ManualInterventionRecord {
            request,
            acknowledged,
            counted_against_retries: ctx.manual_intervention.counts_against_retries,
        });

        if acknowledged {
            outcome.enter(WorkflowState::HealthChecking);
            let check = inspector.check_health(&ctx.consul.selector).await;
            outcome.observe(&check);
            ui::print_pod_table(&check.statuses);
            if check.all_healthy {
                outcome.enter(WorkflowState::Healthy);
            }
        }
    }
}

/// Run the full restart workflow with default wiring.
pub async fn run_restart_workflow<C: ClusterApi + ?Sized>(
    cluster: &C,
    context: &WorkflowContext,
    confirm: &dyn ConfirmationPort,
) -> WorkflowOutcome {
    RestartOrchestrator::new(cluster, context, confirm).run().await
}
