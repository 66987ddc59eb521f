//! Namespace-wide pod monitoring after a restart.

use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cluster::ClusterApi;
use crate::health::{PodPhase, PodStatus, TerminalReason};
use crate::ui;
use crate::wait::max_attempts;

/// Summary counts for one monitoring pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PodCounts {
    /// Every pod in the namespace
    pub total: u32,
    /// Running with every container ready
    pub running: u32,
    /// At least one container in `CrashLoopBackOff`
    pub crash_loop: u32,
    /// Anything else that is neither running nor completed
    pub error: u32,
    /// Pods that ran to completion
    pub completed: u32,
}

impl PodCounts {
    /// Bucket every pod into exactly one column.
    #[must_use]
    pub fn from_pods(pods: &[Pod]) -> Self {
        let mut counts = Self {
            total: pods.len() as u32,
            ..Self::default()
        };
        for pod in pods {
            let status = PodStatus::from_pod(pod);
            if status.phase == PodPhase::Succeeded {
                counts.completed += 1;
                continue;
            }
            match status.terminal_reason {
                Some(TerminalReason::CrashLoopBackOff) => counts.crash_loop += 1,
                Some(TerminalReason::Error) => counts.error += 1,
                None if status.is_healthy() => counts.running += 1,
                None => counts.error += 1,
            }
        }
        counts
    }

    /// Every pod is running or completed.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.total > 0 && self.running + self.completed == self.total
    }
}

/// Polling bounds for the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSettings {
    /// Time between passes
    pub interval: Duration,
    /// Give up after this long
    pub timeout: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(1800),
        }
    }
}

/// How monitoring ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MonitorSummary {
    /// Passes made
    pub iterations: u32,
    /// Every pod reached Running or Completed
    pub settled: bool,
    /// Counts from the last pass
    pub final_counts: PodCounts,
    /// Wall-clock seconds spent monitoring
    pub elapsed_secs: u64,
}

/// Polls every pod in the namespace until they settle or time runs out.
pub struct PodMonitor<'a, C: ?Sized> {
    cluster: &'a C,
    settings: MonitorSettings,
}

impl<'a, C: ClusterApi + ?Sized> PodMonitor<'a, C> {
    pub fn new(cluster: &'a C, settings: MonitorSettings) -> Self {
        Self { cluster, settings }
    }

    /// Count pods once. A failed listing counts as zero pods.
    pub async fn sample(&self) -> PodCounts {
        match self.cluster.list_pods("").await {
            Ok(pods) => PodCounts::from_pods(&pods),
            Err(e) => {
                warn!(namespace = self.cluster.namespace(), error = %e, "Failed to fetch pod statuses");
                PodCounts::default()
            }
        }
    }

    /// Poll until settled or timed out, printing a row per pass.
    pub async fn run(&self) -> MonitorSummary {
        let started = Instant::now();
        let attempts = max_attempts(self.settings.timeout, self.settings.interval);
        let mut summary = MonitorSummary {
            iterations: 0,
            settled: false,
            final_counts: PodCounts::default(),
            elapsed_secs: 0,
        };

        for iteration in 1..=attempts {
            let counts = self.sample().await;
            ui::print_monitor_row(iteration, &counts);
            debug!(
                iteration,
                total = counts.total,
                running = counts.running,
                crash_loop = counts.crash_loop,
                error = counts.error,
                completed = counts.completed,
                "Monitor pass"
            );
            summary.iterations = iteration;
            summary.final_counts = counts;
            if counts.is_settled() {
                summary.settled = true;
                break;
            }
            if iteration < attempts {
                tokio::time::sleep(self.settings.interval).await;
            }
        }

        summary.elapsed_secs = started.elapsed().as_secs();
        info!(
            iterations = summary.iterations,
            settled = summary.settled,
            elapsed_secs = summary.elapsed_secs,
            "Pod monitoring finished"
        );
        summary
    }
}
