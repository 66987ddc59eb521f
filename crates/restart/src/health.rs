//! Pod health classification.
//!
//! A pod is healthy when it is `Running`, every container reports ready and
//! no container is crash-looping or has terminated with a non-zero exit code.

use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use serde::Serialize;
use tracing::{debug, warn};

use crate::cluster::ClusterApi;

/// Container waiting reason that marks a crash loop.
pub const CRASH_LOOP_BACK_OFF: &str = "CrashLoopBackOff";

/// Top-level pod phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    /// Parse the `status.phase` field. Anything unrecognized is `Unknown`.
    #[must_use]
    pub fn parse(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") => Self::Pending,
            Some("Running") => Self::Running,
            Some("Succeeded") => Self::Succeeded,
            Some("Failed") => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for PodPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Why a container is considered broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TerminalReason {
    /// A container is waiting in `CrashLoopBackOff`
    CrashLoopBackOff,
    /// A container terminated with a non-zero exit code
    Error,
}

impl std::fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CrashLoopBackOff => f.write_str(CRASH_LOOP_BACK_OFF),
            Self::Error => f.write_str("Error"),
        }
    }
}

/// Snapshot of one pod's health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PodStatus {
    /// Pod name
    pub name: String,
    /// Containers reporting ready
    pub ready_containers: u32,
    /// Containers with a status entry
    pub total_containers: u32,
    /// Top-level phase
    pub phase: PodPhase,
    /// Crash loop or error exit, if any
    pub terminal_reason: Option<TerminalReason>,
}

impl PodStatus {
    /// Classify a pod returned by the cluster.
    #[must_use]
    pub fn from_pod(pod: &Pod) -> Self {
        let name = pod.metadata.name.clone().unwrap_or_default();
        let status = pod.status.as_ref();
        let containers: &[ContainerStatus] = status
            .and_then(|s| s.container_statuses.as_deref())
            .unwrap_or_default();

        let total_containers = containers.len() as u32;
        let ready_containers = containers.iter().filter(|c| c.ready).count() as u32;
        let phase = PodPhase::parse(status.and_then(|s| s.phase.as_deref()));

        Self {
            name,
            ready_containers,
            total_containers,
            phase,
            terminal_reason: terminal_reason(containers),
        }
    }

    /// Running, fully ready and not crash-looping or errored.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.phase == PodPhase::Running
            && self.ready_containers == self.total_containers
            && self.terminal_reason.is_none()
    }

    /// `ready/total` as kubectl prints it.
    #[must_use]
    pub fn ready_display(&self) -> String {
        format!("{}/{}", self.ready_containers, self.total_containers)
    }

    /// Short status label for tables.
    #[must_use]
    pub fn status_label(&self) -> String {
        self.terminal_reason
            .map_or_else(|| self.phase.to_string(), |r| r.to_string())
    }
}

/// Scan container states. A crash loop wins over an error exit and stops
/// the scan.
fn terminal_reason(containers: &[ContainerStatus]) -> Option<TerminalReason> {
    let mut reason = None;
    for container in containers {
        let Some(state) = container.state.as_ref() else {
            continue;
        };
        let crash_looping = state
            .waiting
            .as_ref()
            .and_then(|w| w.reason.as_deref())
            == Some(CRASH_LOOP_BACK_OFF);
        if crash_looping {
            return Some(TerminalReason::CrashLoopBackOff);
        }
        if state.terminated.as_ref().is_some_and(|t| t.exit_code != 0) {
            reason = Some(TerminalReason::Error);
        }
    }
    reason
}

/// `true` iff `statuses` is non-empty and every pod is healthy.
#[must_use]
pub fn all_healthy(statuses: &[PodStatus]) -> bool {
    !statuses.is_empty() && statuses.iter().all(PodStatus::is_healthy)
}

/// Result of one health check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    /// Every pod under the selector is healthy (false when there are none)
    pub all_healthy: bool,
    /// Per-pod statuses sorted by name
    pub statuses: Vec<PodStatus>,
}

impl HealthCheck {
    /// Build a check from classified statuses.
    #[must_use]
    pub fn from_statuses(mut statuses: Vec<PodStatus>) -> Self {
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            all_healthy: all_healthy(&statuses),
            statuses,
        }
    }

    /// Names of pods that are not healthy.
    #[must_use]
    pub fn unhealthy_pods(&self) -> Vec<&str> {
        self.statuses
            .iter()
            .filter(|s| !s.is_healthy())
            .map(|s| s.name.as_str())
            .collect()
    }
}

/// Evaluates pod health under a label selector.
pub struct PodHealthInspector<'a, C: ?Sized> {
    cluster: &'a C,
}

impl<'a, C: ClusterApi + ?Sized> PodHealthInspector<'a, C> {
    /// Create an inspector over `cluster`.
    pub fn new(cluster: &'a C) -> Self {
        Self { cluster }
    }

    /// Check every pod matching `selector`.
    ///
    /// Never fails: a kubectl error or unparsable output degrades to an
    /// unhealthy, empty result, as does an empty pod list.
    pub async fn check_health(&self, selector: &str) -> HealthCheck {
        let pods = match self.cluster.list_pods(selector).await {
            Ok(pods) => pods,
            Err(e) => {
                warn!(selector, error = %e, "Health check degraded: could not list pods");
                return HealthCheck::default();
            }
        };

        if pods.is_empty() {
            warn!(
                selector,
                namespace = self.cluster.namespace(),
                "No pods found for selector"
            );
            return HealthCheck::default();
        }

        let check = HealthCheck::from_statuses(pods.iter().map(PodStatus::from_pod).collect());
        debug!(
            selector,
            pods = check.statuses.len(),
            all_healthy = check.all_healthy,
            "Health check complete"
        );
        check
    }
}
