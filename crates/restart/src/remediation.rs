//! Consul quorum remediation.
//!
//! When the consul server replicas come back from a restart without agreeing
//! on a leader, each replica's raft log is removed so it resynchronizes from
//! its peers. The statefulset is scaled to zero, every data volume is mounted
//! in turn by a short-lived helper pod that deletes `raft.db`, then the
//! statefulset is scaled back up.
//!
//! [`QuorumRemediator::remediate`] never fails. Per-claim problems are
//! recorded in [`RemediationAttempt::errors`] and the caller decides whether
//! the attempt worked by checking health again.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaimVolumeSource, Pod, PodSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cluster::ClusterApi;
use crate::health::PodPhase;
use crate::ui;
use crate::wait::wait_until;

/// Label value carried by every helper pod.
pub const HELPER_APP_LABEL: &str = "consul-raft-cleanup";

/// Where the helper pod mounts the consul data volume.
pub const CONSUL_DATA_MOUNT: &str = "/consul/data";

/// Raft log removed from each replica's volume.
pub const CONSENSUS_LOG_PATH: &str = "/consul/data/raft/raft.db";

const HELPER_VOLUME_NAME: &str = "consul-data";
const HELPER_CONTAINER_NAME: &str = "raft-cleanup";

/// Label selector for the pods of a statefulset.
#[must_use]
pub fn service_selector(service: &str) -> String {
    format!("app={service}")
}

/// Timing and image used during remediation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemediationSettings {
    /// How long to wait for replicas to terminate after scaling to zero
    pub termination_timeout: Duration,
    /// Poll interval while waiting for termination
    pub termination_interval: Duration,
    /// Polls before giving up on a helper pod reaching `Running`
    pub helper_attempts: u32,
    /// Poll interval while waiting for a helper pod
    pub helper_interval: Duration,
    /// Wait after scaling back up so replicas can elect a leader
    pub settle_period: Duration,
    /// Image for helper pods
    pub helper_image: String,
}

impl Default for RemediationSettings {
    fn default() -> Self {
        Self {
            termination_timeout: Duration::from_secs(10),
            termination_interval: Duration::from_secs(2),
            helper_attempts: 30,
            helper_interval: Duration::from_secs(2),
            settle_period: Duration::from_secs(120),
            helper_image: "busybox".to_string(),
        }
    }
}

/// Record of one remediation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemediationAttempt {
    /// Zero-based attempt number within this workflow
    pub attempt_number: u32,
    /// Replica pods present when the attempt started
    pub targeted_pods: BTreeSet<String>,
    /// Claims whose raft log was removed, in processing order
    pub volume_claims_processed: Vec<String>,
    /// Everything that went wrong, in order
    pub errors: Vec<String>,
}

impl RemediationAttempt {
    fn new(attempt_number: u32) -> Self {
        Self {
            attempt_number,
            ..Self::default()
        }
    }

    /// Every step succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    fn record_error(&mut self, message: String) {
        warn!(attempt = self.attempt_number, error = %message, "Remediation step failed");
        ui::print_error(&message);
        self.errors.push(message);
    }
}

/// Helper pods that are currently alive.
///
/// Cloning shares the underlying set, so the binary can keep a handle and
/// force-delete leftovers when the operator interrupts a run.
#[derive(Debug, Clone, Default)]
pub struct HelperPodRegistry {
    pods: Arc<Mutex<BTreeSet<String>>>,
}

impl HelperPodRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.pods.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a helper pod that was just created.
    pub fn register(&self, name: &str) {
        self.lock().insert(name.to_string());
    }

    /// Stop tracking a helper pod that has been deleted.
    pub fn release(&self, name: &str) {
        self.lock().remove(name);
    }

    /// Names of helper pods still tracked.
    pub fn live(&self) -> Vec<String> {
        self.lock().iter().cloned().collect()
    }

    /// Force-delete every tracked helper pod. Returns how many were removed.
    pub async fn cleanup<C: ClusterApi + ?Sized>(&self, cluster: &C) -> usize {
        let mut removed = 0;
        for name in self.live() {
            match cluster.delete_pod(&name, true).await {
                Ok(()) => {
                    info!(pod = %name, "Removed leftover helper pod");
                    self.release(&name);
                    removed += 1;
                }
                Err(e) => warn!(pod = %name, error = %e, "Could not remove helper pod"),
            }
        }
        removed
    }
}

/// Manifest for a helper pod that mounts `claim` and idles.
#[must_use]
pub fn helper_pod_manifest(name: &str, claim: &str, image: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([(
                "app".to_string(),
                HELPER_APP_LABEL.to_string(),
            )])),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            containers: vec![Container {
                name: HELPER_CONTAINER_NAME.to_string(),
                image: Some(image.to_string()),
                command: Some(vec!["sleep".to_string(), "3600".to_string()]),
                volume_mounts: Some(vec![VolumeMount {
                    name: HELPER_VOLUME_NAME.to_string(),
                    mount_path: CONSUL_DATA_MOUNT.to_string(),
                    ..VolumeMount::default()
                }]),
                ..Container::default()
            }],
            volumes: Some(vec![Volume {
                name: HELPER_VOLUME_NAME.to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim.to_string(),
                    read_only: None,
                }),
                ..Volume::default()
            }]),
            ..PodSpec::default()
        }),
        ..Pod::default()
    }
}

fn helper_pod_name(index: usize) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{HELPER_APP_LABEL}-{index}-{}", &suffix[..8])
}

/// Resets consul raft logs, one claim at a time.
pub struct QuorumRemediator<'a, C: ?Sized> {
    cluster: &'a C,
    settings: RemediationSettings,
    registry: HelperPodRegistry,
    next_attempt: AtomicU32,
}

impl<'a, C: ClusterApi + ?Sized> QuorumRemediator<'a, C> {
    /// Create a remediator with its own helper registry.
    pub fn new(cluster: &'a C, settings: RemediationSettings) -> Self {
        Self {
            cluster,
            settings,
            registry: HelperPodRegistry::new(),
            next_attempt: AtomicU32::new(0),
        }
    }

    /// Share `registry` so helper pods can be cleaned up from outside.
    #[must_use]
    pub fn with_registry(mut self, registry: HelperPodRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Registry of helper pods this remediator has created.
    pub fn registry(&self) -> &HelperPodRegistry {
        &self.registry
    }

    /// Run one remediation pass over `service` and its `claims`.
    pub async fn remediate(
        &self,
        service: &str,
        replicas: u32,
        claims: &[String],
    ) -> RemediationAttempt {
        let mut attempt = RemediationAttempt::new(self.next_attempt.fetch_add(1, Ordering::SeqCst));
        let selector = service_selector(service);
        info!(
            attempt = attempt.attempt_number,
            service,
            replicas,
            claims = claims.len(),
            "Starting quorum remediation"
        );

        match self.cluster.list_pods(&selector).await {
            Ok(pods) => {
                attempt.targeted_pods = pods.into_iter().filter_map(|p| p.metadata.name).collect();
            }
            Err(e) => warn!(service, error = %e, "Could not list replicas before remediation"),
        }

        ui::print_progress(&format!("Scaling {service} to 0 replicas"));
        match self.cluster.scale(service, 0).await {
            Ok(()) => {
                self.wait_for_termination(&selector, &mut attempt).await;
                for (index, claim) in claims.iter().enumerate() {
                    match self.purge_claim(index, claim).await {
                        Ok(()) => {
                            ui::print_success(&format!("Removed raft log from {claim}"));
                            attempt.volume_claims_processed.push(claim.clone());
                        }
                        Err(message) => attempt.record_error(message),
                    }
                }
            }
            Err(e) => {
                attempt.record_error(format!("failed to scale {service} to 0: {e}"));
            }
        }

        ui::print_progress(&format!("Scaling {service} back to {replicas} replicas"));
        match self.cluster.scale(service, replicas).await {
            Ok(()) => {
                ui::print_progress(&format!(
                    "Waiting {}s for {service} to settle",
                    self.settings.settle_period.as_secs()
                ));
                tokio::time::sleep(self.settings.settle_period).await;
            }
            Err(e) => {
                attempt.record_error(format!("failed to scale {service} to {replicas}: {e}"));
            }
        }

        info!(
            attempt = attempt.attempt_number,
            processed = attempt.volume_claims_processed.len(),
            errors = attempt.errors.len(),
            "Quorum remediation finished"
        );
        attempt
    }

    /// Wait for replicas to go away, then force-delete whatever is left.
    async fn wait_for_termination(&self, selector: &str, attempt: &mut RemediationAttempt) {
        let cluster = self.cluster;
        let terminated = wait_until(
            self.settings.termination_timeout,
            self.settings.termination_interval,
            move || async move { matches!(cluster.list_pods(selector).await, Ok(pods) if pods.is_empty()) },
        )
        .await;
        if terminated {
            debug!(selector, "All replicas terminated");
            return;
        }

        let leftovers = match self.cluster.list_pods(selector).await {
            Ok(pods) => pods,
            Err(e) => {
                attempt.record_error(format!("could not list replicas stuck terminating: {e}"));
                return;
            }
        };
        for name in leftovers.into_iter().filter_map(|p| p.metadata.name) {
            ui::print_warning(&format!("Force deleting {name} (stuck terminating)"));
            if let Err(e) = self.cluster.delete_pod(&name, true).await {
                attempt.record_error(format!("failed to force delete {name}: {e}"));
            }
        }
    }

    /// Remove the raft log from one claim through a helper pod.
    async fn purge_claim(&self, index: usize, claim: &str) -> Result<(), String> {
        let name = helper_pod_name(index);
        let manifest = helper_pod_manifest(&name, claim, &self.settings.helper_image);
        ui::print_progress(&format!("Mounting {claim} in helper pod {name}"));

        // Registered first: a failed create may still have landed on the API server.
        self.registry.register(&name);
        if let Err(e) = self.cluster.create_pod(&manifest).await {
            self.remove_helper(&name).await.ok();
            return Err(format!("{claim}: failed to create helper pod: {e}"));
        }

        let cluster = self.cluster;
        let helper = name.as_str();
        let running = wait_until(
            self.settings.helper_interval * self.settings.helper_attempts,
            self.settings.helper_interval,
            move || async move {
                match cluster.get_pod(helper).await {
                    Ok(Some(pod)) => {
                        let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
                        PodPhase::parse(phase) == PodPhase::Running
                    }
                    _ => false,
                }
            },
        )
        .await;

        if !running {
            self.remove_helper(&name).await.ok();
            return Err(format!(
                "{claim}: helper pod {name} not running after {} attempts",
                self.settings.helper_attempts
            ));
        }

        let rm = vec![
            "rm".to_string(),
            "-f".to_string(),
            CONSENSUS_LOG_PATH.to_string(),
        ];
        if let Err(e) = self.cluster.exec_in_pod(&name, &rm).await {
            self.remove_helper(&name).await.ok();
            return Err(format!("{claim}: failed to remove raft log: {e}"));
        }

        self.remove_helper(&name)
            .await
            .map_err(|e| format!("{claim}: failed to delete helper pod {name}: {e}"))
    }

    async fn remove_helper(&self, name: &str) -> Result<(), crate::error::ClusterError> {
        match self.cluster.delete_pod(name, true).await {
            Ok(()) => {
                self.registry.release(name);
                Ok(())
            }
            Err(e) => {
                warn!(pod = name, error = %e, "Helper pod left behind");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{pod, ContainerFixture, FakeCluster};

    const SERVICE: &str = "sas-consul-server";

    fn claims() -> Vec<String> {
        (0..3)
            .map(|i| format!("sas-viya-consul-data-volume-sas-consul-server-{i}"))
            .collect()
    }

    fn consul_cluster() -> FakeCluster {
        let cluster = FakeCluster::new("abcprod");
        cluster.set_pods(
            (0..3)
                .map(|i| pod(&format!("{SERVICE}-{i}"), "Running", &[ContainerFixture::CrashLoop]))
                .collect(),
        );
        cluster.state().consensus_logs = claims().into_iter().collect();
        cluster
    }

    #[test]
    fn test_helper_manifest_mounts_claim() {
        let manifest = helper_pod_manifest("consul-raft-cleanup-0-abcd1234", "data-0", "busybox");
        let spec = manifest.spec.as_ref().expect("spec");

        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        let volume = &spec.volumes.as_ref().expect("volumes")[0];
        assert_eq!(
            volume.persistent_volume_claim.as_ref().map(|c| c.claim_name.as_str()),
            Some("data-0")
        );
        let mount = &spec.containers[0].volume_mounts.as_ref().expect("mounts")[0];
        assert_eq!(mount.mount_path, CONSUL_DATA_MOUNT);
        assert_eq!(mount.name, volume.name);
        assert_eq!(
            manifest.metadata.labels.as_ref().and_then(|l| l.get("app")).map(String::as_str),
            Some(HELPER_APP_LABEL)
        );
    }

    #[test]
    fn test_helper_pod_names_are_unique() {
        let a = helper_pod_name(0);
        let b = helper_pod_name(0);
        assert!(a.starts_with("consul-raft-cleanup-0-"));
        assert_eq!(a.len(), "consul-raft-cleanup-0-".len() + 8);
        assert_ne!(a, b);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remediate_processes_every_claim_in_order() {
        let cluster = consul_cluster();
        let remediator = QuorumRemediator::new(&cluster, RemediationSettings::default());

        let attempt = remediator.remediate(SERVICE, 3, &claims()).await;

        assert!(attempt.is_clean(), "{:?}", attempt.errors);
        assert_eq!(attempt.attempt_number, 0);
        assert_eq!(attempt.volume_claims_processed, claims());
        assert_eq!(attempt.targeted_pods.len(), 3);
        assert!(cluster.state().consensus_logs.is_empty());
        assert!(cluster.live_helpers().is_empty());
        assert!(remediator.registry().live().is_empty());

        let scales: Vec<_> = cluster
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("scale"))
            .collect();
        assert_eq!(scales, [format!("scale {SERVICE} 0"), format!("scale {SERVICE} 3")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_failures_do_not_abort_siblings() {
        let cluster = consul_cluster();
        let claims = claims();
        {
            let mut state = cluster.state();
            state.helpers_never_running.insert(claims[0].clone());
            state.helper_delete_failures.insert(claims[2].clone());
        }
        let remediator = QuorumRemediator::new(&cluster, RemediationSettings::default());

        let attempt = remediator.remediate(SERVICE, 3, &claims).await;

        assert_eq!(attempt.volume_claims_processed, [claims[1].clone()]);
        assert_eq!(attempt.errors.len(), 2);
        assert!(attempt.errors[0].contains(&claims[0]));
        assert!(attempt.errors[0].contains("not running"));
        assert!(attempt.errors[1].contains(&claims[2]));
        assert_eq!(cluster.state().purged, [claims[1].clone(), claims[2].clone()]);
        assert_eq!(cluster.count_calls(&format!("scale {SERVICE} 3")), 1);

        // The helper that could not be deleted stays tracked for cleanup.
        let live = remediator.registry().live();
        assert_eq!(live.len(), 1);
        assert_eq!(cluster.live_helpers(), live);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_and_exec_failures_are_recorded() {
        let cluster = consul_cluster();
        let claims = claims();
        {
            let mut state = cluster.state();
            state.create_failures.insert(claims[0].clone());
            state.exec_failures.insert(claims[1].clone());
        }
        let remediator = QuorumRemediator::new(&cluster, RemediationSettings::default());

        let attempt = remediator.remediate(SERVICE, 3, &claims).await;

        assert_eq!(attempt.volume_claims_processed, [claims[2].clone()]);
        assert_eq!(attempt.errors.len(), 2);
        assert!(attempt.errors[0].contains("failed to create helper pod"));
        assert!(attempt.errors[1].contains("failed to remove raft log"));
        assert!(cluster.live_helpers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_create_still_removes_helper() {
        let cluster = consul_cluster();
        let claims = claims();
        cluster.state().create_timeouts.insert(claims[0].clone());
        let remediator = QuorumRemediator::new(&cluster, RemediationSettings::default());

        let attempt = remediator.remediate(SERVICE, 3, &claims).await;

        assert_eq!(attempt.errors.len(), 1);
        assert!(attempt.errors[0].contains("timed out"), "{:?}", attempt.errors);
        assert_eq!(attempt.volume_claims_processed, claims[1..].to_vec());
        assert!(cluster.live_helpers().is_empty());
        assert!(remediator.registry().live().is_empty());
        assert_eq!(cluster.count_calls("delete consul-raft-cleanup-0-"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_helper_left_by_failed_create_stays_registered() {
        let cluster = consul_cluster();
        let claims = claims();
        {
            let mut state = cluster.state();
            state.create_timeouts.insert(claims[0].clone());
            state.helper_delete_failures.insert(claims[0].clone());
        }
        let remediator = QuorumRemediator::new(&cluster, RemediationSettings::default());

        remediator.remediate(SERVICE, 3, &claims[..1]).await;

        assert_eq!(remediator.registry().live(), cluster.live_helpers());
        cluster.state().helper_delete_failures.clear();
        assert_eq!(remediator.registry().cleanup(&cluster).await, 1);
        assert!(cluster.live_helpers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_replicas_are_force_deleted() {
        let cluster = consul_cluster();
        cluster.state().stuck_on_scale_down =
            vec![pod(&format!("{SERVICE}-1"), "Running", &[ContainerFixture::NotReady])];
        let remediator = QuorumRemediator::new(&cluster, RemediationSettings::default());

        let attempt = remediator.remediate(SERVICE, 3, &claims()).await;

        assert!(attempt.is_clean(), "{:?}", attempt.errors);
        assert_eq!(cluster.count_calls(&format!("delete {SERVICE}-1 force=true")), 1);
        let calls = cluster.calls();
        let force = calls
            .iter()
            .position(|c| c == &format!("delete {SERVICE}-1 force=true"))
            .expect("force delete");
        let first_create = calls
            .iter()
            .position(|c| c.starts_with("create "))
            .expect("helper created");
        assert!(force < first_create);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_failure_skips_claims_and_still_scales_up() {
        let cluster = consul_cluster();
        cluster.state().scale_fails = true;
        let remediator = QuorumRemediator::new(&cluster, RemediationSettings::default());

        let attempt = remediator.remediate(SERVICE, 3, &claims()).await;

        assert!(attempt.volume_claims_processed.is_empty());
        assert_eq!(attempt.errors.len(), 2);
        assert_eq!(cluster.count_calls("scale"), 2);
        assert_eq!(cluster.count_calls("create"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_removal_is_idempotent() {
        let cluster = consul_cluster();
        let remediator = QuorumRemediator::new(&cluster, RemediationSettings::default());

        let first = remediator.remediate(SERVICE, 3, &claims()).await;
        let second = remediator.remediate(SERVICE, 3, &claims()).await;

        assert_eq!(first.attempt_number, 0);
        assert_eq!(second.attempt_number, 1);
        assert_eq!(first.errors, second.errors);
        assert_eq!(second.volume_claims_processed, claims());
        assert_eq!(cluster.state().purged.len(), 6);
    }

    #[tokio::test]
    async fn test_registry_cleanup_force_deletes_tracked_helpers() {
        let cluster = FakeCluster::new("abcprod");
        let registry = HelperPodRegistry::new();
        let shared = registry.clone();
        registry.register("consul-raft-cleanup-0-aaaaaaaa");
        registry.register("consul-raft-cleanup-1-bbbbbbbb");

        let removed = shared.cleanup(&cluster).await;

        assert_eq!(removed, 2);
        assert!(registry.live().is_empty());
        assert_eq!(cluster.count_calls("delete consul-raft-cleanup-"), 2);
        assert!(cluster
            .calls()
            .iter()
            .all(|c| c.ends_with("force=true")));
    }
}
