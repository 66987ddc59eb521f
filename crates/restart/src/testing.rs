//! In-memory cluster and fixtures for unit tests.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobStatus};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::json;

use crate::cluster::ClusterApi;
use crate::error::{ClusterError, ExecutionError};
use crate::executor::CommandResult;

/// Container state shorthand for [`pod`].
#[derive(Debug, Clone, Copy)]
pub enum ContainerFixture {
    /// Running and ready
    Ready,
    /// Running but not ready
    NotReady,
    /// Waiting in `CrashLoopBackOff`
    CrashLoop,
    /// Terminated with the given exit code
    Terminated(i32),
}

/// `app` label value for a fixture pod: the name minus its ordinal/hash suffix.
fn app_label(name: &str) -> &str {
    name.rsplit_once('-').map_or(name, |(prefix, _)| prefix)
}

/// Build a pod in `phase` with one container per fixture entry.
pub fn pod(name: &str, phase: &str, containers: &[ContainerFixture]) -> Pod {
    let mut spec_containers = Vec::new();
    let mut statuses = Vec::new();
    for (i, fixture) in containers.iter().enumerate() {
        let cname = format!("c{i}");
        spec_containers.push(json!({"name": cname, "image": "busybox"}));
        let (ready, state) = match fixture {
            ContainerFixture::Ready => (true, json!({"running": {}})),
            ContainerFixture::NotReady => (false, json!({"running": {}})),
            ContainerFixture::CrashLoop => (
                false,
                json!({"waiting": {"reason": "CrashLoopBackOff"}}),
            ),
            ContainerFixture::Terminated(code) => {
                let reason = if *code == 0 { "Completed" } else { "Error" };
                (
                    false,
                    json!({"terminated": {"exitCode": code, "reason": reason}}),
                )
            }
        };
        statuses.push(json!({
            "name": cname,
            "ready": ready,
            "restartCount": 0,
            "image": "busybox",
            "imageID": "",
            "state": state
        }));
    }

    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {"name": name, "labels": {"app": app_label(name)}},
        "spec": {"containers": spec_containers},
        "status": {"phase": phase, "containerStatuses": statuses}
    }))
    .expect("fixture pod is valid")
}

/// Build a job with the given completion counts.
pub fn job(name: &str, succeeded: i32, failed: i32) -> Job {
    Job {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..ObjectMeta::default()
        },
        status: Some(JobStatus {
            succeeded: Some(succeeded),
            failed: Some(failed),
            ..JobStatus::default()
        }),
        ..Job::default()
    }
}

fn kubectl_error(message: impl Into<String>) -> ClusterError {
    ClusterError::Execution(ExecutionError::NonZeroExit {
        program: "kubectl".to_string(),
        exit_code: 1,
        stdout: String::new(),
        stderr: message.into(),
    })
}

fn selector_matches(pod: &Pod, selector: &str) -> bool {
    let labels = pod.metadata.labels.clone().unwrap_or_default();
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
            None => labels.contains_key(term),
        })
}

fn claim_of(manifest: &Pod) -> String {
    manifest
        .spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .and_then(|v| v.first())
        .and_then(|v| v.persistent_volume_claim.as_ref())
        .map(|pvc| pvc.claim_name.clone())
        .unwrap_or_default()
}

/// Mutable state behind [`FakeCluster`].
#[derive(Default)]
pub struct FakeState {
    /// Workload pods currently present
    pub pods: Vec<Pod>,
    /// Helper pods by name, with the claim they mount
    pub helpers: BTreeMap<String, (String, Pod)>,
    /// Number of upcoming `list_pods` calls that fail
    pub list_failures: u32,
    /// Pods that appear after each scale-up, oldest first; when empty the
    /// pods from before the scale-down come back unchanged
    pub scale_up_snapshots: VecDeque<Vec<Pod>>,
    /// Pods that survive a scale to zero (stuck terminating)
    pub stuck_on_scale_down: Vec<Pod>,
    saved_before_scale_down: Vec<Pod>,
    /// Claims whose helper pod never leaves `Pending`
    pub helpers_never_running: HashSet<String>,
    /// Claims whose helper pod cannot be created
    pub create_failures: HashSet<String>,
    /// Claims whose helper pod is created but the create call times out
    pub create_timeouts: HashSet<String>,
    /// Claims whose consensus-log removal fails
    pub exec_failures: HashSet<String>,
    /// Claims whose helper pod cannot be deleted
    pub helper_delete_failures: HashSet<String>,
    /// Whether `scale` fails
    pub scale_fails: bool,
    /// Claims that still hold a consensus log
    pub consensus_logs: HashSet<String>,
    /// Every claim an `rm` ran against, in order
    pub purged: Vec<String>,
    /// Operation log
    pub calls: Vec<String>,
    /// Jobs in the namespace
    pub jobs: Vec<Job>,
    /// Whether jobs created from cronjobs complete immediately
    pub jobs_never_complete: bool,
    /// Container logs keyed by (pod, container)
    pub logs: HashMap<(String, String), String>,
}

/// In-memory [`ClusterApi`].
pub struct FakeCluster {
    namespace: String,
    state: Mutex<FakeState>,
}

impl FakeCluster {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            state: Mutex::new(FakeState::default()),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake cluster lock poisoned")
    }

    pub fn set_pods(&self, pods: Vec<Pod>) {
        self.state().pods = pods;
    }

    pub fn fail_list_pods(&self, times: u32) {
        self.state().list_failures = times;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn live_helpers(&self) -> Vec<String> {
        self.state().helpers.keys().cloned().collect()
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>, ClusterError> {
        let mut state = self.state();
        state.calls.push(format!("list {selector}"));
        if state.list_failures > 0 {
            state.list_failures -= 1;
            return Err(kubectl_error("Unable to connect to the server"));
        }
        Ok(state
            .pods
            .iter()
            .chain(state.helpers.values().map(|(_, pod)| pod))
            .filter(|pod| selector_matches(pod, selector))
            .cloned()
            .collect())
    }

    async fn get_pod(&self, name: &str) -> Result<Option<Pod>, ClusterError> {
        let state = self.state();
        if let Some((claim, manifest)) = state.helpers.get(name) {
            let phase = if state.helpers_never_running.contains(claim) {
                "Pending"
            } else {
                "Running"
            };
            let mut pod = manifest.clone();
            pod.status = Some(k8s_openapi::api::core::v1::PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            });
            return Ok(Some(pod));
        }
        Ok(state
            .pods
            .iter()
            .find(|p| p.metadata.name.as_deref() == Some(name))
            .cloned())
    }

    async fn scale(&self, statefulset: &str, replicas: u32) -> Result<(), ClusterError> {
        let mut state = self.state();
        state.calls.push(format!("scale {statefulset} {replicas}"));
        if state.scale_fails {
            return Err(kubectl_error("statefulsets.apps is forbidden"));
        }
        let selector = format!("app={statefulset}");
        let (owned, others): (Vec<Pod>, Vec<Pod>) = std::mem::take(&mut state.pods)
            .into_iter()
            .partition(|p| selector_matches(p, &selector));
        state.pods = others;
        if replicas == 0 {
            let stuck = state.stuck_on_scale_down.clone();
            state.saved_before_scale_down = owned;
            state.pods.extend(stuck);
        } else {
            let next = state
                .scale_up_snapshots
                .pop_front()
                .unwrap_or_else(|| state.saved_before_scale_down.clone());
            state.pods.extend(next);
        }
        Ok(())
    }

    async fn delete_pod(&self, name: &str, force: bool) -> Result<(), ClusterError> {
        let mut state = self.state();
        state.calls.push(format!("delete {name} force={force}"));
        if let Some((claim, _)) = state.helpers.get(name) {
            if state.helper_delete_failures.contains(claim) {
                return Err(kubectl_error("etcdserver: request timed out"));
            }
        }
        state.helpers.remove(name);
        state
            .pods
            .retain(|p| p.metadata.name.as_deref() != Some(name));
        Ok(())
    }

    async fn create_pod(&self, manifest: &Pod) -> Result<(), ClusterError> {
        let mut state = self.state();
        let name = manifest.metadata.name.clone().unwrap_or_default();
        let claim = claim_of(manifest);
        state.calls.push(format!("create {name} claim={claim}"));
        if state.create_failures.contains(&claim) {
            return Err(kubectl_error("admission webhook denied the request"));
        }
        let timed_out = state.create_timeouts.contains(&claim);
        state.helpers.insert(name, (claim, manifest.clone()));
        if timed_out {
            return Err(ClusterError::Execution(ExecutionError::Timeout {
                program: "kubectl".to_string(),
                timeout: std::time::Duration::from_secs(60),
            }));
        }
        Ok(())
    }

    async fn exec_in_pod(
        &self,
        pod: &str,
        command: &[String],
    ) -> Result<CommandResult, ClusterError> {
        let mut state = self.state();
        state.calls.push(format!("exec {pod} {}", command.join(" ")));
        let Some((claim, _)) = state.helpers.get(pod).cloned() else {
            return Err(kubectl_error(format!("pods \"{pod}\" not found")));
        };
        if state.exec_failures.contains(&claim) {
            return Err(kubectl_error("rm: can't remove: Read-only file system"));
        }
        state.consensus_logs.remove(&claim);
        state.purged.push(claim);
        Ok(CommandResult::default())
    }

    async fn create_job_from_cronjob(&self, cronjob: &str, name: &str) -> Result<(), ClusterError> {
        let mut state = self.state();
        state.calls.push(format!("create-job {name} from={cronjob}"));
        let succeeded = i32::from(!state.jobs_never_complete);
        state.jobs.push(job(name, succeeded, 0));
        Ok(())
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, ClusterError> {
        Ok(self.state().jobs.clone())
    }

    async fn delete_job(&self, name: &str) -> Result<(), ClusterError> {
        let mut state = self.state();
        state.calls.push(format!("delete-job {name}"));
        state
            .jobs
            .retain(|j| j.metadata.name.as_deref() != Some(name));
        Ok(())
    }

    async fn pod_logs(&self, pod: &str, container: &str) -> Result<String, ClusterError> {
        let state = self.state();
        state
            .logs
            .get(&(pod.to_string(), container.to_string()))
            .cloned()
            .ok_or_else(|| kubectl_error(format!("container {container} not found")))
    }
}
