//! Cluster access through `kubectl`.
//!
//! [`ClusterApi`] is the capability set the workflow needs from Kubernetes.
//! [`KubectlCluster`] implements it by shelling out through a
//! [`CommandExecutor`] and parsing the JSON that kubectl prints.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::error::ClusterError;
use crate::executor::{ClusterCommand, CommandExecutor, CommandResult, DEFAULT_COMMAND_TIMEOUT};

/// Namespace-scoped cluster operations.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Namespace every operation is scoped to.
    fn namespace(&self) -> &str;

    /// List pods matching a label selector. An empty selector lists every pod.
    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>, ClusterError>;

    /// Fetch a single pod, `None` if it does not exist.
    async fn get_pod(&self, name: &str) -> Result<Option<Pod>, ClusterError>;

    /// Scale a statefulset to `replicas`.
    async fn scale(&self, statefulset: &str, replicas: u32) -> Result<(), ClusterError>;

    /// Delete a pod. `force` skips graceful termination (grace period zero).
    /// Deleting a pod that does not exist succeeds.
    async fn delete_pod(&self, name: &str, force: bool) -> Result<(), ClusterError>;

    /// Create a pod from a manifest.
    async fn create_pod(&self, manifest: &Pod) -> Result<(), ClusterError>;

    /// Run a command inside a pod's first container.
    async fn exec_in_pod(&self, pod: &str, command: &[String])
        -> Result<CommandResult, ClusterError>;

    /// Create a one-off job from a cronjob template.
    async fn create_job_from_cronjob(&self, cronjob: &str, job: &str)
        -> Result<(), ClusterError>;

    /// List every job in the namespace.
    async fn list_jobs(&self) -> Result<Vec<Job>, ClusterError>;

    /// Delete a job and its pods.
    async fn delete_job(&self, name: &str) -> Result<(), ClusterError>;

    /// Fetch the logs of one container.
    async fn pod_logs(&self, pod: &str, container: &str) -> Result<String, ClusterError>;
}

/// `kubectl get -o json` list envelope.
#[derive(Deserialize)]
struct ItemList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

fn parse_items<T: DeserializeOwned>(stdout: &str) -> Result<Vec<T>, ClusterError> {
    let list: ItemList<T> = serde_json::from_str(stdout)?;
    Ok(list.items)
}

/// [`ClusterApi`] backed by the kubectl CLI.
pub struct KubectlCluster<E> {
    executor: E,
    namespace: String,
    timeout: Duration,
    kubeconfig: Option<String>,
}

impl<E: CommandExecutor> KubectlCluster<E> {
    /// Create a cluster handle for `namespace`.
    pub fn new(executor: E, namespace: impl Into<String>) -> Self {
        Self {
            executor,
            namespace: namespace.into(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
            kubeconfig: None,
        }
    }

    /// Set the per-command timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Point kubectl at a specific kubeconfig.
    #[must_use]
    pub fn with_kubeconfig(mut self, path: impl Into<String>) -> Self {
        self.kubeconfig = Some(path.into());
        self
    }

    /// Underlying executor.
    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Build a namespaced kubectl command.
    fn command<I, S>(&self, args: I) -> ClusterCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut cmd = ClusterCommand::kubectl(args).with_timeout(self.timeout);
        cmd.argv.push("-n".to_string());
        cmd.argv.push(self.namespace.clone());
        if let Some(path) = &self.kubeconfig {
            cmd = cmd.with_env("KUBECONFIG", path.clone());
        }
        cmd
    }

    async fn run(&self, cmd: ClusterCommand) -> Result<CommandResult, ClusterError> {
        Ok(self.executor.execute(&cmd).await?)
    }
}

#[async_trait]
impl<E: CommandExecutor> ClusterApi for KubectlCluster<E> {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>, ClusterError> {
        let mut args = vec!["get", "pods", "-o", "json"];
        if !selector.is_empty() {
            args.extend(["-l", selector]);
        }
        let result = self.run(self.command(args)).await?;
        let pods = parse_items::<Pod>(&result.stdout)?;
        debug!(selector, count = pods.len(), "Listed pods");
        Ok(pods)
    }

    async fn get_pod(&self, name: &str) -> Result<Option<Pod>, ClusterError> {
        let result = self
            .run(self.command(["get", "pod", name, "-o", "json", "--ignore-not-found"]))
            .await?;
        if result.stdout.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&result.stdout)?))
    }

    async fn scale(&self, statefulset: &str, replicas: u32) -> Result<(), ClusterError> {
        let target = format!("statefulset/{statefulset}");
        let replicas = format!("--replicas={replicas}");
        self.run(self.command(["scale", target.as_str(), replicas.as_str()]))
            .await?;
        Ok(())
    }

    async fn delete_pod(&self, name: &str, force: bool) -> Result<(), ClusterError> {
        let mut args = vec!["delete", "pod", name, "--ignore-not-found"];
        if force {
            args.extend(["--grace-period=0", "--force"]);
        }
        self.run(self.command(args)).await?;
        Ok(())
    }

    async fn create_pod(&self, manifest: &Pod) -> Result<(), ClusterError> {
        let body =
            serde_json::to_string(manifest).map_err(|e| ClusterError::Manifest(e.to_string()))?;
        self.run(self.command(["create", "-f", "-"]).with_stdin(body))
            .await?;
        Ok(())
    }

    async fn exec_in_pod(
        &self,
        pod: &str,
        command: &[String],
    ) -> Result<CommandResult, ClusterError> {
        let mut cmd = self.command(["exec", pod]);
        cmd.argv.push("--".to_string());
        cmd.argv.extend(command.iter().cloned());
        self.run(cmd).await
    }

    async fn create_job_from_cronjob(&self, cronjob: &str, job: &str) -> Result<(), ClusterError> {
        let from = format!("--from=cronjob/{cronjob}");
        self.run(self.command(["create", "job", job, from.as_str()]))
            .await?;
        Ok(())
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, ClusterError> {
        let result = self.run(self.command(["get", "jobs", "-o", "json"])).await?;
        parse_items(&result.stdout)
    }

    async fn delete_job(&self, name: &str) -> Result<(), ClusterError> {
        self.run(self.command(["delete", "job", name, "--ignore-not-found"]))
            .await?;
        Ok(())
    }

    async fn pod_logs(&self, pod: &str, container: &str) -> Result<String, ClusterError> {
        let result = self.run(self.command(["logs", pod, "-c", container])).await?;
        Ok(result.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecutionError;
    use crate::executor::MockCommandExecutor;

    const POD_LIST: &str = r#"{
        "apiVersion": "v1",
        "kind": "List",
        "items": [
            {
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {"name": "sas-consul-server-0"},
                "status": {"phase": "Running"}
            }
        ]
    }"#;

    fn args_of(cmd: &ClusterCommand) -> Vec<&str> {
        cmd.argv.iter().map(String::as_str).collect()
    }

    #[tokio::test]
    async fn test_list_pods_with_selector() {
        let mut executor = MockCommandExecutor::new();
        executor
            .expect_execute()
            .withf(|cmd| {
                args_of(cmd)
                    == [
                        "kubectl",
                        "get",
                        "pods",
                        "-o",
                        "json",
                        "-l",
                        "app=sas-consul-server",
                        "-n",
                        "abcprod",
                    ]
            })
            .times(1)
            .returning(|_| Ok(CommandResult::ok(POD_LIST)));

        let cluster = KubectlCluster::new(executor, "abcprod");
        let pods = cluster.list_pods("app=sas-consul-server").await.unwrap();

        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].metadata.name.as_deref(), Some("sas-consul-server-0"));
    }

    #[tokio::test]
    async fn test_list_pods_rejects_malformed_json() {
        let mut executor = MockCommandExecutor::new();
        executor
            .expect_execute()
            .returning(|_| Ok(CommandResult::ok("not json")));

        let cluster = KubectlCluster::new(executor, "abcprod");
        let err = cluster.list_pods("").await.unwrap_err();

        assert!(matches!(err, ClusterError::Parse(_)));
    }

    #[tokio::test]
    async fn test_force_delete_uses_zero_grace_period() {
        let mut executor = MockCommandExecutor::new();
        executor
            .expect_execute()
            .withf(|cmd| {
                args_of(cmd)
                    == [
                        "kubectl",
                        "delete",
                        "pod",
                        "helper",
                        "--ignore-not-found",
                        "--grace-period=0",
                        "--force",
                        "-n",
                        "abcprod",
                    ]
            })
            .times(1)
            .returning(|_| Ok(CommandResult::default()));

        let cluster = KubectlCluster::new(executor, "abcprod");
        cluster.delete_pod("helper", true).await.unwrap();
    }

    #[tokio::test]
    async fn test_scale_and_exec_arguments() {
        let mut executor = MockCommandExecutor::new();
        executor
            .expect_execute()
            .withf(|cmd| cmd.args().first().map(String::as_str) == Some("scale"))
            .times(1)
            .returning(|cmd| {
                assert_eq!(
                    cmd.args(),
                    [
                        "scale",
                        "statefulset/sas-consul-server",
                        "--replicas=0",
                        "-n",
                        "abcprod"
                    ]
                );
                Ok(CommandResult::default())
            });
        executor
            .expect_execute()
            .withf(|cmd| cmd.args().first().map(String::as_str) == Some("exec"))
            .times(1)
            .returning(|cmd| {
                assert_eq!(
                    cmd.args(),
                    [
                        "exec",
                        "helper",
                        "-n",
                        "abcprod",
                        "--",
                        "rm",
                        "-f",
                        "/consul/data/raft/raft.db"
                    ]
                );
                Ok(CommandResult::default())
            });

        let cluster = KubectlCluster::new(executor, "abcprod");
        cluster.scale("sas-consul-server", 0).await.unwrap();
        cluster
            .exec_in_pod(
                "helper",
                &[
                    "rm".to_string(),
                    "-f".to_string(),
                    "/consul/data/raft/raft.db".to_string(),
                ],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_pod_pipes_manifest() {
        let mut executor = MockCommandExecutor::new();
        executor
            .expect_execute()
            .withf(|cmd| {
                cmd.args()[..3] == ["create", "-f", "-"]
                    && cmd.stdin.as_deref().is_some_and(|s| s.contains("\"kind\":\"Pod\""))
            })
            .times(1)
            .returning(|_| Ok(CommandResult::default()));

        let cluster = KubectlCluster::new(executor, "abcprod");
        cluster.create_pod(&Pod::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_get_missing_pod_returns_none() {
        let mut executor = MockCommandExecutor::new();
        executor
            .expect_execute()
            .returning(|_| Ok(CommandResult::ok("")));

        let cluster = KubectlCluster::new(executor, "abcprod");
        assert!(cluster.get_pod("gone").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_execution_errors_propagate() {
        let mut executor = MockCommandExecutor::new();
        executor.expect_execute().returning(|_| {
            Err(ExecutionError::NonZeroExit {
                program: "kubectl".to_string(),
                exit_code: 1,
                stdout: String::new(),
                stderr: "Error from server (Forbidden)".to_string(),
            })
        });

        let cluster = KubectlCluster::new(executor, "abcprod").with_kubeconfig("/tmp/kc");
        let err = cluster.list_jobs().await.unwrap_err();

        assert!(matches!(err, ClusterError::Execution(_)));
    }
}
