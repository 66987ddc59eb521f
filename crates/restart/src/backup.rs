//! Container log backup before a restart.
//!
//! Logs of every running pod are written under
//! `<root>/<namespace>/<ticket>/<timestamp>/<pod>/<State>/logs/<container>.log`
//! and the directory is then archived with `tar`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Local;
use futures::stream::{self, StreamExt};
use k8s_openapi::api::core::v1::{ContainerState, ContainerStatus, Pod};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cluster::ClusterApi;
use crate::error::BackupError;
use crate::executor::{ClusterCommand, CommandExecutor};
use crate::health::PodPhase;
use crate::ui;

/// Default number of concurrent `kubectl logs` calls.
pub const DEFAULT_MAX_WORKERS: usize = 10;

const SLOW_BACKUP: Duration = Duration::from_secs(300);
const ARCHIVE_TIMEOUT: Duration = Duration::from_secs(600);

/// Backup location and parallelism.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSettings {
    /// Root directory; the namespace and ticket are appended
    pub root: PathBuf,
    /// Concurrent log fetches
    pub max_workers: usize,
    /// Tar the timestamp directory when an archiver is attached
    pub archive: bool,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("viya4_environment_restart"),
            max_workers: DEFAULT_MAX_WORKERS,
            archive: true,
        }
    }
}

/// Folder a container's log lands in, by container state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LogFolder {
    Running,
    Terminated,
    Error,
}

impl LogFolder {
    /// Relative path under the pod directory.
    #[must_use]
    pub fn path(self) -> &'static str {
        match self {
            Self::Running => "Running/logs",
            Self::Terminated => "Terminated/logs",
            Self::Error => "Error/logs",
        }
    }
}

/// Why a container's log was not collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No status or an empty state
    NoState,
    /// Container has not started
    Waiting,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoState => f.write_str("No state information"),
            Self::Waiting => f.write_str("Waiting state"),
        }
    }
}

/// Pick the log folder for a container state.
///
/// Running goes to `Running/logs`; terminated with reason `Completed` goes
/// to `Terminated/logs`, any other termination to `Error/logs`.
pub fn classify(state: Option<&ContainerState>) -> Result<LogFolder, SkipReason> {
    let Some(state) = state else {
        return Err(SkipReason::NoState);
    };
    if state.running.is_some() {
        Ok(LogFolder::Running)
    } else if let Some(terminated) = &state.terminated {
        if terminated.reason.as_deref() == Some("Completed") {
            Ok(LogFolder::Terminated)
        } else {
            Ok(LogFolder::Error)
        }
    } else if state.waiting.is_some() {
        Err(SkipReason::Waiting)
    } else {
        Err(SkipReason::NoState)
    }
}

/// Result for one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerLog {
    /// Container name
    pub container: String,
    /// Init container
    pub init: bool,
    /// Log written
    pub collected: bool,
    /// Why it was not
    pub error: Option<String>,
}

/// Results for one pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PodBackup {
    /// Pod name
    pub pod: String,
    /// Per-container results, init containers first, each group sorted by name
    pub containers: Vec<ContainerLog>,
}

/// What a backup run produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupReport {
    /// Directory holding the logs
    pub directory: PathBuf,
    /// Archive, if `tar` succeeded
    pub archive: Option<PathBuf>,
    /// Pods in the namespace
    pub pods_total: usize,
    /// Per-pod results for the running pods
    pub pods: Vec<PodBackup>,
    /// Wall-clock seconds
    pub elapsed_secs: u64,
}

impl BackupReport {
    /// Number of container logs written.
    #[must_use]
    pub fn collected(&self) -> usize {
        self.pods
            .iter()
            .flat_map(|p| &p.containers)
            .filter(|c| c.collected)
            .count()
    }
}

struct LogTask {
    pod: String,
    container: String,
    init: bool,
    file: PathBuf,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> BackupError + '_ {
    move |source| BackupError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Collects container logs with a bounded worker pool.
pub struct LogBackup<'a, C: ?Sized> {
    cluster: &'a C,
    settings: BackupSettings,
    archiver: Option<&'a dyn CommandExecutor>,
}

impl<'a, C: ClusterApi + ?Sized> LogBackup<'a, C> {
    pub fn new(cluster: &'a C, settings: BackupSettings) -> Self {
        Self {
            cluster,
            settings,
            archiver: None,
        }
    }

    /// Archive the backup with `tar` through `executor`.
    #[must_use]
    pub fn with_archiver(mut self, executor: &'a dyn CommandExecutor) -> Self {
        self.archiver = Some(executor);
        self
    }

    /// Back up logs for `ticket`.
    pub async fn run(&self, ticket: &str) -> Result<BackupReport, BackupError> {
        let started = Instant::now();
        let timestamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let ticket_dir = self
            .settings
            .root
            .join(self.cluster.namespace())
            .join(ticket);
        let directory = ticket_dir.join(&timestamp);
        tokio::fs::create_dir_all(&directory)
            .await
            .map_err(io_error(&directory))?;
        ui::print_progress(&format!("Backup directory: {}", directory.display()));

        let pods = self.cluster.list_pods("").await?;
        let running: Vec<&Pod> = pods
            .iter()
            .filter(|p| {
                PodPhase::parse(p.status.as_ref().and_then(|s| s.phase.as_deref()))
                    == PodPhase::Running
            })
            .collect();
        ui::print_progress(&format!(
            "Collecting logs for {} running pods (out of {} total)",
            running.len(),
            pods.len()
        ));

        let mut results: Vec<PodBackup> = Vec::new();
        let mut tasks = Vec::new();
        for pod in running {
            let (backup, pod_tasks) = self.plan_pod(pod, &directory).await?;
            results.push(backup);
            tasks.extend(pod_tasks);
        }

        let fetched: Vec<(String, ContainerLog)> = stream::iter(tasks)
            .map(|task| self.collect(task))
            .buffer_unordered(self.settings.max_workers.max(1))
            .collect()
            .await;
        for (pod, log) in fetched {
            if let Some(entry) = results.iter_mut().find(|r| r.pod == pod) {
                entry.containers.push(log);
            }
        }
        for entry in &mut results {
            entry
                .containers
                .sort_by(|a, b| b.init.cmp(&a.init).then_with(|| a.container.cmp(&b.container)));
        }

        let archive = self.archive(&ticket_dir, &directory, &timestamp).await;
        let elapsed = started.elapsed();
        if elapsed > SLOW_BACKUP {
            warn!(
                elapsed_secs = elapsed.as_secs(),
                max_workers = self.settings.max_workers,
                "Backup took longer than 5 minutes; consider raising max_workers"
            );
        }

        let report = BackupReport {
            directory,
            archive,
            pods_total: pods.len(),
            pods: results,
            elapsed_secs: elapsed.as_secs(),
        };
        info!(
            pods = report.pods.len(),
            collected = report.collected(),
            elapsed_secs = report.elapsed_secs,
            "Log backup finished"
        );
        Ok(report)
    }

    /// Work out which containers of `pod` to fetch and create their folders.
    async fn plan_pod(
        &self,
        pod: &Pod,
        directory: &Path,
    ) -> Result<(PodBackup, Vec<LogTask>), BackupError> {
        let name = pod.metadata.name.clone().unwrap_or_default();
        let pod_dir = directory.join(&name);
        let spec = pod.spec.as_ref();
        let status = pod.status.as_ref();

        let groups = [
            (
                false,
                spec.map(|s| s.containers.as_slice()).unwrap_or_default(),
                status.and_then(|s| s.container_statuses.as_deref()),
            ),
            (
                true,
                spec.and_then(|s| s.init_containers.as_deref())
                    .unwrap_or_default(),
                status.and_then(|s| s.init_container_statuses.as_deref()),
            ),
        ];

        let mut backup = PodBackup {
            pod: name.clone(),
            containers: Vec::new(),
        };
        let mut tasks = Vec::new();
        for (init, containers, statuses) in groups {
            for container in containers {
                let state = statuses
                    .unwrap_or_default()
                    .iter()
                    .find(|s: &&ContainerStatus| s.name == container.name)
                    .and_then(|s| s.state.as_ref());
                match classify(state) {
                    Ok(folder) => {
                        let log_dir = pod_dir.join(folder.path());
                        tokio::fs::create_dir_all(&log_dir)
                            .await
                            .map_err(io_error(&log_dir))?;
                        tasks.push(LogTask {
                            pod: name.clone(),
                            container: container.name.clone(),
                            init,
                            file: log_dir.join(format!("{}.log", container.name)),
                        });
                    }
                    Err(reason) => {
                        debug!(pod = %name, container = %container.name, %reason, "Skipping container");
                        backup.containers.push(ContainerLog {
                            container: container.name.clone(),
                            init,
                            collected: false,
                            error: Some(reason.to_string()),
                        });
                    }
                }
            }
        }
        Ok((backup, tasks))
    }

    async fn collect(&self, task: LogTask) -> (String, ContainerLog) {
        let kind = if task.init { "init container" } else { "container" };
        let error = match self.cluster.pod_logs(&task.pod, &task.container).await {
            Ok(logs) => tokio::fs::write(&task.file, logs)
                .await
                .err()
                .map(|e| format!("Failed to write {}: {e}", task.file.display())),
            Err(e) => Some(format!(
                "Failed to collect logs for {kind} {}: {e}",
                task.container
            )),
        };
        if let Some(message) = &error {
            warn!(pod = %task.pod, container = %task.container, error = %message, "Log collection failed");
        }
        (
            task.pod,
            ContainerLog {
                container: task.container,
                init: task.init,
                collected: error.is_none(),
                error,
            },
        )
    }

    /// Archive `directory` next to it. Failure is logged, not fatal.
    async fn archive(&self, parent: &Path, directory: &Path, timestamp: &str) -> Option<PathBuf> {
        if !self.settings.archive {
            debug!("Archiving disabled");
            return None;
        }
        let executor = self.archiver?;
        let file = parent.join(format!("logs_backup_{timestamp}.tar.gz"));
        let cmd = ClusterCommand::new(
            "tar",
            [
                "-czf".to_string(),
                file.display().to_string(),
                "-C".to_string(),
                directory.display().to_string(),
                ".".to_string(),
            ],
        )
        .with_timeout(ARCHIVE_TIMEOUT);
        match executor.execute(&cmd).await {
            Ok(_) => {
                ui::print_success(&format!("Logs backed up to {}", file.display()));
                Some(file)
            }
            Err(e) => {
                warn!(error = %e, "Failed to archive log backup");
                ui::print_warning(&format!("Archive failed: {e}"));
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{CommandResult, MockCommandExecutor};
    use crate::testing::{pod, ContainerFixture, FakeCluster};
    use k8s_openapi::api::core::v1::{
        ContainerStateRunning, ContainerStateTerminated, ContainerStateWaiting,
    };

    fn terminated(reason: &str) -> ContainerState {
        ContainerState {
            terminated: Some(ContainerStateTerminated {
                reason: Some(reason.to_string()),
                exit_code: 1,
                ..ContainerStateTerminated::default()
            }),
            ..ContainerState::default()
        }
    }

    #[test]
    fn test_classify_container_states() {
        let running = ContainerState {
            running: Some(ContainerStateRunning::default()),
            ..ContainerState::default()
        };
        let waiting = ContainerState {
            waiting: Some(ContainerStateWaiting::default()),
            ..ContainerState::default()
        };

        assert_eq!(classify(Some(&running)), Ok(LogFolder::Running));
        assert_eq!(classify(Some(&terminated("Completed"))), Ok(LogFolder::Terminated));
        assert_eq!(classify(Some(&terminated("OOMKilled"))), Ok(LogFolder::Error));
        assert_eq!(classify(Some(&waiting)), Err(SkipReason::Waiting));
        assert_eq!(classify(Some(&ContainerState::default())), Err(SkipReason::NoState));
        assert_eq!(classify(None), Err(SkipReason::NoState));
    }

    fn backup_cluster() -> FakeCluster {
        let cluster = FakeCluster::new("abcprod");
        cluster.set_pods(vec![
            pod(
                "sas-logon-app-1",
                "Running",
                &[
                    ContainerFixture::Ready,
                    ContainerFixture::Terminated(0),
                    ContainerFixture::Terminated(1),
                    ContainerFixture::CrashLoop,
                ],
            ),
            pod("sas-import-job-x", "Succeeded", &[ContainerFixture::Terminated(0)]),
        ]);
        {
            let mut state = cluster.state();
            for container in ["c0", "c1"] {
                state.logs.insert(
                    ("sas-logon-app-1".to_string(), container.to_string()),
                    format!("{container} log\n"),
                );
            }
        }
        cluster
    }

    #[tokio::test]
    async fn test_backup_writes_logs_by_state() {
        let cluster = backup_cluster();
        let root = tempfile::tempdir().expect("tempdir");
        let settings = BackupSettings {
            root: root.path().to_path_buf(),
            max_workers: 2,
            archive: true,
        };

        let report = LogBackup::new(&cluster, settings)
            .run("ABC-123")
            .await
            .expect("backup");

        assert_eq!(report.pods_total, 2);
        assert_eq!(report.pods.len(), 1);
        assert!(report.archive.is_none());
        assert!(report.directory.starts_with(root.path().join("abcprod").join("ABC-123")));

        let pod_dir = report.directory.join("sas-logon-app-1");
        let running = std::fs::read_to_string(pod_dir.join("Running/logs/c0.log")).expect("c0");
        assert_eq!(running, "c0 log\n");
        assert!(pod_dir.join("Terminated/logs/c1.log").exists());
        assert!(!pod_dir.join("Error/logs/c2.log").exists());

        let containers = &report.pods[0].containers;
        let names: Vec<_> = containers.iter().map(|c| c.container.as_str()).collect();
        assert_eq!(names, ["c0", "c1", "c2", "c3"]);
        assert_eq!(report.collected(), 2);
        assert!(containers[2].error.as_deref().is_some_and(|e| e.contains("c2")));
        assert_eq!(containers[3].error.as_deref(), Some("Waiting state"));
    }

    #[tokio::test]
    async fn test_backup_archives_with_tar() {
        let cluster = backup_cluster();
        let root = tempfile::tempdir().expect("tempdir");
        let settings = BackupSettings {
            root: root.path().to_path_buf(),
            max_workers: DEFAULT_MAX_WORKERS,
            archive: true,
        };
        let mut archiver = MockCommandExecutor::new();
        archiver
            .expect_execute()
            .withf(|cmd| {
                cmd.program() == "tar"
                    && cmd.args()[0] == "-czf"
                    && cmd.args()[1].ends_with(".tar.gz")
                    && cmd.args()[4] == "."
            })
            .times(1)
            .returning(|_| Ok(CommandResult::default()));

        let report = LogBackup::new(&cluster, settings)
            .with_archiver(&archiver)
            .run("ABC-123")
            .await
            .expect("backup");

        let archive = report.archive.expect("archive path");
        assert_eq!(archive.parent(), report.directory.parent());
    }

    #[tokio::test]
    async fn test_backup_skips_archive_when_disabled() {
        let cluster = backup_cluster();
        let root = tempfile::tempdir().expect("tempdir");
        let settings = BackupSettings {
            root: root.path().to_path_buf(),
            max_workers: DEFAULT_MAX_WORKERS,
            archive: false,
        };
        let mut archiver = MockCommandExecutor::new();
        archiver.expect_execute().times(0);

        let report = LogBackup::new(&cluster, settings)
            .with_archiver(&archiver)
            .run("ABC-123")
            .await
            .expect("backup");

        assert!(report.archive.is_none());
        assert_eq!(report.collected(), 2);
    }
}
