//! Stopping and starting a Viya environment.
//!
//! Viya 4 ships `sas-stop-all` and `sas-start-all` cronjobs. A stop or start
//! creates a one-off job from the cronjob and waits for it to finish.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::Local;
use k8s_openapi::api::batch::v1::Job;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cluster::ClusterApi;
use crate::error::{ClusterError, LifecycleError};
use crate::ui;
use crate::wait::wait_until;

/// Cronjob that stops every Viya deployment.
pub const STOP_CRONJOB: &str = "sas-stop-all";

/// Cronjob that starts every Viya deployment.
pub const START_CRONJOB: &str = "sas-start-all";

/// Timing for lifecycle jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleSettings {
    /// How long a stop or start job may run
    pub job_timeout: Duration,
    /// Poll interval while waiting for a job
    pub job_interval: Duration,
    /// Wait after the start job so pods can come up before health checks
    pub start_settle: Duration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            job_timeout: Duration::from_secs(900),
            job_interval: Duration::from_secs(10),
            start_settle: Duration::from_secs(60),
        }
    }
}

/// Where a job stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobState {
    Active,
    Succeeded,
    Failed,
}

impl JobState {
    /// Read the state from a job's status, preferring its conditions.
    #[must_use]
    pub fn of(job: &Job) -> Self {
        let Some(status) = job.status.as_ref() else {
            return Self::Active;
        };
        for condition in status.conditions.iter().flatten() {
            if condition.status != "True" {
                continue;
            }
            match condition.type_.as_str() {
                "Complete" => return Self::Succeeded,
                "Failed" => return Self::Failed,
                _ => {}
            }
        }
        if status.succeeded.unwrap_or(0) > 0 {
            Self::Succeeded
        } else if status.failed.unwrap_or(0) > 0 && status.active.unwrap_or(0) == 0 {
            Self::Failed
        } else {
            Self::Active
        }
    }

    /// Succeeded or failed.
    #[must_use]
    pub fn is_finished(self) -> bool {
        self != Self::Active
    }
}

/// Jobs removed by [`EnvironmentLifecycle::delete_finished_jobs`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobCleanup {
    /// Jobs deleted
    pub deleted: Vec<String>,
    /// Jobs that could not be deleted
    pub failed: Vec<String>,
}

/// Name for a job created from `cronjob` now.
fn job_name(cronjob: &str) -> String {
    format!("{cronjob}-{}", Local::now().format("%Y%m%d%H%M%S"))
}

/// Stops, starts and tidies up an environment.
pub struct EnvironmentLifecycle<'a, C: ?Sized> {
    cluster: &'a C,
    settings: LifecycleSettings,
}

impl<'a, C: ClusterApi + ?Sized> EnvironmentLifecycle<'a, C> {
    pub fn new(cluster: &'a C, settings: LifecycleSettings) -> Self {
        Self { cluster, settings }
    }

    /// Stop the environment. Returns the name of the stop job.
    pub async fn stop(&self) -> Result<String, LifecycleError> {
        self.run_cronjob(STOP_CRONJOB).await
    }

    /// Start the environment and give pods time to come up. Returns the
    /// name of the start job.
    pub async fn start(&self) -> Result<String, LifecycleError> {
        let job = self.run_cronjob(START_CRONJOB).await?;
        ui::print_progress(&format!(
            "Waiting {}s for pods to come up",
            self.settings.start_settle.as_secs()
        ));
        tokio::time::sleep(self.settings.start_settle).await;
        Ok(job)
    }

    async fn run_cronjob(&self, cronjob: &str) -> Result<String, LifecycleError> {
        let job = job_name(cronjob);
        ui::print_progress(&format!("Creating job {job} from cronjob/{cronjob}"));
        self.cluster.create_job_from_cronjob(cronjob, &job).await?;
        info!(namespace = self.cluster.namespace(), cronjob, job = %job, "Lifecycle job created");
        self.wait_for_job(&job).await?;
        ui::print_success(&format!("Job {job} completed"));
        Ok(job)
    }

    /// Wait for a job to succeed.
    pub async fn wait_for_job(&self, job: &str) -> Result<(), LifecycleError> {
        let cluster = self.cluster;
        let last = Mutex::new(None::<JobState>);
        let last_seen = &last;

        wait_until(
            self.settings.job_timeout,
            self.settings.job_interval,
            move || async move {
                let state = match cluster.list_jobs().await {
                    Ok(jobs) => jobs
                        .iter()
                        .find(|j| j.metadata.name.as_deref() == Some(job))
                        .map(JobState::of),
                    Err(e) => {
                        warn!(job, error = %e, "Could not read job status");
                        None
                    }
                };
                debug!(job, ?state, "Polled job");
                *last_seen.lock().unwrap_or_else(PoisonError::into_inner) = state;
                state.is_some_and(JobState::is_finished)
            },
        )
        .await;

        match last.into_inner().unwrap_or_else(PoisonError::into_inner) {
            Some(JobState::Succeeded) => Ok(()),
            Some(JobState::Failed) => Err(LifecycleError::JobFailed {
                job: job.to_string(),
            }),
            _ => Err(LifecycleError::JobTimedOut {
                job: job.to_string(),
                timeout: self.settings.job_timeout,
            }),
        }
    }

    /// Delete every job that has finished, leaving running ones alone.
    /// A job that cannot be deleted is recorded and skipped.
    pub async fn delete_finished_jobs(&self) -> Result<JobCleanup, ClusterError> {
        let jobs = self.cluster.list_jobs().await?;
        let mut cleanup = JobCleanup::default();

        for job in jobs.iter().filter(|j| JobState::of(j).is_finished()) {
            let Some(name) = job.metadata.name.as_deref() else {
                continue;
            };
            match self.cluster.delete_job(name).await {
                Ok(()) => {
                    info!(job = name, "Deleted finished job");
                    cleanup.deleted.push(name.to_string());
                }
                Err(e) => {
                    warn!(job = name, error = %e, "Failed to delete job");
                    cleanup.failed.push(name.to_string());
                }
            }
        }

        ui::print_progress(&format!(
            "Deleted {} finished job(s), {} failed",
            cleanup.deleted.len(),
            cleanup.failed.len()
        ));
        Ok(cleanup)
    }
}
