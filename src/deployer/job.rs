// One deployment job: cloning → building → stopping_old → starting_new → recording → completed.
// Clone and build are retried; stop and start are not, since a partial run already changed
// what is running.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{DeploymentOrchestrator, descriptor};
use crate::app_stats::AppStats;
use crate::docker_repo::{BuiltArtifact, UnitLaunch};
use crate::error::{CoreError, RuntimeError};
use crate::models::{
    AlertType, DashboardEvent, DeploymentJob, JobState, NewAlert, Severity, Unit, UnitStatus,
};

/// A step failure: the step it happened in and the error.
struct StepFailure {
    step: JobState,
    error: CoreError,
}

impl StepFailure {
    fn new(step: JobState, error: impl Into<CoreError>) -> Self {
        Self {
            step,
            error: error.into(),
        }
    }

    /// Persisted failure reason, e.g. `building: [transient_runtime] ...`.
    fn reason(&self) -> String {
        format!("{}: [{}] {}", self.step.as_str(), self.error.kind(), self.error)
    }
}

impl DeploymentOrchestrator {
    /// Run a queued job to a terminal state. Never returns an error: every failure ends
    /// up persisted on the job and published.
    pub(super) async fn run_job(&self, job_id: i64) {
        let mut job = match self.store.get_job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::warn!(job_id, "queued deployment job not found");
                return;
            }
            Err(e) => {
                tracing::warn!(job_id, error = %e, "failed to load deployment job");
                return;
            }
        };
        if job.state.is_terminal() {
            return;
        }

        let target_key = job.target_key.clone();
        let workspace = self.workspace_for(&job);
        let outcome = self.drive(&mut job, &workspace).await;
        if let Err(e) = tokio::fs::remove_dir_all(&workspace).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::debug!(error = %e, dir = %workspace.display(), "workspace cleanup failed");
        }

        match outcome {
            Ok(()) => {
                AppStats::add(&self.stats.jobs_completed, 1);
                tracing::info!(job_id = job.id, target = %job.target_key, "deployment completed");
                self.bus.publish(DashboardEvent::DeploymentCompleted(job));
            }
            Err(failure) => self.fail(&mut job, failure).await,
        }

        match self.submit_pending(&target_key).await {
            Ok(Some(next)) => tracing::info!(
                job_id = next.id,
                target = %target_key,
                commit = next.commit.as_deref().unwrap_or("HEAD"),
                "deferred deployment queued"
            ),
            Ok(None) => {}
            Err(e) => tracing::warn!(target = %target_key, error = %e, "deferred deployment not queued"),
        }
    }

    fn workspace_for(&self, job: &DeploymentJob) -> PathBuf {
        let dir: String = job
            .target_key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        self.config.work_dir.join(dir).join(job.id.to_string())
    }

    async fn drive(&self, job: &mut DeploymentJob, workspace: &Path) -> Result<(), StepFailure> {
        let unit = match self.store.get_unit(&job.unit_name).await {
            Ok(Some(unit)) => unit,
            Ok(None) => {
                return Err(StepFailure::new(
                    JobState::Queued,
                    CoreError::Configuration(format!("unit {} is not registered", job.unit_name)),
                ));
            }
            Err(e) => return Err(StepFailure::new(JobState::Queued, e)),
        };

        // cloning
        self.advance(job, JobState::Cloning).await?;
        let Some(repository) = job.repository.clone() else {
            return Err(StepFailure::new(
                JobState::Cloning,
                CoreError::Configuration(format!("unit {} has no source repository", unit.name)),
            ));
        };
        let branch = job
            .branch
            .clone()
            .unwrap_or_else(|| crate::models::DEFAULT_BRANCH.to_string());
        let commit = job.commit.clone();
        self.with_retries(JobState::Cloning, self.config.clone_timeout, "clone", || {
            let (repository, branch, commit) = (&repository, &branch, &commit);
            async move {
                reset_dir(workspace).await?;
                self.source
                    .fetch(repository, branch, commit.as_deref(), workspace)
                    .await?;
                Ok::<(), CoreError>(())
            }
        })
        .await?;

        // building
        self.advance(job, JobState::Building).await?;
        let Some(found) = descriptor::detect(workspace).await else {
            return Err(StepFailure::new(
                JobState::Building,
                CoreError::Configuration(
                    "no build descriptor (Dockerfile or compose file) in source tree".into(),
                ),
            ));
        };
        let tag = image_tag(&unit.name, job);
        let artifact = self
            .with_retries(JobState::Building, self.config.build_timeout, "build", || {
                let (found, tag) = (&found, &tag);
                async move { Ok::<_, CoreError>(self.runtime.build(workspace, found, tag).await?) }
            })
            .await?;

        // stopping_old
        self.advance(job, JobState::StoppingOld).await?;
        let removed_old = if unit.has_runtime_instance() {
            with_timeout(
                self.config.stop_timeout,
                "stop_and_remove",
                self.runtime.stop_and_remove(&unit.runtime_id),
            )
            .await
            .map_err(|e| StepFailure::new(JobState::StoppingOld, e))?;
            if let Err(e) = self
                .store
                .set_unit_status(&unit.name, UnitStatus::Stopped, self.clock.now())
                .await
            {
                tracing::warn!(unit = %unit.name, error = %e, "failed to record stopped status");
            }
            true
        } else {
            false
        };

        // starting_new
        self.advance(job, JobState::StartingNew).await?;
        let launch = UnitLaunch {
            name: unit.name.clone(),
            artifact: artifact.clone(),
            ports: unit.ports.clone(),
            env: unit.env.clone(),
            volumes: unit.volumes.clone(),
        };
        let runtime_id = match with_timeout(
            self.config.start_timeout,
            "start",
            self.runtime.start(&launch),
        )
        .await
        {
            Ok(id) => id,
            Err(e) if removed_old => {
                return Err(StepFailure::new(
                    JobState::StartingNew,
                    CoreError::IrrecoverableDeployment(format!(
                        "previous instance of {} was removed and the new one failed to start: {}",
                        unit.name, e
                    )),
                ));
            }
            Err(e) => return Err(StepFailure::new(JobState::StartingNew, e)),
        };

        // recording
        self.advance(job, JobState::Recording).await?;
        let recorded = recorded_unit(unit, runtime_id, &artifact, job, self.clock.now());
        self.record_unit(&recorded).await.map_err(|e| {
            StepFailure::new(
                JobState::Recording,
                CoreError::IrrecoverableDeployment(format!(
                    "{} started as {} but the unit record still points at the previous instance: {}",
                    recorded.name, recorded.runtime_id, e
                )),
            )
        })?;

        self.advance(job, JobState::Completed).await?;
        Ok(())
    }

    /// Point the unit record at the new instance. The instance is already running, so the
    /// write is retried whatever the error.
    async fn record_unit(&self, unit: &Unit) -> anyhow::Result<()> {
        let max_retries = self.settings.current().max_retries;
        let mut attempt: u32 = 0;
        loop {
            match self.store.upsert_unit(unit).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < max_retries => {
                    let backoff = self.config.retry_backoff * 2u32.saturating_pow(attempt);
                    tracing::warn!(
                        unit = %unit.name,
                        attempt = attempt + 1,
                        error = %e,
                        "unit record write failed; retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Persist and publish a transition.
    async fn advance(&self, job: &mut DeploymentJob, next: JobState) -> Result<(), StepFailure> {
        if !job.state.can_advance_to(next) {
            return Err(StepFailure::new(
                job.state,
                CoreError::StateConflict(format!(
                    "illegal transition {} -> {}",
                    job.state.as_str(),
                    next.as_str()
                )),
            ));
        }
        let now = self.clock.now();
        self.store
            .update_job_state(job.id, next, None, now)
            .await
            .map_err(|e| StepFailure::new(job.state, e))?;
        job.state = next;
        job.updated_at = now;
        if next.is_terminal() {
            job.finished_at = Some(now);
        }
        tracing::debug!(job_id = job.id, state = next.as_str(), "deployment advanced");
        self.publish_status(job);
        Ok(())
    }

    async fn fail(&self, job: &mut DeploymentJob, failure: StepFailure) {
        let reason = failure.reason();
        let now = self.clock.now();
        if let Err(e) = self
            .store
            .update_job_state(job.id, JobState::Failed, Some(&reason), now)
            .await
        {
            tracing::error!(job_id = job.id, error = %e, "failed to persist deployment failure");
        }
        job.state = JobState::Failed;
        job.reason = Some(reason.clone());
        job.updated_at = now;
        job.finished_at = Some(now);
        AppStats::add(&self.stats.jobs_failed, 1);
        tracing::warn!(job_id = job.id, target = %job.target_key, reason = %reason, "deployment failed");
        self.publish_status(job);
        self.bus.publish(DashboardEvent::DeploymentFailed(job.clone()));

        if matches!(failure.error, CoreError::IrrecoverableDeployment(_)) {
            self.surface_degraded(job, &reason).await;
        }
    }

    /// The unit is no longer running as recorded: mark it failed and raise a critical alert.
    async fn surface_degraded(&self, job: &DeploymentJob, reason: &str) {
        let now = self.clock.now();
        if let Err(e) = self
            .store
            .set_unit_status(&job.unit_name, UnitStatus::Failed, now)
            .await
        {
            tracing::warn!(unit = %job.unit_name, error = %e, "failed to record failed status");
        }
        let candidate = NewAlert {
            alert_type: AlertType::DeploymentDegraded,
            unit_id: job.unit_name.clone(),
            unit_name: job.unit_name.clone(),
            severity: Severity::Critical,
            message: format!("Deployment {} left {} degraded: {}", job.id, job.unit_name, reason),
        };
        let alert = match self
            .store
            .insert_alert_if_absent(&candidate, now, now - crate::alert_evaluator::dedup_window())
            .await
        {
            Ok(alert) => alert,
            Err(e) => {
                tracing::warn!(unit = %job.unit_name, error = %e, "failed to record degraded alert");
                None
            }
        };
        if let Some(alert) = &alert {
            AppStats::add(&self.stats.alerts_created, 1);
            self.bus.publish(DashboardEvent::AlertCreated(alert.clone()));
        }
        tracing::error!(job_id = job.id, unit = %job.unit_name, "deployment left unit degraded");
        self.bus.publish(DashboardEvent::DeploymentDegraded {
            job: job.clone(),
            alert,
        });
    }

    /// Run `op` with a per-attempt timeout, retrying retryable failures up to the live
    /// `max_retries` with exponential backoff.
    async fn with_retries<T, F, Fut>(
        &self,
        step: JobState,
        limit: Duration,
        operation: &'static str,
        mut op: F,
    ) -> Result<T, StepFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let max_retries = self.settings.current().max_retries;
        let mut attempt: u32 = 0;
        loop {
            let result = match tokio::time::timeout(limit, op()).await {
                Ok(r) => r,
                Err(_) => Err(RuntimeError::Timeout { operation, limit }.into()),
            };
            match result {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < max_retries => {
                    let backoff = self.config.retry_backoff * 2u32.saturating_pow(attempt);
                    tracing::warn!(
                        step = step.as_str(),
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "step failed; retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(StepFailure::new(step, e)),
            }
        }
    }
}

async fn with_timeout<T>(
    limit: Duration,
    operation: &'static str,
    fut: impl Future<Output = Result<T, RuntimeError>>,
) -> Result<T, CoreError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(r) => Ok(r?),
        Err(_) => Err(RuntimeError::Timeout { operation, limit }.into()),
    }
}

/// Empty `dir`, creating its parents. Leftovers from a failed attempt would break `git clone`.
async fn reset_dir(dir: &Path) -> Result<(), CoreError> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(CoreError::Configuration(format!(
                "cannot clear workspace {}: {}",
                dir.display(),
                e
            )));
        }
    }
    if let Some(parent) = dir.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            CoreError::Configuration(format!("cannot create {}: {}", parent.display(), e))
        })?;
    }
    Ok(())
}

/// `fleetwarden/<name>:<short sha>`, or the job id when the commit is unknown.
fn image_tag(unit_name: &str, job: &DeploymentJob) -> String {
    let version = job
        .commit
        .as_deref()
        .map(|c| c.chars().take(12).collect::<String>())
        .unwrap_or_else(|| format!("job-{}", job.id));
    format!("fleetwarden/{}:{}", unit_name.to_ascii_lowercase(), version)
}

fn recorded_unit(
    mut unit: Unit,
    runtime_id: String,
    artifact: &BuiltArtifact,
    job: &DeploymentJob,
    now: chrono::DateTime<chrono::Utc>,
) -> Unit {
    unit.runtime_id = runtime_id;
    unit.image = artifact.image_ref();
    unit.repository = job.repository.clone();
    unit.branch = job.branch.clone();
    unit.status = UnitStatus::Running;
    unit.updated_at = now;
    unit
}
