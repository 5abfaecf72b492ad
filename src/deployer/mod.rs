// Deployment orchestration: submission with the single-flight guard, the job queue and
// its consumer. The per-job state machine lives in `job`.

mod descriptor;
mod job;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::Instrument;

use crate::app_stats::AppStats;
use crate::clock::Clock;
use crate::config::{DeployConfig, SettingsHandle};
use crate::docker_repo::RuntimeClient;
use crate::error::CoreError;
use crate::event_bus::EventBus;
use crate::git_repo::SourceFetcher;
use crate::models::{
    DEFAULT_BRANCH, DashboardEvent, DeploymentJob, DeploymentTrigger, NewDeploymentJob, Unit,
    UnitDefinition, UnitStatus,
};
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct DeployerConfig {
    pub work_dir: PathBuf,
    pub retry_backoff: Duration,
    pub clone_timeout: Duration,
    pub build_timeout: Duration,
    pub stop_timeout: Duration,
    pub start_timeout: Duration,
    pub queue_capacity: usize,
    pub shutdown_grace: Duration,
}

impl From<&DeployConfig> for DeployerConfig {
    fn from(c: &DeployConfig) -> Self {
        Self {
            work_dir: c.work_dir.clone(),
            retry_backoff: Duration::from_millis(c.retry_backoff_ms),
            clone_timeout: Duration::from_secs(c.clone_timeout_secs),
            build_timeout: Duration::from_secs(c.build_timeout_secs),
            stop_timeout: Duration::from_secs(c.stop_timeout_secs),
            start_timeout: Duration::from_secs(c.start_timeout_secs),
            queue_capacity: c.queue_capacity,
            shutdown_grace: Duration::from_secs(c.shutdown_grace_secs),
        }
    }
}

/// Collaborators of the orchestrator.
pub struct DeployerDeps {
    pub store: Arc<Store>,
    pub bus: Arc<EventBus>,
    pub runtime: Arc<dyn RuntimeClient>,
    pub source: Arc<dyn SourceFetcher>,
    pub settings: SettingsHandle,
    pub clock: Arc<dyn Clock>,
    pub stats: Arc<AppStats>,
}

/// Receiving end of the job queue; hand it to [`DeploymentOrchestrator::spawn_consumer`].
pub struct JobQueue(mpsc::Receiver<i64>);

pub struct DeploymentOrchestrator {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    runtime: Arc<dyn RuntimeClient>,
    source: Arc<dyn SourceFetcher>,
    settings: SettingsHandle,
    clock: Arc<dyn Clock>,
    stats: Arc<AppStats>,
    config: DeployerConfig,
    queue_tx: mpsc::Sender<i64>,
    /// Newest request per target that arrived while a job for it was active.
    pending: Mutex<HashMap<String, NewDeploymentJob>>,
}

impl DeploymentOrchestrator {
    pub fn new(deps: DeployerDeps, config: DeployerConfig) -> (Arc<Self>, JobQueue) {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let DeployerDeps {
            store,
            bus,
            runtime,
            source,
            settings,
            clock,
            stats,
        } = deps;
        let orchestrator = Arc::new(Self {
            store,
            bus,
            runtime,
            source,
            settings,
            clock,
            stats,
            config,
            queue_tx,
            pending: Mutex::new(HashMap::new()),
        });
        (orchestrator, JobQueue(queue_rx))
    }

    /// Persist a queued job and enqueue it. Never waits for the deployment itself.
    /// A target with a non-terminal job yields `StateConflict`.
    pub async fn submit(&self, request: NewDeploymentJob) -> Result<DeploymentJob, CoreError> {
        let now = self.clock.now();
        let Some(job) = self.store.insert_job(&request, now).await? else {
            return Err(CoreError::StateConflict(format!(
                "a deployment for {} is already in progress",
                request.target_key
            )));
        };
        tracing::info!(
            job_id = job.id,
            target = %job.target_key,
            commit = job.commit.as_deref().unwrap_or("HEAD"),
            trigger = job.trigger.as_str(),
            "deployment queued"
        );
        self.publish_status(&job);

        if let Err(e) = self.queue_tx.try_send(job.id) {
            let reason = format!("queued: [state_conflict] deployment queue unavailable: {}", e);
            self.store
                .update_job_state(job.id, crate::models::JobState::Failed, Some(&reason), now)
                .await?;
            return Err(CoreError::StateConflict("deployment queue is full".into()));
        }
        Ok(job)
    }

    /// Queue `request` behind the active job of its target; it is submitted once that job
    /// is terminal. A later request for the same target replaces an earlier one.
    /// Returns the job if the target turned out to be free already.
    pub async fn defer(&self, request: NewDeploymentJob) -> Result<Option<DeploymentJob>, CoreError> {
        let target_key = request.target_key.clone();
        let replaced = self.pending_map().insert(target_key.clone(), request);
        tracing::info!(
            target = %target_key,
            replaced = replaced.is_some(),
            "deployment deferred behind active job"
        );
        // The active job may have finished before the request was recorded.
        if self.store.active_job(&target_key).await?.is_none() {
            return self.submit_pending(&target_key).await;
        }
        Ok(None)
    }

    /// Submit the deferred request for `target_key`, if there is one.
    async fn submit_pending(&self, target_key: &str) -> Result<Option<DeploymentJob>, CoreError> {
        let request = self.pending_map().remove(target_key);
        let Some(request) = request else {
            return Ok(None);
        };
        match self.submit(request.clone()).await {
            Ok(job) => Ok(Some(job)),
            Err(CoreError::StateConflict(msg)) => {
                if self.store.active_job(target_key).await?.is_none() {
                    return Err(CoreError::StateConflict(msg));
                }
                // Another job took the target; it submits the request when it finishes.
                self.pending_map()
                    .entry(target_key.to_string())
                    .or_insert(request);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn pending_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, NewDeploymentJob>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register (or update) the unit a manual definition describes and submit a job for it.
    pub async fn deploy_definition(&self, def: UnitDefinition) -> Result<DeploymentJob, CoreError> {
        let name = def.name.trim();
        let repository = def.repository.trim();
        if name.is_empty() || repository.is_empty() {
            return Err(CoreError::Malformed(
                "unit definition needs a name and a repository".into(),
            ));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(CoreError::Malformed(format!("invalid unit name {:?}", name)));
        }
        let branch = def
            .branch
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .unwrap_or(DEFAULT_BRANCH);

        if let Some(other) = self.store.find_unit_by_source(repository, branch).await?
            && other.name != name
        {
            return Err(CoreError::StateConflict(format!(
                "{}@{} is already deployed as unit {}",
                repository, branch, other.name
            )));
        }
        let existing = self.store.get_unit(name).await?;
        if let Some(previous) = &existing
            && let Some(active) = self.store.active_job(&previous.target_key()).await?
        {
            return Err(CoreError::StateConflict(format!(
                "deployment {} for {} is still {}",
                active.id,
                active.target_key,
                active.state.as_str()
            )));
        }

        let now = self.clock.now();
        let unit = merge_definition(existing, &def, name, repository, branch, now);
        self.store.upsert_unit(&unit).await?;

        self.submit(NewDeploymentJob {
            target_key: unit.target_key(),
            unit_name: unit.name.clone(),
            repository: unit.repository.clone(),
            branch: unit.branch.clone(),
            commit: def.commit.clone().filter(|c| !c.is_empty()),
            trigger: DeploymentTrigger::Manual,
        })
        .await
    }

    fn publish_status(&self, job: &DeploymentJob) {
        self.bus.publish(DashboardEvent::DeploymentStatus {
            job_id: job.id,
            target_key: job.target_key.clone(),
            state: job.state,
        });
    }

    /// Drain the queue until shutdown, running each job in its own task. On shutdown,
    /// in-flight jobs get the grace period, then are aborted and marked failed.
    pub fn spawn_consumer(
        self: Arc<Self>,
        queue: JobQueue,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let JobQueue(mut rx) = queue;
        tokio::spawn(async move {
            let mut running: JoinSet<()> = JoinSet::new();
            loop {
                tokio::select! {
                    next = rx.recv() => {
                        let Some(job_id) = next else { break };
                        let orchestrator = self.clone();
                        let span = tracing::info_span!("deploy", job_id);
                        running.spawn(async move { orchestrator.run_job(job_id).await }.instrument(span));
                    }
                    Some(joined) = running.join_next(), if !running.is_empty() => {
                        if let Err(e) = joined
                            && e.is_panic()
                        {
                            tracing::error!(error = %e, "deployment task panicked");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            if !running.is_empty() {
                tracing::info!(
                    in_flight = running.len(),
                    grace_secs = self.config.shutdown_grace.as_secs(),
                    "waiting for in-flight deployments"
                );
                let drained = tokio::time::timeout(self.config.shutdown_grace, async {
                    while running.join_next().await.is_some() {}
                })
                .await;
                if drained.is_err() {
                    tracing::warn!(aborted = running.len(), "grace period over; aborting deployments");
                    running.abort_all();
                    while running.join_next().await.is_some() {}
                    match self.store.fail_interrupted_jobs(self.clock.now()).await {
                        Ok(n) => tracing::info!(jobs = n, "aborted deployments marked failed"),
                        Err(e) => tracing::warn!(error = %e, "failed to mark aborted deployments"),
                    }
                }
            }
            tracing::debug!("Deployment consumer shutting down");
        })
    }
}

/// Stored unit (if any) with the definition's fields applied. Env entries merge key by key.
fn merge_definition(
    existing: Option<Unit>,
    def: &UnitDefinition,
    name: &str,
    repository: &str,
    branch: &str,
    now: chrono::DateTime<chrono::Utc>,
) -> Unit {
    let mut unit = existing.unwrap_or_else(|| Unit {
        runtime_id: String::new(),
        name: name.to_string(),
        image: String::new(),
        repository: None,
        branch: None,
        status: UnitStatus::Created,
        ports: vec![],
        env: Default::default(),
        volumes: vec![],
        auto_update: true,
        updated_at: now,
    });
    unit.repository = Some(repository.to_string());
    unit.branch = Some(branch.to_string());
    if let Some(ports) = &def.ports {
        unit.ports = ports.clone();
    }
    unit.env
        .extend(def.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    if let Some(volumes) = &def.volumes {
        unit.volumes = volumes.clone();
    }
    if let Some(auto_update) = def.auto_update {
        unit.auto_update = auto_update;
    }
    unit.updated_at = now;
    unit
}
