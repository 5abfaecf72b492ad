// Shared test helpers: scripted runtime and source fakes, temp store, wiring

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use fleetwarden::app_stats::AppStats;
use fleetwarden::clock::{Clock, ManualClock};
use fleetwarden::config::{LiveSettings, SettingsHandle};
use fleetwarden::deployer::{DeployerConfig, DeployerDeps, DeploymentOrchestrator, JobQueue};
use fleetwarden::docker_repo::{BuiltArtifact, RawStats, RunningUnit, RuntimeClient, UnitLaunch};
use fleetwarden::error::RuntimeError;
use fleetwarden::event_bus::EventBus;
use fleetwarden::git_repo::SourceFetcher;
use fleetwarden::models::{BuildDescriptor, Unit, UnitStatus};
use fleetwarden::store::Store;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const SECRET: &str = "test-secret";

pub fn settings() -> LiveSettings {
    LiveSettings {
        collect_interval_secs: 30,
        evaluate_interval_secs: 300,
        cpu_threshold: 80.0,
        memory_threshold: 85.0,
        max_concurrent_fetches: 4,
        max_retries: 2,
    }
}

pub fn start_time() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

pub async fn temp_store() -> (TempDir, Arc<Store>) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    let store = Store::connect(path.to_str().unwrap(), 7).await.unwrap();
    store.init().await.unwrap();
    (dir, Arc::new(store))
}

/// Stats whose CPU delta over system delta on `cpus` cores gives `cpu` percent.
pub fn raw_stats(cpu: f64, memory_used: u64, memory_limit: u64) -> RawStats {
    RawStats {
        cpu_total: (cpu * 10.0) as u64,
        precpu_total: 0,
        system_cpu: 1000,
        presystem_cpu: 0,
        online_cpus: 1,
        memory_usage: memory_used,
        memory_limit,
        networks: vec![],
    }
}

pub fn running(id: &str, name: &str) -> RunningUnit {
    RunningUnit {
        id: id.into(),
        name: name.into(),
    }
}

pub fn unit(name: &str, runtime_id: &str, repository: Option<&str>) -> Unit {
    Unit {
        runtime_id: runtime_id.into(),
        name: name.into(),
        image: format!("{}:old", name),
        repository: repository.map(String::from),
        branch: repository.map(|_| "main".to_string()),
        status: UnitStatus::Running,
        ports: vec![],
        env: BTreeMap::new(),
        volumes: vec![],
        auto_update: true,
        updated_at: start_time(),
    }
}

#[derive(Default)]
struct RuntimeScript {
    running: Vec<RunningUnit>,
    stats: HashMap<String, Result<RawStats, RuntimeError>>,
    slow: HashMap<String, Duration>,
    list_error: Option<RuntimeError>,
    build_failures: u32,
    build_error: Option<RuntimeError>,
    build_delay: Option<Duration>,
    stop_error: Option<RuntimeError>,
    stop_delay: Option<Duration>,
    start_error: Option<RuntimeError>,
    calls: Vec<String>,
}

/// Container runtime double. Every call is recorded as `op:arg`.
#[derive(Default)]
pub struct FakeRuntime {
    script: Mutex<RuntimeScript>,
    next_id: AtomicU32,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn script(&self) -> std::sync::MutexGuard<'_, RuntimeScript> {
        self.script.lock().unwrap()
    }

    pub fn add_running(&self, unit: RunningUnit, stats: Result<RawStats, RuntimeError>) {
        let mut s = self.script();
        s.stats.insert(unit.id.clone(), stats);
        s.running.push(unit);
    }

    /// Make `fetch_stats` for `id` hang for `delay`.
    pub fn slow_stats(&self, id: &str, delay: Duration) {
        self.script().slow.insert(id.into(), delay);
    }

    pub fn fail_list(&self, error: RuntimeError) {
        self.script().list_error = Some(error);
    }

    /// The next `n` builds fail with `error`.
    pub fn fail_builds(&self, n: u32, error: RuntimeError) {
        let mut s = self.script();
        s.build_failures = n;
        s.build_error = Some(error);
    }

    /// Every build hangs for `delay` before finishing.
    pub fn slow_builds(&self, delay: Duration) {
        self.script().build_delay = Some(delay);
    }

    pub fn fail_stop(&self, error: RuntimeError) {
        self.script().stop_error = Some(error);
    }

    pub fn slow_stop(&self, delay: Duration) {
        self.script().stop_delay = Some(delay);
    }

    pub fn fail_start(&self, error: RuntimeError) {
        self.script().start_error = Some(error);
    }

    pub fn calls(&self) -> Vec<String> {
        self.script().calls.clone()
    }

    pub fn count(&self, op: &str) -> usize {
        let prefix = format!("{}:", op);
        self.calls().iter().filter(|c| c.starts_with(&prefix)).count()
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.script().running.iter().any(|u| u.id == id)
    }
}

#[async_trait]
impl RuntimeClient for FakeRuntime {
    async fn list_running(&self) -> Result<Vec<RunningUnit>, RuntimeError> {
        let mut s = self.script();
        s.calls.push("list:".into());
        match &s.list_error {
            Some(e) => Err(e.clone()),
            None => Ok(s.running.clone()),
        }
    }

    async fn fetch_stats(&self, id: &str) -> Result<RawStats, RuntimeError> {
        let delay = {
            let mut s = self.script();
            s.calls.push(format!("stats:{}", id));
            s.slow.get(id).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.script()
            .stats
            .get(id)
            .cloned()
            .unwrap_or_else(|| Err(RuntimeError::NotFound(id.into())))
    }

    async fn stop_and_remove(&self, id: &str) -> Result<(), RuntimeError> {
        let delay = {
            let mut s = self.script();
            s.calls.push(format!("stop:{}", id));
            if let Some(e) = &s.stop_error {
                return Err(e.clone());
            }
            s.stop_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.script().running.retain(|u| u.id != id);
        Ok(())
    }

    async fn build(
        &self,
        _source_dir: &Path,
        descriptor: &BuildDescriptor,
        tag: &str,
    ) -> Result<BuiltArtifact, RuntimeError> {
        let delay = {
            let mut s = self.script();
            s.calls.push(format!("build:{}", tag));
            s.build_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut s = self.script();
        if s.build_failures > 0 {
            s.build_failures -= 1;
            if let Some(e) = &s.build_error {
                return Err(e.clone());
            }
        }
        Ok(match descriptor {
            BuildDescriptor::Dockerfile(_) => BuiltArtifact::Image { tag: tag.into() },
            BuildDescriptor::Compose(file) => BuiltArtifact::Compose {
                project: "test".into(),
                file: file.clone(),
                dir: file.parent().map(Path::to_path_buf).unwrap_or_default(),
            },
        })
    }

    async fn start(&self, launch: &UnitLaunch) -> Result<String, RuntimeError> {
        let mut s = self.script();
        s.calls.push(format!("start:{}", launch.name));
        if let Some(e) = &s.start_error {
            return Err(e.clone());
        }
        let id = format!("new-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        s.running.push(RunningUnit {
            id: id.clone(),
            name: launch.name.clone(),
        });
        Ok(id)
    }
}

/// Source fetcher double: writes a Dockerfile (or nothing) into the destination.
pub struct FakeSource {
    pub with_dockerfile: bool,
    failures_left: AtomicU32,
    fetches: AtomicU32,
}

impl FakeSource {
    pub fn new(with_dockerfile: bool) -> Arc<Self> {
        Arc::new(Self {
            with_dockerfile,
            failures_left: AtomicU32::new(0),
            fetches: AtomicU32::new(0),
        })
    }

    pub fn fail_times(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn fetches(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceFetcher for FakeSource {
    async fn fetch(
        &self,
        repository: &str,
        _branch: &str,
        _commit: Option<&str>,
        dest: &Path,
    ) -> Result<(), RuntimeError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(RuntimeError::CommandFailed {
                command: "git clone".into(),
                code: Some(128),
                stderr: format!("could not read from {}", repository),
            });
        }
        tokio::fs::create_dir_all(dest).await.unwrap();
        if self.with_dockerfile {
            tokio::fs::write(dest.join("Dockerfile"), "FROM scratch\n")
                .await
                .unwrap();
        }
        Ok(())
    }
}

/// Everything a deployer test needs, wired against the fakes.
pub struct DeployHarness {
    pub dir: TempDir,
    pub store: Arc<Store>,
    pub bus: Arc<EventBus>,
    pub runtime: Arc<FakeRuntime>,
    pub source: Arc<FakeSource>,
    pub settings: SettingsHandle,
    pub clock: Arc<ManualClock>,
    pub stats: Arc<AppStats>,
    pub orchestrator: Arc<DeploymentOrchestrator>,
    pub queue: Option<JobQueue>,
}

impl DeployHarness {
    pub async fn new(source: Arc<FakeSource>) -> Self {
        Self::with_queue_capacity(source, 16).await
    }

    pub async fn with_queue_capacity(source: Arc<FakeSource>, queue_capacity: usize) -> Self {
        Self::with_config(source, |c| c.queue_capacity = queue_capacity).await
    }

    /// Harness with short test timeouts, adjusted by `tweak`.
    pub async fn with_config(
        source: Arc<FakeSource>,
        tweak: impl FnOnce(&mut DeployerConfig),
    ) -> Self {
        let (dir, store) = temp_store().await;
        let bus = Arc::new(EventBus::new(64));
        let runtime = FakeRuntime::new();
        let settings = SettingsHandle::new(settings());
        let clock = Arc::new(ManualClock::new(start_time()));
        let stats = Arc::new(AppStats::default());
        let mut config = DeployerConfig {
            work_dir: dir.path().join("work"),
            retry_backoff: Duration::from_millis(1),
            clone_timeout: Duration::from_secs(5),
            build_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(5),
            start_timeout: Duration::from_secs(5),
            queue_capacity: 16,
            shutdown_grace: Duration::from_secs(5),
        };
        tweak(&mut config);
        let runtime_dyn: Arc<dyn RuntimeClient> = runtime.clone();
        let source_dyn: Arc<dyn SourceFetcher> = source.clone();
        let clock_dyn: Arc<dyn Clock> = clock.clone();
        let (orchestrator, queue) = DeploymentOrchestrator::new(
            DeployerDeps {
                store: store.clone(),
                bus: bus.clone(),
                runtime: runtime_dyn,
                source: source_dyn,
                settings: settings.clone(),
                clock: clock_dyn,
                stats: stats.clone(),
            },
            config,
        );
        Self {
            dir,
            store,
            bus,
            runtime,
            source,
            settings,
            clock,
            stats,
            orchestrator,
            queue: Some(queue),
        }
    }

    /// Start the job consumer; returns the shutdown sender and the consumer handle.
    pub fn start_consumer(
        &mut self,
    ) -> (tokio::sync::watch::Sender<bool>, tokio::task::JoinHandle<()>) {
        let (tx, rx) = tokio::sync::watch::channel(false);
        let queue = self.queue.take().expect("consumer already started");
        let handle = self.orchestrator.clone().spawn_consumer(queue, rx);
        (tx, handle)
    }

    /// Poll until the job row reaches a terminal state.
    pub async fn wait_terminal(&self, job_id: i64) -> fleetwarden::models::DeploymentJob {
        for _ in 0..500 {
            let job = self.store.get_job(job_id).await.unwrap().unwrap();
            if job.state.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} did not finish", job_id);
    }
}

/// Drain events until the completed/failed event for `job_id`; returns it and everything before.
pub async fn events_until_finished(
    rx: &mut tokio::sync::broadcast::Receiver<fleetwarden::models::DashboardEvent>,
    job_id: i64,
) -> (fleetwarden::models::DeploymentJob, Vec<fleetwarden::models::DashboardEvent>) {
    use fleetwarden::models::DashboardEvent;
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for job events")
            .expect("event bus closed");
        match event {
            DashboardEvent::DeploymentCompleted(job) | DashboardEvent::DeploymentFailed(job)
                if job.id == job_id =>
            {
                return (job, seen);
            }
            other => seen.push(other),
        }
    }
}
