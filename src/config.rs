use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::CoreError;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub publishing: PublishingConfig,
    pub monitoring: MonitoringConfig,
    pub deploy: DeployConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_retention_days() -> u32 {
    7
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublishingConfig {
    /// Max number of dashboard events kept in the broadcast channel (slow clients may lag).
    pub broadcast_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_collect_interval_secs")]
    pub collect_interval_secs: u64,
    #[serde(default = "default_evaluate_interval_secs")]
    pub evaluate_interval_secs: u64,
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
    /// Per-unit stats call timeout; expiry counts as an isolated failure for that unit.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_cpu_threshold")]
    pub cpu_threshold: f64,
    #[serde(default = "default_memory_threshold")]
    pub memory_threshold: f64,
    /// How often to log app stats (ws clients, batches collected) at INFO level.
    pub stats_log_interval_secs: u64,
    #[serde(default = "default_prune_interval_secs")]
    pub prune_interval_secs: u64,
    /// Optional cron expression for VACUUM (e.g. "0 0 3 * * *"). Uses local time.
    #[serde(default)]
    pub vacuum_schedule: Option<String>,
    #[serde(default = "default_vacuum_interval_secs")]
    pub vacuum_interval_secs: u64,
}

fn default_collect_interval_secs() -> u64 {
    30
}

fn default_evaluate_interval_secs() -> u64 {
    300
}

fn default_max_concurrent_fetches() -> usize {
    8
}

fn default_fetch_timeout_secs() -> u64 {
    10
}

fn default_cpu_threshold() -> f64 {
    80.0
}

fn default_memory_threshold() -> f64 {
    85.0
}

fn default_prune_interval_secs() -> u64 {
    3600
}

fn default_vacuum_interval_secs() -> u64 {
    86_400
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeployConfig {
    /// Per-target checkouts live under this directory.
    pub work_dir: PathBuf,
    #[serde(default = "default_clone_base_url")]
    pub clone_base_url: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_clone_timeout_secs")]
    pub clone_timeout_secs: u64,
    #[serde(default = "default_build_timeout_secs")]
    pub build_timeout_secs: u64,
    /// Graceful stop plus removal of the previous instance.
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    #[serde(default = "default_start_timeout_secs")]
    pub start_timeout_secs: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// How long in-flight deployments may run after shutdown is requested.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_clone_base_url() -> String {
    "https://github.com".into()
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_clone_timeout_secs() -> u64 {
    300
}

fn default_build_timeout_secs() -> u64 {
    1800
}

fn default_stop_timeout_secs() -> u64 {
    60
}

fn default_start_timeout_secs() -> u64 {
    120
}

fn default_queue_capacity() -> usize {
    64
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub secret: String,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".into());
        let s = std::fs::read_to_string(&path)?;
        let mut config: AppConfig = toml::from_str(&s)?;
        if let Ok(secret) = std::env::var("WEBHOOK_SECRET") {
            config.webhook.secret = secret;
        }
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate config from a string (e.g. for tests).
    pub fn load_from_str(s: &str) -> anyhow::Result<Self> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.server.port > 0,
            "server.port must be between 1 and 65535, got {}",
            self.server.port
        );
        anyhow::ensure!(
            !self.database.path.is_empty(),
            "database.path must be non-empty"
        );
        anyhow::ensure!(
            self.database.retention_days > 0,
            "database.retention_days must be > 0, got {}",
            self.database.retention_days
        );
        anyhow::ensure!(
            self.publishing.broadcast_capacity > 0,
            "publishing.broadcast_capacity must be > 0, got {}",
            self.publishing.broadcast_capacity
        );
        anyhow::ensure!(
            self.monitoring.fetch_timeout_secs > 0,
            "monitoring.fetch_timeout_secs must be > 0, got {}",
            self.monitoring.fetch_timeout_secs
        );
        anyhow::ensure!(
            self.monitoring.stats_log_interval_secs > 0,
            "monitoring.stats_log_interval_secs must be > 0, got {}",
            self.monitoring.stats_log_interval_secs
        );
        anyhow::ensure!(
            self.monitoring.prune_interval_secs > 0,
            "monitoring.prune_interval_secs must be > 0, got {}",
            self.monitoring.prune_interval_secs
        );
        if let Some(schedule) = &self.monitoring.vacuum_schedule {
            anyhow::ensure!(
                schedule.parse::<cron::Schedule>().is_ok(),
                "monitoring.vacuum_schedule is not a valid cron expression: {}",
                schedule
            );
        }
        anyhow::ensure!(
            !self.deploy.work_dir.as_os_str().is_empty(),
            "deploy.work_dir must be non-empty"
        );
        anyhow::ensure!(
            self.deploy.queue_capacity > 0,
            "deploy.queue_capacity must be > 0, got {}",
            self.deploy.queue_capacity
        );
        anyhow::ensure!(
            self.deploy.clone_timeout_secs > 0
                && self.deploy.build_timeout_secs > 0
                && self.deploy.stop_timeout_secs > 0
                && self.deploy.start_timeout_secs > 0,
            "deploy.*_timeout_secs must be > 0"
        );
        anyhow::ensure!(
            !self.webhook.secret.is_empty(),
            "webhook.secret must be non-empty (set it in config or WEBHOOK_SECRET)"
        );
        self.live_settings()
            .validate()
            .map_err(|e| anyhow::anyhow!("{}", e))?;
        Ok(())
    }

    /// Initial value of the settings that can change while running.
    pub fn live_settings(&self) -> LiveSettings {
        LiveSettings {
            collect_interval_secs: self.monitoring.collect_interval_secs,
            evaluate_interval_secs: self.monitoring.evaluate_interval_secs,
            cpu_threshold: self.monitoring.cpu_threshold,
            memory_threshold: self.monitoring.memory_threshold,
            max_concurrent_fetches: self.monitoring.max_concurrent_fetches,
            max_retries: self.deploy.max_retries,
        }
    }
}

/// Settings mutable without restart. The webhook secret is deliberately not among them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveSettings {
    pub collect_interval_secs: u64,
    pub evaluate_interval_secs: u64,
    pub cpu_threshold: f64,
    pub memory_threshold: f64,
    pub max_concurrent_fetches: usize,
    pub max_retries: u32,
}

/// Partial update; absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsUpdate {
    pub collect_interval_secs: Option<u64>,
    pub evaluate_interval_secs: Option<u64>,
    pub cpu_threshold: Option<f64>,
    pub memory_threshold: Option<f64>,
    pub max_concurrent_fetches: Option<usize>,
    pub max_retries: Option<u32>,
}

impl LiveSettings {
    pub fn collect_interval(&self) -> Duration {
        Duration::from_secs(self.collect_interval_secs)
    }

    pub fn evaluate_interval(&self) -> Duration {
        Duration::from_secs(self.evaluate_interval_secs)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        for (key, value) in [
            ("cpu_threshold", self.cpu_threshold),
            ("memory_threshold", self.memory_threshold),
        ] {
            if !value.is_finite() || value <= 0.0 || value > 100.0 {
                return Err(CoreError::Configuration(format!(
                    "{} must be in (0, 100], got {}",
                    key, value
                )));
            }
        }
        if self.collect_interval_secs == 0 || self.evaluate_interval_secs == 0 {
            return Err(CoreError::Configuration(
                "collect/evaluate intervals must be > 0".into(),
            ));
        }
        if self.max_concurrent_fetches == 0 {
            return Err(CoreError::Configuration(
                "max_concurrent_fetches must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn merged(&self, update: &SettingsUpdate) -> Self {
        Self {
            collect_interval_secs: update
                .collect_interval_secs
                .unwrap_or(self.collect_interval_secs),
            evaluate_interval_secs: update
                .evaluate_interval_secs
                .unwrap_or(self.evaluate_interval_secs),
            cpu_threshold: update.cpu_threshold.unwrap_or(self.cpu_threshold),
            memory_threshold: update.memory_threshold.unwrap_or(self.memory_threshold),
            max_concurrent_fetches: update
                .max_concurrent_fetches
                .unwrap_or(self.max_concurrent_fetches),
            max_retries: update.max_retries.unwrap_or(self.max_retries),
        }
    }
}

/// Shared handle to the live settings; every component reads the current value per tick.
#[derive(Clone)]
pub struct SettingsHandle {
    tx: Arc<watch::Sender<LiveSettings>>,
}

impl SettingsHandle {
    pub fn new(initial: LiveSettings) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> LiveSettings {
        self.tx.borrow().clone()
    }

    /// Validate and apply a partial update. Invalid updates leave the settings untouched.
    pub fn update(&self, update: &SettingsUpdate) -> Result<LiveSettings, CoreError> {
        let next = self.current().merged(update);
        next.validate()?;
        self.tx.send_replace(next.clone());
        tracing::info!(settings = ?next, "live settings updated");
        Ok(next)
    }
}
