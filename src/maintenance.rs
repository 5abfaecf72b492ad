// Background housekeeping: purge samples past retention, VACUUM on a schedule
// (cron expression or fixed interval), and the periodic app stats log line.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::app_stats::AppStats;
use crate::clock::Clock;
use crate::config::MonitoringConfig;
use crate::event_bus::EventBus;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub prune_interval: Duration,
    pub stats_log_interval: Duration,
    /// Optional cron expression for VACUUM (e.g. "0 0 3 * * *"). Uses local time.
    pub vacuum_schedule: Option<String>,
    /// Run VACUUM every interval when vacuum_schedule is not set.
    pub vacuum_interval: Duration,
}

impl From<&MonitoringConfig> for MaintenanceConfig {
    fn from(c: &MonitoringConfig) -> Self {
        Self {
            prune_interval: Duration::from_secs(c.prune_interval_secs),
            stats_log_interval: Duration::from_secs(c.stats_log_interval_secs),
            vacuum_schedule: c.vacuum_schedule.clone(),
            vacuum_interval: Duration::from_secs(c.vacuum_interval_secs),
        }
    }
}

pub struct MaintenanceDeps {
    pub store: Arc<Store>,
    pub bus: Arc<EventBus>,
    pub clock: Arc<dyn Clock>,
    pub stats: Arc<AppStats>,
}

pub fn spawn(
    deps: MaintenanceDeps,
    config: MaintenanceConfig,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        run(deps, config, shutdown).await;
    })
}

#[instrument(skip_all, fields(prune_interval_secs = config.prune_interval.as_secs()))]
async fn run(deps: MaintenanceDeps, config: MaintenanceConfig, mut shutdown: watch::Receiver<bool>) {
    let mut prune_tick = tokio::time::interval(config.prune_interval);
    prune_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut stats_log_tick = tokio::time::interval(config.stats_log_interval);
    stats_log_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let (vacuum_tx, mut vacuum_rx) = tokio::sync::mpsc::channel::<()>(1);
    let scheduler = tokio::spawn(vacuum_scheduler(config.clone(), vacuum_tx));

    loop {
        tokio::select! {
            _ = prune_tick.tick() => {
                prune_once(&deps).await;
            }
            Some(()) = vacuum_rx.recv() => {
                if let Err(e) = deps.store.vacuum().await {
                    warn!(error = %e, "vacuum failed");
                } else {
                    info!("vacuum complete");
                }
            }
            _ = stats_log_tick.tick() => {
                deps.stats.log(deps.bus.subscriber_count());
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    scheduler.abort();
    tracing::debug!("Maintenance shutting down");
}

/// Purge samples past retention. Failures are logged; the next tick retries.
pub async fn prune_once(deps: &MaintenanceDeps) {
    match deps.store.prune_samples(deps.clock.now()).await {
        Ok(n) => {
            AppStats::add(&deps.stats.samples_pruned, n);
            tracing::debug!(operation = "prune_samples", rows = n, "old samples pruned");
        }
        Err(e) => {
            warn!(error = %e, operation = "prune_samples", "Failed to prune old samples");
        }
    }
}

/// Sends a message on `tx` at each VACUUM time (cron or fixed interval). Uses local time for cron.
async fn vacuum_scheduler(config: MaintenanceConfig, tx: tokio::sync::mpsc::Sender<()>) {
    if let Some(ref cron_str) = config.vacuum_schedule {
        let Ok(schedule) = cron::Schedule::from_str(cron_str) else {
            warn!(cron = %cron_str, "invalid vacuum_schedule; VACUUM will not run");
            return;
        };
        loop {
            let now = chrono::Local::now();
            match schedule.after(&now).next() {
                Some(next) => {
                    let delay = (next - now).to_std().unwrap_or(Duration::from_secs(1));
                    tokio::time::sleep(delay).await;
                    if tx.send(()).await.is_err() {
                        break;
                    }
                }
                None => tokio::time::sleep(Duration::from_secs(3600)).await,
            }
        }
    } else {
        loop {
            tokio::time::sleep(config.vacuum_interval).await;
            if tx.send(()).await.is_err() {
                break;
            }
        }
    }
}
