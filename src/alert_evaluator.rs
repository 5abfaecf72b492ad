// Threshold alerts over the latest published metrics batch.
// The evaluator only creates alerts; resolution is an operator action.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::app_stats::AppStats;
use crate::clock::Clock;
use crate::config::{LiveSettings, SettingsHandle};
use crate::error::CoreError;
use crate::event_bus::EventBus;
use crate::models::{Alert, AlertType, DashboardEvent, MetricSample, NewAlert, Severity, UnitStatus};
use crate::periodic::spawn_periodic;
use crate::store::Store;

/// An unresolved alert suppresses identical candidates for this long after its creation.
pub const DEDUP_WINDOW_SECS: i64 = 3600;

pub fn dedup_window() -> chrono::Duration {
    chrono::Duration::seconds(DEDUP_WINDOW_SECS)
}

#[derive(Debug, Default)]
pub struct EvaluationReport {
    /// Sequence of the batch that was evaluated, `None` if nothing was published yet.
    pub batch_sequence: Option<u64>,
    pub evaluated: usize,
    pub created: Vec<Alert>,
    pub suppressed: usize,
    pub failed: usize,
}

pub struct AlertEvaluator {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    settings: SettingsHandle,
    clock: Arc<dyn Clock>,
    stats: Arc<AppStats>,
    /// Serializes check-then-insert per unit across overlapping ticks.
    unit_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl AlertEvaluator {
    pub fn new(
        store: Arc<Store>,
        bus: Arc<EventBus>,
        settings: SettingsHandle,
        clock: Arc<dyn Clock>,
        stats: Arc<AppStats>,
    ) -> Self {
        Self {
            store,
            bus,
            settings,
            clock,
            stats,
            unit_locks: Mutex::new(HashMap::new()),
        }
    }

    fn unit_lock(&self, unit_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.unit_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(unit_id.to_string()).or_default().clone()
    }

    /// Drop the map entry once no other tick holds or waits on it. Runtime ids change
    /// with every redeploy.
    fn release_unit_lock(&self, unit_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.unit_locks.lock().unwrap_or_else(|e| e.into_inner());
        if Arc::strong_count(&lock) == 2 {
            locks.remove(unit_id);
        }
    }

    /// Evaluate the most recently completed batch against the current thresholds.
    pub async fn evaluate(&self) -> Result<EvaluationReport, CoreError> {
        let Some(batch) = self.bus.latest_batch() else {
            return Ok(EvaluationReport::default());
        };
        let settings = self.settings.current();
        let now = self.clock.now();
        let window_start = now - dedup_window();

        // Units this service manages carry their own status; anything else came from the
        // runtime's running list and counts as running.
        let status_by_runtime_id: HashMap<String, UnitStatus> = self
            .store
            .list_units()
            .await?
            .into_iter()
            .filter(|u| u.has_runtime_instance())
            .map(|u| (u.runtime_id, u.status))
            .collect();
        let mut open: HashSet<(AlertType, String)> = self.store.open_alert_keys(window_start).await?;

        let mut report = EvaluationReport {
            batch_sequence: Some(batch.sequence),
            ..Default::default()
        };
        for sample in batch.ok_samples() {
            if status_by_runtime_id
                .get(&sample.unit_id)
                .is_some_and(|s| *s != UnitStatus::Running)
            {
                continue;
            }
            report.evaluated += 1;
            for candidate in candidates(sample, &settings) {
                let key = (candidate.alert_type, candidate.unit_id.clone());
                if open.contains(&key) {
                    report.suppressed += 1;
                    continue;
                }
                let lock = self.unit_lock(&candidate.unit_id);
                let inserted = {
                    let _guard = lock.lock().await;
                    self.store
                        .insert_alert_if_absent(&candidate, now, window_start)
                        .await
                };
                self.release_unit_lock(&candidate.unit_id, lock);
                match inserted {
                    Ok(Some(alert)) => {
                        tracing::info!(
                            alert_id = alert.id,
                            alert_type = alert.alert_type.as_str(),
                            unit = %alert.unit_name,
                            message = %alert.message,
                            "alert created"
                        );
                        AppStats::add(&self.stats.alerts_created, 1);
                        self.bus.publish(DashboardEvent::AlertCreated(alert.clone()));
                        open.insert(key);
                        report.created.push(alert);
                    }
                    Ok(None) => {
                        open.insert(key);
                        report.suppressed += 1;
                    }
                    Err(e) => {
                        tracing::warn!(
                            operation = "insert_alert",
                            unit = %candidate.unit_name,
                            error = %e,
                            "alert insert failed"
                        );
                        report.failed += 1;
                    }
                }
            }
        }
        Ok(report)
    }

    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let settings = self.settings.clone();
        spawn_periodic(
            "alert_evaluator",
            move || settings.current().evaluate_interval(),
            shutdown,
            move || {
                let evaluator = self.clone();
                async move {
                    match evaluator.evaluate().await {
                        Ok(report) => tracing::debug!(
                            operation = "evaluate",
                            batch = ?report.batch_sequence,
                            evaluated = report.evaluated,
                            created = report.created.len(),
                            suppressed = report.suppressed,
                            "evaluation tick done"
                        ),
                        Err(e) => tracing::warn!(operation = "evaluate", error = %e, "evaluation tick failed"),
                    }
                }
            },
        )
    }
}

/// Threshold rules for one sample. Strictly greater than the threshold triggers.
pub fn candidates(sample: &MetricSample, settings: &LiveSettings) -> Vec<NewAlert> {
    let mut out = Vec::new();
    if sample.cpu_percent > settings.cpu_threshold {
        out.push(NewAlert {
            alert_type: AlertType::HighCpu,
            unit_id: sample.unit_id.clone(),
            unit_name: sample.unit_name.clone(),
            severity: Severity::Warning,
            message: format!(
                "Container {} CPU usage is {:.2}%",
                sample.unit_name, sample.cpu_percent
            ),
        });
    }
    if sample.memory_percent > settings.memory_threshold {
        out.push(NewAlert {
            alert_type: AlertType::HighMemory,
            unit_id: sample.unit_id.clone(),
            unit_name: sample.unit_name.clone(),
            severity: Severity::Warning,
            message: format!(
                "Container {} memory usage is {:.2}%",
                sample.unit_name, sample.memory_percent
            ),
        });
    }
    out
}
