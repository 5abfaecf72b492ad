// Metrics collection: one tick lists running units, fetches their stats concurrently
// (bounded, per-call timeout), publishes the batch and hands it to the sample writer.

use futures_util::{StreamExt, stream};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::app_stats::AppStats;
use crate::clock::Clock;
use crate::config::SettingsHandle;
use crate::docker_repo::{RunningUnit, RuntimeClient};
use crate::error::RuntimeError;
use crate::event_bus::EventBus;
use crate::models::{MetricSample, MetricsBatch};
use crate::periodic::spawn_periodic;
use crate::store::Store;

/// Channel capacity for the sample writer (backpressure if writes fall behind).
pub const WRITER_CHANNEL_CAPACITY: usize = 32;

pub struct MetricsCollector {
    runtime: Arc<dyn RuntimeClient>,
    bus: Arc<EventBus>,
    settings: SettingsHandle,
    clock: Arc<dyn Clock>,
    fetch_timeout: Duration,
    write_tx: Option<mpsc::Sender<Arc<MetricsBatch>>>,
    stats: Arc<AppStats>,
    sequence: AtomicU64,
}

impl MetricsCollector {
    pub fn new(
        runtime: Arc<dyn RuntimeClient>,
        bus: Arc<EventBus>,
        settings: SettingsHandle,
        clock: Arc<dyn Clock>,
        fetch_timeout: Duration,
        stats: Arc<AppStats>,
    ) -> Self {
        Self {
            runtime,
            bus,
            settings,
            clock,
            fetch_timeout,
            write_tx: None,
            stats,
            sequence: AtomicU64::new(0),
        }
    }

    /// Send every published batch to a writer (see [`spawn_sample_writer`]).
    pub fn with_writer(mut self, write_tx: mpsc::Sender<Arc<MetricsBatch>>) -> Self {
        self.write_tx = Some(write_tx);
        self
    }

    /// One collection tick. Per-unit failures become error samples in the batch; only a
    /// failure to list the running units fails the tick, and then nothing is published.
    pub async fn collect(&self) -> Result<Arc<MetricsBatch>, RuntimeError> {
        let units = self.runtime.list_running().await?;
        let limit = self.settings.current().max_concurrent_fetches.max(1);

        // `buffered` keeps collection order while running up to `limit` fetches at once.
        let samples: Vec<MetricSample> = stream::iter(units)
            .map(|unit| self.fetch_one(unit))
            .buffered(limit)
            .collect()
            .await;

        let batch = MetricsBatch {
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed) + 1,
            collected_at: self.clock.now(),
            samples,
        };
        let errors = batch.error_count();
        let total = batch.samples.len();
        let batch = self.bus.publish_batch(batch);
        AppStats::add(&self.stats.batches_collected, 1);
        tracing::debug!(
            operation = "collect",
            sequence = batch.sequence,
            units = total,
            errors,
            "metrics batch published"
        );

        if let Some(write_tx) = &self.write_tx
            && write_tx.send(batch.clone()).await.is_err()
        {
            tracing::debug!("sample writer channel closed");
        }
        Ok(batch)
    }

    async fn fetch_one(&self, unit: RunningUnit) -> MetricSample {
        let result = tokio::time::timeout(self.fetch_timeout, self.runtime.fetch_stats(&unit.id))
            .await
            .unwrap_or(Err(RuntimeError::Timeout {
                operation: "fetch_stats",
                limit: self.fetch_timeout,
            }));
        let at = self.clock.now();
        match result {
            Ok(raw) => raw.into_sample(&unit.id, &unit.name, at),
            Err(e) => {
                tracing::warn!(
                    operation = "fetch_stats",
                    unit = %unit.name,
                    error = %e,
                    "stats fetch failed; recording error sample"
                );
                MetricSample::failed(&unit.id, &unit.name, at, e.to_string())
            }
        }
    }

    /// Run `collect` every `collect_interval` until shutdown. Errors are logged and the loop
    /// continues on the next tick.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let settings = self.settings.clone();
        spawn_periodic(
            "collector",
            move || settings.current().collect_interval(),
            shutdown,
            move || {
                let collector = self.clone();
                async move {
                    if let Err(e) = collector.collect().await {
                        tracing::warn!(operation = "list_running", error = %e, "collection tick skipped");
                    }
                }
            },
        )
    }
}

/// Spawns the task that persists each batch's non-error samples in one transaction.
/// Exits once every sender is dropped and the channel is drained.
pub fn spawn_sample_writer(
    mut write_rx: mpsc::Receiver<Arc<MetricsBatch>>,
    store: Arc<Store>,
    stats: Arc<AppStats>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(batch) = write_rx.recv().await {
            match store.save_samples(&batch.samples).await {
                Ok(n) => {
                    AppStats::add(&stats.samples_saved, n as u64);
                    tracing::debug!(
                        operation = "save_samples",
                        sequence = batch.sequence,
                        samples_count = n,
                        "samples saved"
                    );
                }
                Err(e) => {
                    tracing::warn!(error = %e, sequence = batch.sequence, "sample writer: save_samples failed");
                }
            }
        }
        tracing::debug!("Sample writer shutting down");
    })
}
