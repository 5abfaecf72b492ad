// In-process fan-out of dashboard events, plus the latest completed metrics batch.

use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::time::{Duration, Instant};

use crate::models::{DashboardEvent, MetricsBatch};

/// Rate limit for "no receivers" log (avoid logging every tick when no dashboard is open)
const NO_RECEIVERS_WARN_INTERVAL: Duration = Duration::from_secs(60);

pub struct EventBus {
    events: broadcast::Sender<DashboardEvent>,
    latest_batch: watch::Sender<Option<Arc<MetricsBatch>>>,
    last_no_receivers_warn: Mutex<Option<Instant>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        let (latest_batch, _) = watch::channel(None);
        Self {
            events,
            latest_batch,
            last_no_receivers_warn: Mutex::new(None),
        }
    }

    /// Join the dashboard broadcast group.
    pub fn subscribe(&self) -> broadcast::Receiver<DashboardEvent> {
        self.events.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }

    /// Publish to every subscriber. Returns how many received it.
    pub fn publish(&self, event: DashboardEvent) -> usize {
        let kind = event.kind();
        match self.events.send(event) {
            Ok(n) => n,
            Err(_) => {
                let mut last = self
                    .last_no_receivers_warn
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                if last.is_none_or(|t| t.elapsed() >= NO_RECEIVERS_WARN_INTERVAL) {
                    tracing::debug!(
                        operation = "publish",
                        kind,
                        "No dashboard subscribers; broadcast channel has no receivers"
                    );
                    *last = Some(Instant::now());
                }
                0
            }
        }
    }

    /// Make `batch` the latest completed batch, then broadcast it.
    /// The slot is replaced atomically so readers never observe a partial batch.
    pub fn publish_batch(&self, batch: MetricsBatch) -> Arc<MetricsBatch> {
        let batch = Arc::new(batch);
        self.latest_batch.send_replace(Some(batch.clone()));
        self.publish(DashboardEvent::MetricsUpdate(batch.clone()));
        batch
    }

    pub fn latest_batch(&self) -> Option<Arc<MetricsBatch>> {
        self.latest_batch.borrow().clone()
    }
}
