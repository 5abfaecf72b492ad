// Process-wide counters reported in the periodic "app stats" log line.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct AppStats {
    pub batches_collected: AtomicU64,
    pub samples_saved: AtomicU64,
    pub samples_pruned: AtomicU64,
    pub alerts_created: AtomicU64,
    pub jobs_completed: AtomicU64,
    pub jobs_failed: AtomicU64,
}

impl AppStats {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub fn log(&self, dashboard_clients: usize) {
        tracing::info!(
            dashboard_clients,
            batches_collected = Self::get(&self.batches_collected),
            samples_saved = Self::get(&self.samples_saved),
            samples_pruned = Self::get(&self.samples_pruned),
            alerts_created = Self::get(&self.alerts_created),
            jobs_completed = Self::get(&self.jobs_completed),
            jobs_failed = Self::get(&self.jobs_failed),
            "app stats"
        );
    }
}
