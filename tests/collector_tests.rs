// MetricsCollector tests: batch shape, per-unit failure isolation, timeouts, writer

mod common;

use common::*;
use fleetwarden::app_stats::AppStats;
use fleetwarden::clock::{Clock, ManualClock};
use fleetwarden::collector::{MetricsCollector, spawn_sample_writer};
use fleetwarden::config::SettingsHandle;
use fleetwarden::docker_repo::RuntimeClient;
use fleetwarden::error::RuntimeError;
use fleetwarden::event_bus::EventBus;
use fleetwarden::models::DashboardEvent;
use std::sync::Arc;
use std::time::Duration;

fn collector(runtime: Arc<FakeRuntime>, bus: Arc<EventBus>, fetch_timeout: Duration) -> MetricsCollector {
    let runtime: Arc<dyn RuntimeClient> = runtime;
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(start_time()));
    MetricsCollector::new(
        runtime,
        bus,
        SettingsHandle::new(settings()),
        clock,
        fetch_timeout,
        Arc::new(AppStats::default()),
    )
}

#[tokio::test]
async fn failing_unit_becomes_error_sample_without_affecting_others() {
    let runtime = FakeRuntime::new();
    runtime.add_running(running("c1", "web"), Ok(raw_stats(80.0, 512, 1024)));
    runtime.add_running(
        running("c2", "db"),
        Err(RuntimeError::Api("connection reset".into())),
    );
    let bus = Arc::new(EventBus::new(16));
    let c = collector(runtime, bus.clone(), Duration::from_secs(1));

    let batch = c.collect().await.unwrap();

    assert_eq!(batch.sequence, 1);
    assert_eq!(batch.samples.len(), 2);
    assert_eq!(batch.samples[0].unit_name, "web");
    assert!((batch.samples[0].cpu_percent - 80.0).abs() < 1e-9);
    assert!((batch.samples[0].memory_percent - 50.0).abs() < 1e-9);
    assert!(batch.samples[1].is_error());
    assert_eq!(batch.samples[1].unit_name, "db");
    assert_eq!(batch.samples[1].cpu_percent, 0.0);
    assert_eq!(batch.error_count(), 1);

    let latest = bus.latest_batch().unwrap();
    assert_eq!(latest.sequence, 1);
}

#[tokio::test]
async fn sequence_increases_per_tick() {
    let runtime = FakeRuntime::new();
    runtime.add_running(running("c1", "web"), Ok(raw_stats(10.0, 1, 2)));
    let bus = Arc::new(EventBus::new(16));
    let c = collector(runtime, bus.clone(), Duration::from_secs(1));

    assert_eq!(c.collect().await.unwrap().sequence, 1);
    assert_eq!(c.collect().await.unwrap().sequence, 2);
    assert_eq!(bus.latest_batch().unwrap().sequence, 2);
}

#[tokio::test]
async fn list_failure_publishes_nothing() {
    let runtime = FakeRuntime::new();
    runtime.fail_list(RuntimeError::Api("daemon down".into()));
    let bus = Arc::new(EventBus::new(16));
    let mut rx = bus.subscribe();
    let c = collector(runtime, bus.clone(), Duration::from_secs(1));

    assert!(c.collect().await.is_err());
    assert!(bus.latest_batch().is_none());
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn slow_fetch_times_out_as_error_sample() {
    let runtime = FakeRuntime::new();
    runtime.add_running(running("c1", "web"), Ok(raw_stats(10.0, 1, 2)));
    runtime.add_running(running("c2", "slow"), Ok(raw_stats(10.0, 1, 2)));
    runtime.slow_stats("c2", Duration::from_secs(60));
    let bus = Arc::new(EventBus::new(16));
    let c = collector(runtime, bus, Duration::from_secs(2));

    let batch = c.collect().await.unwrap();

    assert!(!batch.samples[0].is_error());
    let slow = &batch.samples[1];
    assert!(slow.is_error());
    assert!(slow.error.as_deref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn empty_fleet_still_publishes_a_batch() {
    let runtime = FakeRuntime::new();
    let bus = Arc::new(EventBus::new(16));
    let mut rx = bus.subscribe();
    let c = collector(runtime, bus, Duration::from_secs(1));

    let batch = c.collect().await.unwrap();
    assert!(batch.samples.is_empty());
    match rx.recv().await.unwrap() {
        DashboardEvent::MetricsUpdate(b) => assert_eq!(b.sequence, batch.sequence),
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn writer_persists_only_ok_samples() {
    let (_dir, store) = temp_store().await;
    let runtime = FakeRuntime::new();
    runtime.add_running(running("c1", "web"), Ok(raw_stats(20.0, 100, 1000)));
    runtime.add_running(running("c2", "db"), Err(RuntimeError::NotFound("c2".into())));
    let bus = Arc::new(EventBus::new(16));
    let stats = Arc::new(AppStats::default());

    let (tx, rx) = tokio::sync::mpsc::channel(4);
    let writer = spawn_sample_writer(rx, store.clone(), stats.clone());
    let c = collector(runtime, bus, Duration::from_secs(1)).with_writer(tx);
    c.collect().await.unwrap();
    drop(c);
    writer.await.unwrap();

    assert_eq!(AppStats::get(&stats.samples_saved), 1);
    let from = start_time() - chrono::Duration::hours(1);
    let to = start_time() + chrono::Duration::hours(1);
    assert_eq!(store.unit_history("c1", from, to).await.unwrap().len(), 1);
    assert!(store.unit_history("c2", from, to).await.unwrap().is_empty());
}
