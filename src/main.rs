use anyhow::Result;
use fleetwarden::clock::Clock;
use fleetwarden::*;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(
            w,
            "{}",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z")
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_timer(LocalTimer)
        .with_env_filter(filter)
        .init();

    let app_config = config::AppConfig::load()?;
    tracing::info!(name = version::NAME, version = version::VERSION, "starting");

    let clock: Arc<dyn clock::Clock> = Arc::new(clock::SystemClock);
    let stats = Arc::new(app_stats::AppStats::default());
    let bus = Arc::new(event_bus::EventBus::new(
        app_config.publishing.broadcast_capacity,
    ));
    let settings = config::SettingsHandle::new(app_config.live_settings());

    let store = Arc::new(
        store::Store::connect(
            &app_config.database.path,
            app_config.database.retention_days,
        )
        .await?,
    );
    store.init().await?;
    let interrupted = store.fail_interrupted_jobs(clock.now()).await?;
    if interrupted > 0 {
        tracing::warn!(jobs = interrupted, "marked deployments interrupted by restart as failed");
    }

    let docker = docker_repo::DockerRepo::connect()?;
    if let Err(e) = docker.ping().await {
        tracing::warn!(error = %e, "Docker daemon not reachable yet; collection will retry each tick");
    }
    let runtime: Arc<dyn docker_repo::RuntimeClient> = Arc::new(docker);
    let source: Arc<dyn git_repo::SourceFetcher> =
        Arc::new(git_repo::GitCli::new(app_config.deploy.clone_base_url.clone()));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let (write_tx, write_rx) = tokio::sync::mpsc::channel(collector::WRITER_CHANNEL_CAPACITY);
    let writer_handle = collector::spawn_sample_writer(write_rx, store.clone(), stats.clone());
    let collector = Arc::new(
        collector::MetricsCollector::new(
            runtime.clone(),
            bus.clone(),
            settings.clone(),
            clock.clone(),
            Duration::from_secs(app_config.monitoring.fetch_timeout_secs),
            stats.clone(),
        )
        .with_writer(write_tx),
    );
    let collector_handle = collector.spawn(shutdown_rx.clone());

    let evaluator = Arc::new(alert_evaluator::AlertEvaluator::new(
        store.clone(),
        bus.clone(),
        settings.clone(),
        clock.clone(),
        stats.clone(),
    ));
    let evaluator_handle = evaluator.spawn(shutdown_rx.clone());

    let (orchestrator, queue) = deployer::DeploymentOrchestrator::new(
        deployer::DeployerDeps {
            store: store.clone(),
            bus: bus.clone(),
            runtime: runtime.clone(),
            source,
            settings: settings.clone(),
            clock: clock.clone(),
            stats: stats.clone(),
        },
        deployer::DeployerConfig::from(&app_config.deploy),
    );
    let consumer_handle = orchestrator.clone().spawn_consumer(queue, shutdown_rx.clone());

    let maintenance_handle = maintenance::spawn(
        maintenance::MaintenanceDeps {
            store: store.clone(),
            bus: bus.clone(),
            clock: clock.clone(),
            stats: stats.clone(),
        },
        maintenance::MaintenanceConfig::from(&app_config.monitoring),
        shutdown_rx.clone(),
    );

    let gateway = Arc::new(webhook::WebhookGateway::new(
        app_config.webhook.secret.clone().into_bytes(),
        store.clone(),
        orchestrator.clone(),
    ));
    let app = routes::app(routes::AppState {
        store: store.clone(),
        bus: bus.clone(),
        settings,
        gateway,
        orchestrator,
        clock,
    });
    let addr = format!("{}:{}", app_config.server.host, app_config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on http://{}", addr);

    let mut server_shutdown = shutdown_rx.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = server_shutdown.wait_for(|stop| *stop).await;
    });
    tokio::select! {
        result = server => {
            result?;
        }
        _ = shutdown_signal() => {
            tracing::info!("Received shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = collector_handle.await;
    let _ = evaluator_handle.await;
    let _ = maintenance_handle.await;
    let _ = consumer_handle.await;
    // The periodic task held the last sender; the writer drains and exits.
    let _ = writer_handle.await;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(_) => {
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
