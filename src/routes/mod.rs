// HTTP + WebSocket routes

mod http;
mod ws;

use axum::{
    Router,
    routing::{get, patch, post},
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::clock::Clock;
use crate::config::SettingsHandle;
use crate::deployer::DeploymentOrchestrator;
use crate::event_bus::EventBus;
use crate::store::Store;
use crate::webhook::WebhookGateway;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub bus: Arc<EventBus>,
    pub settings: SettingsHandle,
    pub gateway: Arc<WebhookGateway>,
    pub orchestrator: Arc<DeploymentOrchestrator>,
    pub clock: Arc<dyn Clock>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/version", get(http::version_handler)) // GET /version
        .route("/webhooks/github", post(http::github_webhook)) // POST /webhooks/github
        .route("/ws/dashboard", get(ws::ws_dashboard)) // WS /ws/dashboard
        .route("/api/alerts", get(http::list_alerts)) // GET /api/alerts
        .route("/api/alerts/{id}/resolve", patch(http::resolve_alert)) // PATCH /api/alerts/{id}/resolve
        .route(
            "/api/monitoring/config",
            get(http::get_monitoring_config).put(http::update_monitoring_config),
        ) // GET, PUT /api/monitoring/config
        .route("/api/units/{id}/metrics", get(http::unit_metrics)) // GET /api/units/{id}/metrics?hours=N
        .route("/api/deployments", post(http::create_deployment)) // POST /api/deployments
        .route("/api/deployments/{id}", get(http::get_deployment)) // GET /api/deployments/{id}
        .layer(CorsLayer::new().allow_origin(Any))
        .with_state(state)
}
