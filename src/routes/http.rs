// JSON handlers: webhook intake, alerts, monitoring config, unit history, deployments

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use super::AppState;
use crate::config::SettingsUpdate;
use crate::error::CoreError;
use crate::models::UnitDefinition;
use crate::version::{NAME, VERSION};
use crate::webhook::{EVENT_HEADER, SIGNATURE_HEADER, WebhookOutcome};

const DEFAULT_HISTORY_HOURS: u32 = 24;
const MAX_HISTORY_HOURS: u32 = 24 * 31;

pub(super) enum ApiError {
    Core(CoreError),
    NotFound(String),
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        ApiError::Core(e)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Core(CoreError::Storage(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, "not_found", m),
            ApiError::Core(e) => {
                let status = match &e {
                    CoreError::Authentication(_) => StatusCode::UNAUTHORIZED,
                    CoreError::Malformed(_) | CoreError::Configuration(_) => StatusCode::BAD_REQUEST,
                    CoreError::StateConflict(_) => StatusCode::CONFLICT,
                    CoreError::TransientRuntime(_) => StatusCode::BAD_GATEWAY,
                    CoreError::IrrecoverableDeployment(_) | CoreError::Storage(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                if status.is_server_error() {
                    tracing::error!(kind = e.kind(), error = %e, "request failed");
                } else {
                    tracing::debug!(kind = e.kind(), error = %e, "request rejected");
                }
                (status, e.kind(), e.to_string())
            }
        };
        (
            status,
            Json(serde_json::json!({ "error": message, "kind": kind })),
        )
            .into_response()
    }
}

/// GET /version: returns service name and version (from Cargo.toml at build time).
pub(super) async fn version_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": NAME,
        "version": VERSION,
    }))
}

/// POST /webhooks/github: the signature covers the raw body, so it is taken as bytes.
pub(super) async fn github_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    let event = headers.get(EVENT_HEADER).and_then(|v| v.to_str().ok());
    match state.gateway.handle(&body, signature, event).await {
        Ok(WebhookOutcome::Enqueued(job)) => Ok(Json(serde_json::json!({
            "status": "queued",
            "jobId": job.id,
            "targetKey": job.target_key,
        }))),
        Ok(WebhookOutcome::Deferred {
            target_key,
            behind_job_id,
        }) => Ok(Json(serde_json::json!({
            "status": "deferred",
            "behindJobId": behind_job_id,
            "targetKey": target_key,
        }))),
        Ok(WebhookOutcome::Ignored(reason)) => {
            tracing::info!(reason = %reason, "webhook ignored");
            Ok(Json(serde_json::json!({
                "status": "ignored",
                "reason": reason.to_string(),
            })))
        }
        Err(e) => {
            if matches!(e, CoreError::Authentication(_)) {
                tracing::warn!(error = %e, "webhook rejected");
            }
            Err(e.into())
        }
    }
}

/// GET /api/alerts: unresolved alerts, newest first.
pub(super) async fn list_alerts(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.list_active_alerts().await?))
}

/// PATCH /api/alerts/{id}/resolve
pub(super) async fn resolve_alert(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    match state.store.resolve_alert(id, state.clock.now()).await? {
        Some(alert) => {
            tracing::info!(alert_id = id, "alert resolved");
            Ok(Json(alert))
        }
        None => Err(ApiError::NotFound(format!("alert {} not found", id))),
    }
}

/// GET /api/monitoring/config
pub(super) async fn get_monitoring_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.settings.current())
}

/// PUT /api/monitoring/config: partial update; invalid values leave settings untouched.
pub(super) async fn update_monitoring_config(
    State(state): State<AppState>,
    Json(update): Json<SettingsUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.settings.update(&update)?))
}

#[derive(Debug, Deserialize)]
pub(super) struct HistoryQuery {
    hours: Option<u32>,
}

/// GET /api/units/{id}/metrics?hours=N: stored samples for one unit (runtime id).
pub(super) async fn unit_metrics(
    State(state): State<AppState>,
    Path(unit_id): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let hours = q
        .hours
        .unwrap_or(DEFAULT_HISTORY_HOURS)
        .clamp(1, MAX_HISTORY_HOURS);
    let to = state.clock.now();
    let from = to - chrono::Duration::hours(hours as i64);
    // Include a sample taken at exactly `to`.
    let samples = state
        .store
        .unit_history(&unit_id, from, to + chrono::Duration::milliseconds(1))
        .await?;
    Ok(Json(samples))
}

/// POST /api/deployments: register/update a unit from a definition and queue its deployment.
pub(super) async fn create_deployment(
    State(state): State<AppState>,
    Json(def): Json<UnitDefinition>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.orchestrator.deploy_definition(def).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

/// GET /api/deployments/{id}
pub(super) async fn get_deployment(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    match state.store.get_job(id).await? {
        Some(job) => Ok(Json(job)),
        None => Err(ApiError::NotFound(format!("deployment {} not found", id))),
    }
}
