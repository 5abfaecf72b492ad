// Events fanned out to dashboard subscribers

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{Alert, DeploymentJob, JobState, MetricsBatch};

/// Serialized as `{"type": "<kebab-case kind>", "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum DashboardEvent {
    MetricsUpdate(Arc<MetricsBatch>),
    AlertCreated(Alert),
    #[serde(rename_all = "camelCase")]
    DeploymentStatus {
        job_id: i64,
        target_key: String,
        state: JobState,
    },
    DeploymentCompleted(DeploymentJob),
    DeploymentFailed(DeploymentJob),
    #[serde(rename_all = "camelCase")]
    DeploymentDegraded {
        job: DeploymentJob,
        alert: Option<Alert>,
    },
}

impl DashboardEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            DashboardEvent::MetricsUpdate(_) => "metrics-update",
            DashboardEvent::AlertCreated(_) => "alert-created",
            DashboardEvent::DeploymentStatus { .. } => "deployment-status",
            DashboardEvent::DeploymentCompleted(_) => "deployment-completed",
            DashboardEvent::DeploymentFailed(_) => "deployment-failed",
            DashboardEvent::DeploymentDegraded { .. } => "deployment-degraded",
        }
    }
}
