// Deployed unit (container) models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Last-known unit status; serializes to lowercase JSON (e.g. "running").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Created,
    Running,
    Stopped,
    Restarting,
    Failed,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Created => "created",
            UnitStatus::Running => "running",
            UnitStatus::Stopped => "stopped",
            UnitStatus::Restarting => "restarting",
            UnitStatus::Failed => "failed",
        }
    }

    /// Parse a stored status; unknown values read as `Stopped`.
    pub fn parse(s: &str) -> Self {
        match s {
            "created" => UnitStatus::Created,
            "running" => UnitStatus::Running,
            "restarting" => UnitStatus::Restarting,
            "failed" => UnitStatus::Failed,
            _ => UnitStatus::Stopped,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Unit {
    /// Opaque runtime id of the current container; empty until the first successful deploy.
    pub runtime_id: String,
    pub name: String,
    pub image: String,
    pub repository: Option<String>,
    pub branch: Option<String>,
    pub status: UnitStatus,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    pub auto_update: bool,
    pub updated_at: DateTime<Utc>,
}

impl Unit {
    pub fn target_key(&self) -> String {
        target_key(
            self.repository.as_deref(),
            self.branch.as_deref(),
            &self.name,
        )
    }

    pub fn has_runtime_instance(&self) -> bool {
        !self.runtime_id.is_empty()
    }
}

/// Single-flight identity: `owner/repo@branch` for source-backed units, else the unit name.
pub fn target_key(repository: Option<&str>, branch: Option<&str>, name: &str) -> String {
    match repository {
        Some(repo) => format!("{}@{}", repo, branch.unwrap_or(DEFAULT_BRANCH)),
        None => name.to_string(),
    }
}

pub const DEFAULT_BRANCH: &str = "main";

/// Operator-supplied unit definition for a manual deployment. Present fields override the stored unit.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitDefinition {
    pub name: String,
    pub repository: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub ports: Option<Vec<PortMapping>>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub volumes: Option<Vec<String>>,
    #[serde(default)]
    pub auto_update: Option<bool>,
}
