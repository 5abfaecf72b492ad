// Deployment job models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Job lifecycle:
/// queued → cloning → building → stopping_old → starting_new → recording → completed,
/// with `failed` reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Cloning,
    Building,
    StoppingOld,
    StartingNew,
    Recording,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Cloning => "cloning",
            JobState::Building => "building",
            JobState::StoppingOld => "stopping_old",
            JobState::StartingNew => "starting_new",
            JobState::Recording => "recording",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => JobState::Queued,
            "cloning" => JobState::Cloning,
            "building" => JobState::Building,
            "stopping_old" => JobState::StoppingOld,
            "starting_new" => JobState::StartingNew,
            "recording" => JobState::Recording,
            "completed" => JobState::Completed,
            "failed" => JobState::Failed,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(&self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (s, Failed) => !s.is_terminal(),
            (Queued, Cloning)
            | (Cloning, Building)
            | (Building, StoppingOld)
            | (StoppingOld, StartingNew)
            | (StartingNew, Recording)
            | (Recording, Completed) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentTrigger {
    Webhook,
    Manual,
}

impl DeploymentTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentTrigger::Webhook => "webhook",
            DeploymentTrigger::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "webhook" {
            DeploymentTrigger::Webhook
        } else {
            DeploymentTrigger::Manual
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentJob {
    pub id: i64,
    pub target_key: String,
    pub unit_name: String,
    pub repository: Option<String>,
    pub branch: Option<String>,
    pub commit: Option<String>,
    pub trigger: DeploymentTrigger,
    pub state: JobState,
    pub reason: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewDeploymentJob {
    pub target_key: String,
    pub unit_name: String,
    pub repository: Option<String>,
    pub branch: Option<String>,
    pub commit: Option<String>,
    pub trigger: DeploymentTrigger,
}

/// Build descriptor found in a fetched source tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildDescriptor {
    Dockerfile(PathBuf),
    Compose(PathBuf),
}
