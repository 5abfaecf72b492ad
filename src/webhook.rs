// Inbound push webhooks: verify, filter, resolve the target unit, enqueue.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;

use crate::deployer::DeploymentOrchestrator;
use crate::error::CoreError;
use crate::models::{DeploymentJob, DeploymentTrigger, NewDeploymentJob};
use crate::store::Store;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const EVENT_HEADER: &str = "x-github-event";

const SIGNATURE_PREFIX: &str = "sha256=";
const BRANCH_REF_PREFIX: &str = "refs/heads/";
/// `after` of a push that deleted the branch.
const NULL_SHA: &str = "0000000000000000000000000000000000000000";

#[derive(Debug, Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    repository: PushRepository,
    #[serde(default)]
    after: Option<String>,
    #[serde(default)]
    head_commit: Option<HeadCommit>,
}

#[derive(Debug, Deserialize)]
struct PushRepository {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct HeadCommit {
    id: String,
}

/// Why a verified delivery produced no job. Acknowledged with 200.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    NotPush(String),
    NotBranch(String),
    BranchDeleted,
    Untracked { repository: String, branch: String },
    AutoUpdateDisabled(String),
    AlreadyDeployed { job_id: i64 },
    AlreadyInFlight { job_id: i64 },
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IgnoreReason::NotPush(event) => write!(f, "event {} is not a push", event),
            IgnoreReason::NotBranch(r) => write!(f, "ref {} is not a branch", r),
            IgnoreReason::BranchDeleted => write!(f, "branch was deleted"),
            IgnoreReason::Untracked { repository, branch } => {
                write!(f, "no unit tracks {}@{}", repository, branch)
            }
            IgnoreReason::AutoUpdateDisabled(unit) => {
                write!(f, "auto-update is disabled for unit {}", unit)
            }
            IgnoreReason::AlreadyDeployed { job_id } => {
                write!(f, "commit already deployed by job {}", job_id)
            }
            IgnoreReason::AlreadyInFlight { job_id } => {
                write!(f, "commit is being deployed by job {}", job_id)
            }
        }
    }
}

#[derive(Debug)]
pub enum WebhookOutcome {
    Enqueued(DeploymentJob),
    /// A job for the target is active; this commit deploys after it finishes.
    Deferred { target_key: String, behind_job_id: i64 },
    Ignored(IgnoreReason),
}

pub struct WebhookGateway {
    secret: Vec<u8>,
    store: Arc<Store>,
    orchestrator: Arc<DeploymentOrchestrator>,
}

impl WebhookGateway {
    pub fn new(
        secret: impl Into<Vec<u8>>,
        store: Arc<Store>,
        orchestrator: Arc<DeploymentOrchestrator>,
    ) -> Self {
        Self {
            secret: secret.into(),
            store,
            orchestrator,
        }
    }

    /// Validate one delivery and enqueue a job for it. Returns as soon as the job is queued.
    pub async fn handle(
        &self,
        body: &[u8],
        signature: Option<&str>,
        event: Option<&str>,
    ) -> Result<WebhookOutcome, CoreError> {
        verify_signature(&self.secret, body, signature)?;

        if let Some(event) = event
            && event != "push"
        {
            return Ok(WebhookOutcome::Ignored(IgnoreReason::NotPush(event.to_string())));
        }

        let payload: PushPayload = serde_json::from_slice(body)
            .map_err(|e| CoreError::Malformed(format!("invalid push payload: {}", e)))?;
        let Some(branch) = payload.git_ref.strip_prefix(BRANCH_REF_PREFIX) else {
            return Ok(WebhookOutcome::Ignored(IgnoreReason::NotBranch(payload.git_ref)));
        };
        let commit = payload
            .after
            .filter(|sha| !sha.is_empty())
            .or(payload.head_commit.map(|c| c.id));
        if commit.as_deref() == Some(NULL_SHA) {
            return Ok(WebhookOutcome::Ignored(IgnoreReason::BranchDeleted));
        }

        let repository = payload.repository.full_name;
        let Some(unit) = self.store.find_unit_by_source(&repository, branch).await? else {
            return Ok(WebhookOutcome::Ignored(IgnoreReason::Untracked {
                repository,
                branch: branch.to_string(),
            }));
        };
        if !unit.auto_update {
            return Ok(WebhookOutcome::Ignored(IgnoreReason::AutoUpdateDisabled(unit.name)));
        }
        let target_key = unit.target_key();

        if let Some(sha) = commit.as_deref() {
            if let Some(done) = self.store.completed_job_for_commit(&target_key, sha).await? {
                return Ok(WebhookOutcome::Ignored(IgnoreReason::AlreadyDeployed {
                    job_id: done.id,
                }));
            }
            if let Some(ignored) = self.in_flight_with_commit(&target_key, sha).await? {
                return Ok(WebhookOutcome::Ignored(ignored));
            }
        }

        let request = NewDeploymentJob {
            target_key: target_key.clone(),
            unit_name: unit.name,
            repository: Some(repository),
            branch: Some(branch.to_string()),
            commit: commit.clone(),
            trigger: DeploymentTrigger::Webhook,
        };
        match self.orchestrator.submit(request.clone()).await {
            Ok(job) => Ok(WebhookOutcome::Enqueued(job)),
            Err(CoreError::StateConflict(msg)) => {
                let Some(active) = self.store.active_job(&target_key).await? else {
                    return Err(CoreError::StateConflict(msg));
                };
                // A concurrent delivery of the same commit won the insert.
                if commit.is_some() && active.commit == commit {
                    return Ok(WebhookOutcome::Ignored(IgnoreReason::AlreadyInFlight {
                        job_id: active.id,
                    }));
                }
                match self.orchestrator.defer(request).await? {
                    Some(job) => Ok(WebhookOutcome::Enqueued(job)),
                    None => Ok(WebhookOutcome::Deferred {
                        target_key,
                        behind_job_id: active.id,
                    }),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn in_flight_with_commit(
        &self,
        target_key: &str,
        sha: &str,
    ) -> Result<Option<IgnoreReason>, CoreError> {
        Ok(self
            .store
            .active_job(target_key)
            .await?
            .filter(|job| job.commit.as_deref() == Some(sha))
            .map(|job| IgnoreReason::AlreadyInFlight { job_id: job.id }))
    }
}

fn new_mac(secret: &[u8]) -> Result<Hmac<Sha256>, CoreError> {
    Hmac::<Sha256>::new_from_slice(secret)
        .map_err(|_| CoreError::Configuration("webhook secret is not a valid HMAC key".into()))
}

/// `sha256=<hex>` signature over `body`.
pub fn sign(secret: &[u8], body: &[u8]) -> Result<String, CoreError> {
    let mut mac = new_mac(secret)?;
    mac.update(body);
    Ok(format!(
        "{}{}",
        SIGNATURE_PREFIX,
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Constant-time check of an `X-Hub-Signature-256` header against the raw body.
pub fn verify_signature(secret: &[u8], body: &[u8], header: Option<&str>) -> Result<(), CoreError> {
    let header = header.ok_or(CoreError::Authentication("missing webhook signature"))?;
    let expected = header
        .trim()
        .strip_prefix(SIGNATURE_PREFIX)
        .and_then(|h| hex::decode(h).ok())
        .ok_or(CoreError::Authentication("malformed webhook signature"))?;
    let mut mac = new_mac(secret)?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| CoreError::Authentication("webhook signature mismatch"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"It's a Secret to Everybody";

    #[test]
    fn known_signature_vector() {
        // Example from GitHub's webhook validation docs.
        assert_eq!(
            sign(SECRET, b"Hello, World!").unwrap(),
            "sha256=757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17"
        );
    }

    #[test]
    fn valid_signature_accepted() {
        let body = br#"{"ref":"refs/heads/main"}"#;
        let sig = sign(SECRET, body).unwrap();
        assert!(verify_signature(SECRET, body, Some(&sig)).is_ok());
    }

    #[test]
    fn tampered_body_rejected() {
        let sig = sign(SECRET, br#"{"ref":"refs/heads/main"}"#).unwrap();
        let err = verify_signature(SECRET, br#"{"ref":"refs/heads/dev"}"#, Some(&sig)).unwrap_err();
        assert_eq!(err.kind(), "authentication");
    }

    #[test]
    fn missing_or_malformed_header_rejected() {
        let body = b"{}";
        assert!(matches!(
            verify_signature(SECRET, body, None),
            Err(CoreError::Authentication(_))
        ));
        assert!(matches!(
            verify_signature(SECRET, body, Some("sha1=abcd")),
            Err(CoreError::Authentication(_))
        ));
        assert!(matches!(
            verify_signature(SECRET, body, Some("sha256=not-hex")),
            Err(CoreError::Authentication(_))
        ));
    }

    #[test]
    fn wrong_secret_rejected() {
        let body = b"{}";
        let sig = sign(b"other", body).unwrap();
        assert!(verify_signature(SECRET, body, Some(&sig)).is_err());
    }
}
