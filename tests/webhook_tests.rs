// WebhookGateway tests: signature checks, filtering, dedup against jobs, enqueue

mod common;

use common::*;
use fleetwarden::error::CoreError;
use fleetwarden::models::{DeploymentTrigger, JobState};
use fleetwarden::webhook::{IgnoreReason, WebhookGateway, WebhookOutcome, sign};
use std::sync::Arc;

const SHA: &str = "9f3c1b2a7d4e5f60718293a4b5c6d7e8f9012345";

fn push_body(repository: &str, git_ref: &str, after: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "ref": git_ref,
        "before": "1111111111111111111111111111111111111111",
        "after": after,
        "repository": { "full_name": repository, "name": "web" },
        "head_commit": { "id": after, "message": "fix" },
        "pusher": { "name": "octocat" }
    }))
    .unwrap()
}

async fn gateway() -> (DeployHarness, WebhookGateway) {
    let h = DeployHarness::new(FakeSource::new(true)).await;
    h.store
        .upsert_unit(&unit("web", "c1", Some("acme/web")))
        .await
        .unwrap();
    let gw = WebhookGateway::new(SECRET, h.store.clone(), Arc::clone(&h.orchestrator));
    (h, gw)
}

async fn deliver(gw: &WebhookGateway, body: &[u8], event: &str) -> Result<WebhookOutcome, CoreError> {
    let signature = sign(SECRET.as_bytes(), body).unwrap();
    gw.handle(body, Some(&signature), Some(event)).await
}

fn ignored(outcome: WebhookOutcome) -> IgnoreReason {
    match outcome {
        WebhookOutcome::Ignored(reason) => reason,
        other => panic!("expected the delivery to be ignored, got {:?}", other),
    }
}

#[tokio::test]
async fn missing_or_wrong_signature_is_rejected() {
    let (h, gw) = gateway().await;
    let body = push_body("acme/web", "refs/heads/main", SHA);

    let err = gw.handle(&body, None, Some("push")).await.unwrap_err();
    assert!(matches!(err, CoreError::Authentication(_)));

    let forged = sign(b"other-secret", &body).unwrap();
    let err = gw.handle(&body, Some(&forged), Some("push")).await.unwrap_err();
    assert!(matches!(err, CoreError::Authentication(_)));

    let err = gw.handle(&body, Some("sha1=abcdef"), Some("push")).await.unwrap_err();
    assert!(matches!(err, CoreError::Authentication(_)));

    assert!(h.store.active_job("acme/web@main").await.unwrap().is_none());
}

#[tokio::test]
async fn tampered_body_fails_verification() {
    let (_h, gw) = gateway().await;
    let body = push_body("acme/web", "refs/heads/main", SHA);
    let signature = sign(SECRET.as_bytes(), &body).unwrap();
    let tampered = push_body("acme/evil", "refs/heads/main", SHA);
    let err = gw
        .handle(&tampered, Some(&signature), Some("push"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Authentication(_)));
}

#[tokio::test]
async fn push_to_tracked_branch_enqueues_job() {
    let (h, gw) = gateway().await;
    let body = push_body("acme/web", "refs/heads/main", SHA);

    let job = match deliver(&gw, &body, "push").await.unwrap() {
        WebhookOutcome::Enqueued(job) => job,
        other => panic!("expected a job, got {:?}", other),
    };
    assert_eq!(job.target_key, "acme/web@main");
    assert_eq!(job.unit_name, "web");
    assert_eq!(job.commit.as_deref(), Some(SHA));
    assert_eq!(job.trigger, DeploymentTrigger::Webhook);
    assert_eq!(job.state, JobState::Queued);
    let active = h.store.active_job("acme/web@main").await.unwrap().unwrap();
    assert_eq!(active.id, job.id);
}

#[tokio::test]
async fn non_push_events_and_non_branch_refs_are_ignored() {
    let (_h, gw) = gateway().await;
    let body = push_body("acme/web", "refs/heads/main", SHA);
    assert_eq!(
        ignored(deliver(&gw, &body, "ping").await.unwrap()),
        IgnoreReason::NotPush("ping".into())
    );

    let tag = push_body("acme/web", "refs/tags/v1.0.0", SHA);
    assert_eq!(
        ignored(deliver(&gw, &tag, "push").await.unwrap()),
        IgnoreReason::NotBranch("refs/tags/v1.0.0".into())
    );
}

#[tokio::test]
async fn branch_deletion_is_ignored() {
    let (_h, gw) = gateway().await;
    let body = push_body(
        "acme/web",
        "refs/heads/main",
        "0000000000000000000000000000000000000000",
    );
    assert_eq!(
        ignored(deliver(&gw, &body, "push").await.unwrap()),
        IgnoreReason::BranchDeleted
    );
}

#[tokio::test]
async fn untracked_repository_or_branch_is_ignored() {
    let (_h, gw) = gateway().await;
    let other_repo = push_body("acme/api", "refs/heads/main", SHA);
    assert_eq!(
        ignored(deliver(&gw, &other_repo, "push").await.unwrap()),
        IgnoreReason::Untracked {
            repository: "acme/api".into(),
            branch: "main".into()
        }
    );
    let other_branch = push_body("acme/web", "refs/heads/feature", SHA);
    assert!(matches!(
        ignored(deliver(&gw, &other_branch, "push").await.unwrap()),
        IgnoreReason::Untracked { .. }
    ));
}

#[tokio::test]
async fn auto_update_disabled_is_ignored() {
    let (h, gw) = gateway().await;
    let mut u = unit("web", "c1", Some("acme/web"));
    u.auto_update = false;
    h.store.upsert_unit(&u).await.unwrap();

    let body = push_body("acme/web", "refs/heads/main", SHA);
    assert_eq!(
        ignored(deliver(&gw, &body, "push").await.unwrap()),
        IgnoreReason::AutoUpdateDisabled("web".into())
    );
}

#[tokio::test]
async fn redelivery_of_in_flight_commit_is_ignored() {
    let (_h, gw) = gateway().await;
    let body = push_body("acme/web", "refs/heads/main", SHA);
    let first = match deliver(&gw, &body, "push").await.unwrap() {
        WebhookOutcome::Enqueued(job) => job,
        other => panic!("expected a job, got {:?}", other),
    };
    assert_eq!(
        ignored(deliver(&gw, &body, "push").await.unwrap()),
        IgnoreReason::AlreadyInFlight { job_id: first.id }
    );
}

#[tokio::test]
async fn concurrent_deliveries_create_exactly_one_job() {
    let (h, gw) = gateway().await;
    let gw = Arc::new(gw);
    let body = push_body("acme/web", "refs/heads/main", SHA);

    let tasks: Vec<_> = (0..5)
        .map(|_| {
            let gw = gw.clone();
            let body = body.clone();
            tokio::spawn(async move { deliver(&gw, &body, "push").await })
        })
        .collect();
    let mut enqueued = 0;
    for t in tasks {
        match t.await.unwrap().unwrap() {
            WebhookOutcome::Enqueued(_) => enqueued += 1,
            WebhookOutcome::Ignored(reason) => {
                assert!(matches!(reason, IgnoreReason::AlreadyInFlight { .. }), "{}", reason)
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }
    assert_eq!(enqueued, 1);
    assert!(h.store.active_job("acme/web@main").await.unwrap().is_some());
}

#[tokio::test]
async fn already_deployed_commit_is_ignored() {
    let (h, gw) = gateway().await;
    let body = push_body("acme/web", "refs/heads/main", SHA);
    let job = match deliver(&gw, &body, "push").await.unwrap() {
        WebhookOutcome::Enqueued(job) => job,
        other => panic!("expected a job, got {:?}", other),
    };
    for state in [
        JobState::Cloning,
        JobState::Building,
        JobState::StoppingOld,
        JobState::StartingNew,
        JobState::Recording,
        JobState::Completed,
    ] {
        h.store
            .update_job_state(job.id, state, None, start_time())
            .await
            .unwrap();
    }

    assert_eq!(
        ignored(deliver(&gw, &body, "push").await.unwrap()),
        IgnoreReason::AlreadyDeployed { job_id: job.id }
    );

    // A new commit on the same branch deploys again.
    let next = push_body("acme/web", "refs/heads/main", "aaaabbbbccccddddeeeeffff0000111122223333");
    assert!(matches!(
        deliver(&gw, &next, "push").await.unwrap(),
        WebhookOutcome::Enqueued(_)
    ));
}

#[tokio::test]
async fn malformed_payload_is_rejected_after_verification() {
    let (_h, gw) = gateway().await;
    let body = b"{\"ref\": 42}".to_vec();
    let err = deliver(&gw, &body, "push").await.unwrap_err();
    assert!(matches!(err, CoreError::Malformed(_)));
}

#[tokio::test]
async fn newer_commit_during_active_job_deploys_after_it() {
    let (mut h, gw) = gateway().await;
    let first = match deliver(&gw, &push_body("acme/web", "refs/heads/main", SHA), "push")
        .await
        .unwrap()
    {
        WebhookOutcome::Enqueued(job) => job,
        other => panic!("expected a job, got {:?}", other),
    };

    // Two newer pushes while the first job is queued: only the newest is kept.
    let newer = "aaaabbbbccccddddeeeeffff0000111122223333";
    let newest = "bbbbccccddddeeeeffff00001111222233334444";
    for sha in [newer, newest] {
        match deliver(&gw, &push_body("acme/web", "refs/heads/main", sha), "push")
            .await
            .unwrap()
        {
            WebhookOutcome::Deferred {
                target_key,
                behind_job_id,
            } => {
                assert_eq!(target_key, "acme/web@main");
                assert_eq!(behind_job_id, first.id);
            }
            other => panic!("expected the push to be deferred, got {:?}", other),
        }
    }
    assert_eq!(
        h.store.active_job("acme/web@main").await.unwrap().unwrap().id,
        first.id
    );

    let (_shutdown, _consumer) = h.start_consumer();
    assert_eq!(h.wait_terminal(first.id).await.state, JobState::Completed);

    let mut follow_up = None;
    for _ in 0..500 {
        follow_up = h
            .store
            .completed_job_for_commit("acme/web@main", newest)
            .await
            .unwrap();
        if follow_up.is_some() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    let follow_up = follow_up.expect("deferred commit was never deployed");
    assert_ne!(follow_up.id, first.id);
    assert_eq!(follow_up.trigger, DeploymentTrigger::Webhook);
    assert!(
        h.store
            .completed_job_for_commit("acme/web@main", newer)
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(h.runtime.count("build"), 2);
    let recorded = h.store.get_unit("web").await.unwrap().unwrap();
    assert_eq!(recorded.image, "fleetwarden/web:bbbbccccdddd");
}
