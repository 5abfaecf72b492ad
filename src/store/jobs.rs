// Deployment job records

use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::instrument;

use super::{Store, is_unique_violation};
use crate::clock::{from_millis, to_millis};
use crate::models::{DeploymentJob, DeploymentTrigger, JobState, NewDeploymentJob};

const JOB_COLUMNS: &str = "id, target_key, unit_name, repository, branch, commit_sha, triggered_by, state, reason, requested_at, updated_at, finished_at";

impl Store {
    /// Insert a queued job. Returns `None` when the target already has a non-terminal job
    /// (the single-flight index rejected the row).
    #[instrument(skip(self, job), fields(repo = "store", operation = "insert_job", target = %job.target_key))]
    pub async fn insert_job(
        &self,
        job: &NewDeploymentJob,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<DeploymentJob>> {
        let result = sqlx::query(
            "INSERT INTO deployment_jobs (target_key, unit_name, repository, branch, commit_sha, triggered_by, state, requested_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)",
        )
        .bind(&job.target_key)
        .bind(&job.unit_name)
        .bind(&job.repository)
        .bind(&job.branch)
        .bind(&job.commit)
        .bind(job.trigger.as_str())
        .bind(JobState::Queued.as_str())
        .bind(to_millis(now))
        .execute(&self.pool)
        .await;

        match result {
            Ok(r) => Ok(Some(DeploymentJob {
                id: r.last_insert_rowid(),
                target_key: job.target_key.clone(),
                unit_name: job.unit_name.clone(),
                repository: job.repository.clone(),
                branch: job.branch.clone(),
                commit: job.commit.clone(),
                trigger: job.trigger,
                state: JobState::Queued,
                reason: None,
                requested_at: now,
                updated_at: now,
                finished_at: None,
            })),
            Err(e) if is_unique_violation(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_job(&self, id: i64) -> anyhow::Result<Option<DeploymentJob>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM deployment_jobs WHERE id = $1",
            JOB_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_job_row).transpose()
    }

    /// The non-terminal job for `target_key`, if any.
    pub async fn active_job(&self, target_key: &str) -> anyhow::Result<Option<DeploymentJob>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM deployment_jobs WHERE target_key = $1 AND state NOT IN ('completed', 'failed')",
            JOB_COLUMNS
        ))
        .bind(target_key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_job_row).transpose()
    }

    /// Most recent completed job that deployed `commit` to `target_key`.
    pub async fn completed_job_for_commit(
        &self,
        target_key: &str,
        commit: &str,
    ) -> anyhow::Result<Option<DeploymentJob>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM deployment_jobs WHERE target_key = $1 AND commit_sha = $2 AND state = 'completed'
             ORDER BY id DESC LIMIT 1",
            JOB_COLUMNS
        ))
        .bind(target_key)
        .bind(commit)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_job_row).transpose()
    }

    /// Persist a state transition. Terminal states also set `finished_at`.
    #[instrument(skip(self, reason), fields(repo = "store", operation = "update_job_state"))]
    pub async fn update_job_state(
        &self,
        id: i64,
        state: JobState,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let finished_at = state.is_terminal().then(|| to_millis(now));
        let r = sqlx::query(
            "UPDATE deployment_jobs SET state = $1, reason = COALESCE($2, reason), updated_at = $3,
                    finished_at = COALESCE($4, finished_at)
             WHERE id = $5",
        )
        .bind(state.as_str())
        .bind(reason)
        .bind(to_millis(now))
        .bind(finished_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        anyhow::ensure!(r.rows_affected() == 1, "deployment job {} not found", id);
        Ok(())
    }

    /// Fail every non-terminal job left behind by a previous process. Returns how many.
    #[instrument(skip(self), fields(repo = "store", operation = "fail_interrupted_jobs"))]
    pub async fn fail_interrupted_jobs(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
        let r = sqlx::query(
            "UPDATE deployment_jobs SET state = 'failed', reason = 'interrupted: service restarted while job was ' || state,
                    updated_at = $1, finished_at = $1
             WHERE state NOT IN ('completed', 'failed')",
        )
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;
        Ok(r.rows_affected())
    }
}

fn parse_job_row(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<DeploymentJob> {
    let state: String = row.try_get("state")?;
    let trigger: String = row.try_get("triggered_by")?;
    let finished_at: Option<i64> = row.try_get("finished_at")?;
    Ok(DeploymentJob {
        id: row.try_get("id")?,
        target_key: row.try_get("target_key")?,
        unit_name: row.try_get("unit_name")?,
        repository: row.try_get("repository")?,
        branch: row.try_get("branch")?,
        commit: row.try_get("commit_sha")?,
        trigger: DeploymentTrigger::parse(&trigger),
        state: JobState::parse(&state).ok_or_else(|| anyhow::anyhow!("unknown job state {}", state))?,
        reason: row.try_get("reason")?,
        requested_at: from_millis(row.try_get("requested_at")?),
        updated_at: from_millis(row.try_get("updated_at")?),
        finished_at: finished_at.map(from_millis),
    })
}
