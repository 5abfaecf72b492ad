// SQLite persistence for units, metric samples, alerts and deployment jobs.
// Timestamps are stored as epoch milliseconds.

mod alerts;
mod blob;
mod jobs;
mod samples;
mod units;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::instrument;

pub struct Store {
    pool: SqlitePool,
    retention_ms: i64,
}

impl Store {
    pub async fn connect(path: &str, retention_days: u32) -> anyhow::Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        let pool = SqlitePoolOptions::new().connect_with(opts).await?;
        let retention_ms = (retention_days as i64) * 24 * 60 * 60 * 1000;
        Ok(Self { pool, retention_ms })
    }

    /// Create tables and indexes. Idempotent.
    pub async fn init(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS units (
                name TEXT PRIMARY KEY,
                runtime_id TEXT NOT NULL DEFAULT '',
                image TEXT NOT NULL DEFAULT '',
                repository TEXT,
                branch TEXT,
                status TEXT NOT NULL,
                ports TEXT NOT NULL DEFAULT '[]',
                env TEXT NOT NULL DEFAULT '{}',
                volumes TEXT NOT NULL DEFAULT '[]',
                auto_update INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // One unit per source; units without a repository are exempt (NULLs are distinct).
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_units_source ON units(repository, branch)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS metric_samples (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                unit_id TEXT NOT NULL,
                unit_name TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                cpu_percent REAL NOT NULL,
                memory_used INTEGER NOT NULL,
                memory_limit INTEGER NOT NULL,
                memory_percent REAL NOT NULL,
                rx_bytes INTEGER NOT NULL,
                tx_bytes INTEGER NOT NULL,
                interface_data BLOB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_samples_unit_created ON metric_samples(unit_id, created_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_samples_created_at ON metric_samples(created_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                alert_type TEXT NOT NULL,
                unit_id TEXT NOT NULL,
                unit_name TEXT NOT NULL,
                severity TEXT NOT NULL,
                message TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                resolved INTEGER NOT NULL DEFAULT 0,
                resolved_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_alerts_open ON alerts(alert_type, unit_id, resolved, created_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deployment_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                target_key TEXT NOT NULL,
                unit_name TEXT NOT NULL,
                repository TEXT,
                branch TEXT,
                commit_sha TEXT,
                triggered_by TEXT NOT NULL,
                state TEXT NOT NULL,
                reason TEXT,
                requested_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                finished_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Single-flight: at most one non-terminal job per target.
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_single_flight ON deployment_jobs(target_key)
             WHERE state NOT IN ('completed', 'failed')",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_target_commit ON deployment_jobs(target_key, commit_sha, state)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Reclaim space after deletes (run periodically after pruning).
    #[instrument(skip(self), fields(repo = "store", operation = "vacuum"))]
    pub async fn vacuum(&self) -> anyhow::Result<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}
