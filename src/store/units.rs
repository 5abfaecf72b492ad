// Unit records

use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::instrument;

use super::Store;
use crate::clock::{from_millis, to_millis};
use crate::models::{Unit, UnitStatus};

const UNIT_COLUMNS: &str =
    "name, runtime_id, image, repository, branch, status, ports, env, volumes, auto_update, updated_at";

impl Store {
    /// Insert or fully replace the unit with this name.
    #[instrument(skip(self, unit), fields(repo = "store", operation = "upsert_unit", unit = %unit.name))]
    pub async fn upsert_unit(&self, unit: &Unit) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO units (name, runtime_id, image, repository, branch, status, ports, env, volumes, auto_update, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT(name) DO UPDATE SET
                runtime_id = excluded.runtime_id,
                image = excluded.image,
                repository = excluded.repository,
                branch = excluded.branch,
                status = excluded.status,
                ports = excluded.ports,
                env = excluded.env,
                volumes = excluded.volumes,
                auto_update = excluded.auto_update,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&unit.name)
        .bind(&unit.runtime_id)
        .bind(&unit.image)
        .bind(&unit.repository)
        .bind(&unit.branch)
        .bind(unit.status.as_str())
        .bind(serde_json::to_string(&unit.ports)?)
        .bind(serde_json::to_string(&unit.env)?)
        .bind(serde_json::to_string(&unit.volumes)?)
        .bind(unit.auto_update)
        .bind(to_millis(unit.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_unit(&self, name: &str) -> anyhow::Result<Option<Unit>> {
        let row = sqlx::query(&format!("SELECT {} FROM units WHERE name = $1", UNIT_COLUMNS))
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(parse_unit_row).transpose()
    }

    /// The unit deployed from `repository`@`branch`, whatever its auto-update flag.
    pub async fn find_unit_by_source(
        &self,
        repository: &str,
        branch: &str,
    ) -> anyhow::Result<Option<Unit>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM units WHERE repository = $1 AND branch = $2",
            UNIT_COLUMNS
        ))
        .bind(repository)
        .bind(branch)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_unit_row).transpose()
    }

    pub async fn list_units(&self) -> anyhow::Result<Vec<Unit>> {
        let rows = sqlx::query(&format!("SELECT {} FROM units ORDER BY name", UNIT_COLUMNS))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(parse_unit_row).collect()
    }

    /// Status is the only mutation allowed outside a full replace.
    #[instrument(skip(self), fields(repo = "store", operation = "set_unit_status"))]
    pub async fn set_unit_status(
        &self,
        name: &str,
        status: UnitStatus,
        at: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let r = sqlx::query("UPDATE units SET status = $1, updated_at = $2 WHERE name = $3")
            .bind(status.as_str())
            .bind(to_millis(at))
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(r.rows_affected() > 0)
    }
}

fn parse_unit_row(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<Unit> {
    let status: String = row.try_get("status")?;
    let ports: String = row.try_get("ports")?;
    let env: String = row.try_get("env")?;
    let volumes: String = row.try_get("volumes")?;
    Ok(Unit {
        runtime_id: row.try_get("runtime_id")?,
        name: row.try_get("name")?,
        image: row.try_get("image")?,
        repository: row.try_get("repository")?,
        branch: row.try_get("branch")?,
        status: UnitStatus::parse(&status),
        ports: serde_json::from_str(&ports)?,
        env: serde_json::from_str(&env)?,
        volumes: serde_json::from_str(&volumes)?,
        auto_update: row.try_get("auto_update")?,
        updated_at: from_millis(row.try_get("updated_at")?),
    })
}
