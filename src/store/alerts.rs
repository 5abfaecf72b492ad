// Alerts: conditional creation (dedup guard) and explicit resolution

use chrono::{DateTime, Utc};
use sqlx::Row;
use std::collections::HashSet;
use tracing::instrument;

use super::Store;
use crate::clock::{from_millis, to_millis};
use crate::models::{Alert, AlertType, NewAlert, Severity};

const ALERT_COLUMNS: &str =
    "id, alert_type, unit_id, unit_name, severity, message, created_at, resolved, resolved_at";

impl Store {
    /// Insert `alert` unless an unresolved alert of the same (type, unit) was created after
    /// `window_start`. Check and insert are one statement, so concurrent callers cannot both
    /// succeed. Returns the new row, or `None` when suppressed.
    #[instrument(skip(self, alert), fields(repo = "store", operation = "insert_alert_if_absent", unit = %alert.unit_id, alert_type = alert.alert_type.as_str()))]
    pub async fn insert_alert_if_absent(
        &self,
        alert: &NewAlert,
        now: DateTime<Utc>,
        window_start: DateTime<Utc>,
    ) -> anyhow::Result<Option<Alert>> {
        let r = sqlx::query(
            r#"
            INSERT INTO alerts (alert_type, unit_id, unit_name, severity, message, created_at, resolved)
            SELECT $1, $2, $3, $4, $5, $6, 0
            WHERE NOT EXISTS (
                SELECT 1 FROM alerts
                WHERE alert_type = $1 AND unit_id = $2 AND resolved = 0 AND created_at > $7
            )
            "#,
        )
        .bind(alert.alert_type.as_str())
        .bind(&alert.unit_id)
        .bind(&alert.unit_name)
        .bind(alert.severity.as_str())
        .bind(&alert.message)
        .bind(to_millis(now))
        .bind(to_millis(window_start))
        .execute(&self.pool)
        .await?;

        if r.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(Alert {
            id: r.last_insert_rowid(),
            alert_type: alert.alert_type,
            unit_id: alert.unit_id.clone(),
            unit_name: alert.unit_name.clone(),
            severity: alert.severity,
            message: alert.message.clone(),
            created_at: now,
            resolved: false,
            resolved_at: None,
        }))
    }

    /// (type, unit) pairs with an unresolved alert created after `window_start`.
    pub async fn open_alert_keys(
        &self,
        window_start: DateTime<Utc>,
    ) -> anyhow::Result<HashSet<(AlertType, String)>> {
        let rows = sqlx::query(
            "SELECT alert_type, unit_id FROM alerts WHERE resolved = 0 AND created_at > $1",
        )
        .bind(to_millis(window_start))
        .fetch_all(&self.pool)
        .await?;
        let mut out = HashSet::with_capacity(rows.len());
        for row in rows {
            let alert_type: String = row.try_get("alert_type")?;
            if let Some(t) = AlertType::parse(&alert_type) {
                out.insert((t, row.try_get("unit_id")?));
            }
        }
        Ok(out)
    }

    /// Unresolved alerts, newest first.
    pub async fn list_active_alerts(&self) -> anyhow::Result<Vec<Alert>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM alerts WHERE resolved = 0 ORDER BY created_at DESC, id DESC",
            ALERT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_alert_row).collect()
    }

    pub async fn get_alert(&self, id: i64) -> anyhow::Result<Option<Alert>> {
        let row = sqlx::query(&format!("SELECT {} FROM alerts WHERE id = $1", ALERT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(parse_alert_row).transpose()
    }

    /// Mark resolved. Already-resolved alerts keep their original `resolved_at`.
    /// Returns `None` when no alert has this id.
    #[instrument(skip(self), fields(repo = "store", operation = "resolve_alert"))]
    pub async fn resolve_alert(&self, id: i64, now: DateTime<Utc>) -> anyhow::Result<Option<Alert>> {
        sqlx::query("UPDATE alerts SET resolved = 1, resolved_at = $1 WHERE id = $2 AND resolved = 0")
            .bind(to_millis(now))
            .bind(id)
            .execute(&self.pool)
            .await?;
        self.get_alert(id).await
    }
}

fn parse_alert_row(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<Alert> {
    let alert_type: String = row.try_get("alert_type")?;
    let severity: String = row.try_get("severity")?;
    let resolved_at: Option<i64> = row.try_get("resolved_at")?;
    Ok(Alert {
        id: row.try_get("id")?,
        alert_type: AlertType::parse(&alert_type)
            .ok_or_else(|| anyhow::anyhow!("unknown alert type {}", alert_type))?,
        unit_id: row.try_get("unit_id")?,
        unit_name: row.try_get("unit_name")?,
        severity: Severity::parse(&severity),
        message: row.try_get("message")?,
        created_at: from_millis(row.try_get("created_at")?),
        resolved: row.try_get("resolved")?,
        resolved_at: resolved_at.map(from_millis),
    })
}
