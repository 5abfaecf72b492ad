// Append-only metric samples

use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::instrument;

use super::{Store, blob};
use crate::clock::{from_millis, to_millis};
use crate::models::{InterfaceCounters, MetricSample};

impl Store {
    /// Persist one batch in a single transaction. Error samples are skipped.
    #[instrument(skip(self, samples), fields(repo = "store", operation = "save_samples", samples_count = samples.len()))]
    pub async fn save_samples(&self, samples: &[MetricSample]) -> anyhow::Result<usize> {
        let ok: Vec<&MetricSample> = samples.iter().filter(|s| !s.is_error()).collect();
        if ok.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        for s in &ok {
            let interface_data = blob::with_version_prefix(
                blob::BLOB_VERSION_INTERFACES,
                wincode::serialize(&s.interfaces).map_err(|e| anyhow::anyhow!("wincode: {}", e))?,
            );
            sqlx::query(
                "INSERT INTO metric_samples (unit_id, unit_name, created_at, cpu_percent, memory_used, memory_limit, memory_percent, rx_bytes, tx_bytes, interface_data)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(&s.unit_id)
            .bind(&s.unit_name)
            .bind(to_millis(s.timestamp))
            .bind(s.cpu_percent)
            .bind(clamp_i64(s.memory_used))
            .bind(clamp_i64(s.memory_limit))
            .bind(s.memory_percent)
            .bind(clamp_i64(s.rx_bytes))
            .bind(clamp_i64(s.tx_bytes))
            .bind(&interface_data)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(ok.len())
    }

    /// Samples for one unit in [from, to), ascending.
    #[instrument(skip(self), fields(repo = "store", operation = "unit_history"))]
    pub async fn unit_history(
        &self,
        unit_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> anyhow::Result<Vec<MetricSample>> {
        let rows = sqlx::query(
            "SELECT unit_id, unit_name, created_at, cpu_percent, memory_used, memory_limit, memory_percent, rx_bytes, tx_bytes, interface_data
             FROM metric_samples WHERE unit_id = $1 AND created_at >= $2 AND created_at < $3
             ORDER BY created_at ASC",
        )
        .bind(unit_id)
        .bind(to_millis(from))
        .bind(to_millis(to))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(parse_sample_row(&row)?);
        }
        Ok(out)
    }

    /// Delete samples older than the retention window. Returns rows removed.
    #[instrument(skip(self), fields(repo = "store", operation = "prune_samples"))]
    pub async fn prune_samples(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
        let cutoff = to_millis(now) - self.retention_ms;
        let r = sqlx::query("DELETE FROM metric_samples WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(r.rows_affected())
    }
}

/// SQLite integers are signed; counters past `i64::MAX` are stored saturated.
fn clamp_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn parse_sample_row(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<MetricSample> {
    let interface_data: Vec<u8> = row.try_get("interface_data")?;
    let interfaces = deserialize_interfaces(&interface_data);
    Ok(MetricSample {
        unit_id: row.try_get("unit_id")?,
        unit_name: row.try_get("unit_name")?,
        timestamp: from_millis(row.try_get("created_at")?),
        cpu_percent: row.try_get("cpu_percent")?,
        memory_used: row.try_get::<i64, _>("memory_used")?.max(0) as u64,
        memory_limit: row.try_get::<i64, _>("memory_limit")?.max(0) as u64,
        memory_percent: row.try_get("memory_percent")?,
        rx_bytes: row.try_get::<i64, _>("rx_bytes")?.max(0) as u64,
        tx_bytes: row.try_get::<i64, _>("tx_bytes")?.max(0) as u64,
        interfaces,
        error: None,
    })
}

/// Corrupt or unknown-version blobs read as no interfaces; totals are kept in their own columns.
fn deserialize_interfaces(bytes: &[u8]) -> Vec<InterfaceCounters> {
    let Some(payload) = blob::blob_payload(bytes, blob::BLOB_VERSION_INTERFACES) else {
        tracing::debug!("interface_data has unknown version, using empty");
        return vec![];
    };
    wincode::deserialize(payload).unwrap_or_else(|e| {
        tracing::debug!(error = %e, "wincode deserialize interfaces (corrupt), using empty");
        vec![]
    })
}
