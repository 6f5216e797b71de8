use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use duckdb::Connection;

use adtivity_core::metric::{Aggregate, AggregateDelta, AggregateUpdate, BucketRange, Granularity};

use crate::DuckDbBackend;

impl DuckDbBackend {
    /// Apply every update in one transaction; either all land or none do.
    pub async fn merge_aggregates(
        &self,
        tenant_id: &str,
        updates: &[AggregateUpdate],
        now: DateTime<Utc>,
    ) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        for update in updates {
            apply_update(&tx, tenant_id, update, now.timestamp_millis())?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Wipe the tenant's aggregates (and distinct member sets) for the
    /// granularity and bucket range, then apply `updates`.
    pub async fn replace_aggregates(
        &self,
        tenant_id: &str,
        granularity: Granularity,
        range: &BucketRange,
        updates: &[AggregateUpdate],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let (start, end) = (range.start.timestamp(), range.end.timestamp());
        tx.execute(
            "DELETE FROM aggregate_members \
             WHERE tenant_id = ?1 AND granularity = ?2 \
               AND bucket_start >= ?3 AND bucket_start < ?4",
            duckdb::params![tenant_id, granularity.as_str(), start, end],
        )?;
        tx.execute(
            "DELETE FROM aggregates \
             WHERE tenant_id = ?1 AND granularity = ?2 \
               AND bucket_start >= ?3 AND bucket_start < ?4",
            duckdb::params![tenant_id, granularity.as_str(), start, end],
        )?;
        for update in updates.iter().filter(|u| range.contains(u.bucket_start)) {
            apply_update(&tx, tenant_id, update, now.timestamp_millis())?;
        }
        tx.commit()?;
        Ok(())
    }

    pub async fn scan_aggregate(
        &self,
        tenant_id: &str,
        metric_key: &str,
        granularity: Granularity,
        range: &BucketRange,
    ) -> Result<Vec<Aggregate>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT bucket_start, value, late_corrected, updated_at_ms FROM aggregates \
             WHERE tenant_id = ?1 AND metric_key = ?2 AND granularity = ?3 \
               AND bucket_start >= ?4 AND bucket_start < ?5 \
             ORDER BY bucket_start",
        )?;
        let mapped = stmt.query_map(
            duckdb::params![
                tenant_id,
                metric_key,
                granularity.as_str(),
                range.start.timestamp(),
                range.end.timestamp()
            ],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )?;

        let mut rows = Vec::new();
        for row in mapped {
            let (bucket_start, value, late_corrected, updated_at_ms) = row?;
            rows.push(Aggregate {
                tenant_id: tenant_id.to_string(),
                metric_key: metric_key.to_string(),
                granularity,
                bucket_start: DateTime::from_timestamp(bucket_start, 0)
                    .ok_or_else(|| anyhow!("bucket start out of range: {bucket_start}"))?,
                value,
                late_corrected,
                updated_at: DateTime::from_timestamp_millis(updated_at_ms),
            });
        }
        Ok(rows)
    }
}

fn apply_update(conn: &Connection, tenant_id: &str, update: &AggregateUpdate, now_ms: i64) -> Result<()> {
    let granularity = update.granularity.as_str();
    let bucket_start = update.bucket_start.timestamp();
    match &update.delta {
        AggregateDelta::Add(delta) => {
            conn.execute(
                "INSERT INTO aggregates \
                 (tenant_id, metric_key, granularity, bucket_start, value, late_corrected, updated_at_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT (tenant_id, metric_key, granularity, bucket_start) DO UPDATE SET \
                   value = aggregates.value + EXCLUDED.value, \
                   late_corrected = aggregates.late_corrected OR EXCLUDED.late_corrected, \
                   updated_at_ms = EXCLUDED.updated_at_ms",
                duckdb::params![
                    tenant_id,
                    update.metric_key,
                    granularity,
                    bucket_start,
                    delta,
                    update.late,
                    now_ms
                ],
            )?;
        }
        AggregateDelta::Members(members) => {
            for member in members {
                conn.execute(
                    "INSERT OR IGNORE INTO aggregate_members \
                     (tenant_id, metric_key, granularity, bucket_start, member) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    duckdb::params![tenant_id, update.metric_key, granularity, bucket_start, member],
                )?;
            }
            let distinct: i64 = conn
                .prepare(
                    "SELECT COUNT(*) FROM aggregate_members \
                     WHERE tenant_id = ?1 AND metric_key = ?2 AND granularity = ?3 AND bucket_start = ?4",
                )?
                .query_row(
                    duckdb::params![tenant_id, update.metric_key, granularity, bucket_start],
                    |row| row.get(0),
                )?;
            conn.execute(
                "INSERT INTO aggregates \
                 (tenant_id, metric_key, granularity, bucket_start, value, late_corrected, updated_at_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT (tenant_id, metric_key, granularity, bucket_start) DO UPDATE SET \
                   value = EXCLUDED.value, \
                   late_corrected = aggregates.late_corrected OR EXCLUDED.late_corrected, \
                   updated_at_ms = EXCLUDED.updated_at_ms",
                duckdb::params![
                    tenant_id,
                    update.metric_key,
                    granularity,
                    bucket_start,
                    distinct as f64,
                    update.late,
                    now_ms
                ],
            )?;
        }
    }
    Ok(())
}
