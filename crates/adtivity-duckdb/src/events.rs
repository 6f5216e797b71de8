use std::collections::HashSet;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use duckdb::Connection;
use serde_json::{Map, Value};

use adtivity_core::event::{Event, EventFamily, IngestionId};
use adtivity_core::metric::TimeRange;
use adtivity_core::store::AppendOutcome;

use crate::DuckDbBackend;

const EVENT_COLUMNS: &str = "ingestion_id, family, event_type, event_name, \
     occurred_at_ms, received_at_ms, user_id, anonymous_id, session_id, \
     chain_id, tx_hash, wallet_address, contract_address, properties";

struct EventRow {
    ingestion_id: i64,
    family: String,
    event_type: String,
    event_name: String,
    occurred_at_ms: i64,
    received_at_ms: i64,
    user_id: Option<String>,
    anonymous_id: Option<String>,
    session_id: Option<String>,
    chain_id: Option<String>,
    tx_hash: Option<String>,
    wallet_address: Option<String>,
    contract_address: Option<String>,
    properties: String,
}

impl EventRow {
    fn into_event(self, tenant_id: &str) -> Result<Event> {
        let family = EventFamily::parse(&self.family)
            .ok_or_else(|| anyhow!("unknown event family {:?}", self.family))?;
        let properties: Map<String, Value> = serde_json::from_str(&self.properties)?;
        Ok(Event {
            ingestion_id: IngestionId::try_from(self.ingestion_id)?,
            tenant_id: tenant_id.to_string(),
            family,
            event_type: self.event_type,
            event_name: self.event_name,
            occurred_at: from_millis(self.occurred_at_ms)?,
            received_at: from_millis(self.received_at_ms)?,
            user_id: self.user_id,
            anonymous_id: self.anonymous_id,
            session_id: self.session_id,
            chain_id: self.chain_id,
            tx_hash: self.tx_hash,
            wallet_address: self.wallet_address,
            contract_address: self.contract_address,
            properties,
        })
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("timestamp out of range: {ms}"))
}

/// An event that passed the pre-insert checks.
struct PendingRow<'a> {
    event: &'a Event,
    db_id: i64,
    properties: String,
}

fn insert_row(conn: &Connection, tenant_id: &str, row: &PendingRow<'_>) -> duckdb::Result<usize> {
    let event = row.event;
    conn.execute(
        r#"INSERT INTO events (
            tenant_id, ingestion_id, family, event_type, event_name,
            occurred_at_ms, received_at_ms,
            user_id, anonymous_id, session_id,
            chain_id, tx_hash, wallet_address, contract_address,
            properties
        ) VALUES (
            ?1,  ?2,  ?3,  ?4,  ?5,
            ?6,  ?7,
            ?8,  ?9,  ?10,
            ?11, ?12, ?13, ?14,
            ?15
        )"#,
        duckdb::params![
            tenant_id,
            row.db_id,
            event.family.as_str(),
            event.event_type,
            event.event_name,
            event.occurred_at.timestamp_millis(),
            event.received_at.timestamp_millis(),
            event.user_id,
            event.anonymous_id,
            event.session_id,
            event.chain_id,
            event.tx_hash,
            event.wallet_address,
            event.contract_address,
            row.properties,
        ],
    )
}

impl DuckDbBackend {
    /// Append `events` for `tenant_id`.
    ///
    /// Ids already stored are reported as duplicates and skipped. Events that
    /// cannot be stored (foreign tenant, id out of range, id repeated within
    /// the batch, unserializable properties, refused by the database) are
    /// rejected individually; the rest of the batch still commits.
    ///
    /// The batch is inserted in one transaction. If the database refuses a
    /// row, that transaction is rolled back and the rows are replayed one
    /// transaction each. A replay in which every row fails is treated as an
    /// outage and returned as an error so the caller retries.
    pub async fn append_events(&self, tenant_id: &str, events: &[Event]) -> Result<AppendOutcome> {
        let mut outcome = AppendOutcome::default();
        if events.is_empty() {
            return Ok(outcome);
        }

        let mut conn = self.conn.lock().await;

        let candidate_ids: Vec<i64> = events
            .iter()
            .filter_map(|e| i64::try_from(e.ingestion_id).ok())
            .collect();
        let stored = stored_ids(&conn, tenant_id, &candidate_ids)?;
        let mut in_batch = HashSet::with_capacity(events.len());
        let mut rows = Vec::with_capacity(events.len());

        for event in events {
            let id = event.ingestion_id;
            if event.tenant_id != tenant_id {
                outcome.rejected.push((id, "tenant mismatch".to_string()));
                continue;
            }
            let Ok(db_id) = i64::try_from(id) else {
                outcome
                    .rejected
                    .push((id, "ingestion id out of range".to_string()));
                continue;
            };
            if stored.contains(&db_id) {
                outcome.duplicates.push(id);
                continue;
            }
            if !in_batch.insert(db_id) {
                outcome
                    .rejected
                    .push((id, "ingestion id repeated within batch".to_string()));
                continue;
            }
            match serde_json::to_string(&event.properties) {
                Ok(properties) => rows.push(PendingRow {
                    event,
                    db_id,
                    properties,
                }),
                Err(e) => outcome
                    .rejected
                    .push((id, format!("properties not serializable: {e}"))),
            }
        }

        let tx = conn.transaction()?;
        let refused = rows.iter().find_map(|row| {
            insert_row(&tx, tenant_id, row)
                .err()
                .map(|e| (row.event.ingestion_id, e))
        });
        match refused {
            None => {
                tx.commit()?;
                outcome
                    .accepted
                    .extend(rows.iter().map(|row| row.event.ingestion_id));
            }
            Some((ingestion_id, error)) => {
                drop(tx);
                tracing::warn!(
                    tenant_id,
                    ingestion_id,
                    error = %error,
                    "batch insert refused, replaying events one by one"
                );
                let mut first_error = None;
                for row in &rows {
                    let tx = conn.transaction()?;
                    let id = row.event.ingestion_id;
                    match insert_row(&tx, tenant_id, row).and_then(|_| tx.commit()) {
                        Ok(()) => outcome.accepted.push(id),
                        Err(e) => {
                            outcome.rejected.push((id, e.to_string()));
                            if first_error.is_none() {
                                first_error = Some(e);
                            }
                        }
                    }
                }
                if outcome.accepted.is_empty() {
                    if let Some(e) = first_error {
                        return Err(anyhow!(e));
                    }
                }
            }
        }

        tracing::debug!(
            tenant_id,
            accepted = outcome.accepted.len(),
            duplicates = outcome.duplicates.len(),
            rejected = outcome.rejected.len(),
            "appended events"
        );
        Ok(outcome)
    }

    pub async fn max_ingestion_id(&self, tenant_id: &str) -> Result<Option<IngestionId>> {
        let conn = self.conn.lock().await;
        let max: Option<i64> = conn
            .prepare("SELECT MAX(ingestion_id) FROM events WHERE tenant_id = ?1")?
            .query_row(duckdb::params![tenant_id], |row| row.get(0))?;
        max.map(IngestionId::try_from)
            .transpose()
            .map_err(anyhow::Error::from)
    }

    /// Events of the tenant whose `occurred_at` falls in `range`, in
    /// ingestion order.
    pub async fn scan_events(&self, tenant_id: &str, range: &TimeRange) -> Result<Vec<Event>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE tenant_id = ?1 AND occurred_at_ms >= ?2 AND occurred_at_ms < ?3 \
             ORDER BY ingestion_id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mapped = stmt.query_map(
            duckdb::params![
                tenant_id,
                range.start.timestamp_millis(),
                range.end.timestamp_millis()
            ],
            |row| {
                Ok(EventRow {
                    ingestion_id: row.get(0)?,
                    family: row.get(1)?,
                    event_type: row.get(2)?,
                    event_name: row.get(3)?,
                    occurred_at_ms: row.get(4)?,
                    received_at_ms: row.get(5)?,
                    user_id: row.get(6)?,
                    anonymous_id: row.get(7)?,
                    session_id: row.get(8)?,
                    chain_id: row.get(9)?,
                    tx_hash: row.get(10)?,
                    wallet_address: row.get(11)?,
                    contract_address: row.get(12)?,
                    properties: row.get(13)?,
                })
            },
        )?;

        let mut events = Vec::new();
        for row in mapped {
            events.push(row?.into_event(tenant_id)?);
        }
        Ok(events)
    }
}

/// Which of `ids` the tenant already has stored.
fn stored_ids(conn: &duckdb::Connection, tenant_id: &str, ids: &[i64]) -> Result<HashSet<i64>> {
    let (Some(min), Some(max)) = (ids.iter().min(), ids.iter().max()) else {
        return Ok(HashSet::new());
    };
    let mut stmt = conn.prepare(
        "SELECT ingestion_id FROM events \
         WHERE tenant_id = ?1 AND ingestion_id BETWEEN ?2 AND ?3",
    )?;
    let mapped = stmt.query_map(duckdb::params![tenant_id, min, max], |row| {
        row.get::<_, i64>(0)
    })?;
    let mut stored = HashSet::new();
    for id in mapped {
        stored.insert(id?);
    }
    Ok(stored)
}
