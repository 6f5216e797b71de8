use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Tenant-scoped, monotonically increasing identifier assigned when an event
/// enters its tenant's ingestion lane. Doubles as the idempotency key for
/// store appends.
pub type IngestionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventFamily {
    Web2,
    Web3,
}

impl EventFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventFamily::Web2 => "web2",
            EventFamily::Web3 => "web3",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "web2" => Some(EventFamily::Web2),
            "web3" => Some(EventFamily::Web3),
            _ => None,
        }
    }

    /// Infer the family of an SDK payload that did not declare one.
    ///
    /// Web3 when the type is a transaction or the payload carries wallet or
    /// chain information; Web2 otherwise.
    pub fn infer(payload: &Value) -> Self {
        let Some(obj) = payload.as_object() else {
            return EventFamily::Web2;
        };
        let is_tx = obj
            .get("type")
            .and_then(Value::as_str)
            .map(|t| matches!(t.trim().to_ascii_lowercase().as_str(), "tx" | "transaction"))
            .unwrap_or(false);
        let has_chain_fields = ["wallet_address", "chain_id"]
            .iter()
            .any(|k| obj.get(*k).is_some_and(|v| !v.is_null()));
        if is_tx || has_chain_fields {
            EventFamily::Web3
        } else {
            EventFamily::Web2
        }
    }
}

impl fmt::Display for EventFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A payload that passed validation, normalized but not yet admitted to a
/// lane. It has no ingestion id yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedEvent {
    pub tenant_id: String,
    pub family: EventFamily,
    /// Normalized (trimmed, lower-cased, alias-resolved) event type.
    pub event_type: String,
    pub event_name: String,
    pub occurred_at: DateTime<Utc>,
    pub user_id: Option<String>,
    pub anonymous_id: Option<String>,
    pub session_id: Option<String>,
    /// Web3 only: normalized chain id (decimal EVM id or `solana`).
    pub chain_id: Option<String>,
    pub tx_hash: Option<String>,
    pub wallet_address: Option<String>,
    pub contract_address: Option<String>,
    pub properties: Map<String, Value>,
}

impl ValidatedEvent {
    pub fn into_event(self, ingestion_id: IngestionId, received_at: DateTime<Utc>) -> Event {
        Event {
            ingestion_id,
            tenant_id: self.tenant_id,
            family: self.family,
            event_type: self.event_type,
            event_name: self.event_name,
            occurred_at: self.occurred_at,
            received_at,
            user_id: self.user_id,
            anonymous_id: self.anonymous_id,
            session_id: self.session_id,
            chain_id: self.chain_id,
            tx_hash: self.tx_hash,
            wallet_address: self.wallet_address,
            contract_address: self.contract_address,
            properties: self.properties,
        }
    }
}

/// The stored event. Mirrors the DuckDB `events` table columns.
///
/// Immutable once written; never deleted by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub ingestion_id: IngestionId,
    pub tenant_id: String,
    pub family: EventFamily,
    pub event_type: String,
    pub event_name: String,
    pub occurred_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub user_id: Option<String>,
    pub anonymous_id: Option<String>,
    pub session_id: Option<String>,
    pub chain_id: Option<String>,
    pub tx_hash: Option<String>,
    pub wallet_address: Option<String>,
    pub contract_address: Option<String>,
    pub properties: Map<String, Value>,
}

/// Ordered events of one tenant, flushed together from its lane.
#[derive(Debug, Clone)]
pub struct Batch {
    pub tenant_id: String,
    pub events: Vec<Event>,
}

impl Batch {
    pub fn new(tenant_id: impl Into<String>, events: Vec<Event>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            events,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Compact description for logs and the operator channel.
    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            tenant_id: self.tenant_id.clone(),
            event_count: self.events.len(),
            first_ingestion_id: self.events.first().map(|e| e.ingestion_id),
            last_ingestion_id: self.events.last().map(|e| e.ingestion_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub tenant_id: String,
    pub event_count: usize,
    pub first_ingestion_id: Option<IngestionId>,
    pub last_ingestion_id: Option<IngestionId>,
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.first_ingestion_id, self.last_ingestion_id) {
            (Some(first), Some(last)) => write!(
                f,
                "tenant={} events={} ids={}..={}",
                self.tenant_id, self.event_count, first, last
            ),
            _ => write!(f, "tenant={} events=0", self.tenant_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn infer_family_from_transaction_type() {
        assert_eq!(EventFamily::infer(&json!({ "type": "TX" })), EventFamily::Web3);
        assert_eq!(
            EventFamily::infer(&json!({ "type": "transaction" })),
            EventFamily::Web3
        );
    }

    #[test]
    fn infer_family_from_chain_fields() {
        assert_eq!(
            EventFamily::infer(&json!({ "type": "connect", "wallet_address": "0xabc" })),
            EventFamily::Web3
        );
        assert_eq!(
            EventFamily::infer(&json!({ "type": "page", "chain_id": null })),
            EventFamily::Web2
        );
    }

    #[test]
    fn batch_summary_reports_id_span() {
        let batch = Batch::new("t1", vec![]);
        assert_eq!(batch.summary().to_string(), "tenant=t1 events=0");
    }
}
