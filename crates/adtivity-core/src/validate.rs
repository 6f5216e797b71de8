//! Event Validator: turns raw SDK payloads into normalized events.
//!
//! Validation is pure. It never touches a collaborator, so an in-flight call
//! can be dropped at any point without side effects.

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};

use crate::error::PipelineError;
use crate::event::{EventFamily, ValidatedEvent};

const MAX_EVENT_TYPE_LEN: usize = 128;
const MAX_IDENTIFIER_LEN: usize = 256;
const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Normalize an event type: trim, lower-case, and resolve SDK aliases.
pub fn normalize_event_type(raw: &str) -> String {
    let lowered = raw.trim().to_ascii_lowercase();
    match lowered.as_str() {
        "page" | "page_visit" | "pageview" => "page_view".to_string(),
        "tx" => "transaction".to_string(),
        _ => lowered,
    }
}

/// Blockchain a Web3 event belongs to; decides address and hash formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chain {
    /// EVM-compatible chain by numeric chain id.
    Evm(u64),
    Solana,
}

impl Chain {
    /// Resolve a chain from a numeric id, a decimal/hex string, a CAIP-2
    /// `eip155:<id>` string, or a well-known name.
    pub fn resolve(raw: &Value) -> Option<Chain> {
        match raw {
            Value::Number(n) => n.as_u64().filter(|id| *id > 0).map(Chain::Evm),
            Value::String(s) => Self::resolve_str(s),
            _ => None,
        }
    }

    fn resolve_str(raw: &str) -> Option<Chain> {
        let s = raw.trim().to_ascii_lowercase();
        let evm_id = match s.as_str() {
            "solana" | "solana-mainnet" | "solana-devnet" | "solana:mainnet" => {
                return Some(Chain::Solana)
            }
            "ethereum" | "mainnet" => Some(1),
            "optimism" => Some(10),
            "bsc" => Some(56),
            "polygon" => Some(137),
            "base" => Some(8453),
            "arbitrum" => Some(42161),
            "avalanche" => Some(43114),
            other => {
                if let Some(hex_id) = other.strip_prefix("0x") {
                    u64::from_str_radix(hex_id, 16).ok()
                } else if let Some(caip) = other.strip_prefix("eip155:") {
                    caip.parse().ok()
                } else {
                    other.parse().ok()
                }
            }
        };
        evm_id.filter(|id| *id > 0).map(Chain::Evm)
    }

    /// Normalized identifier stored with the event.
    pub fn id(&self) -> String {
        match self {
            Chain::Evm(id) => id.to_string(),
            Chain::Solana => "solana".to_string(),
        }
    }

    pub fn normalize_tx_hash(&self, raw: &str) -> Option<String> {
        let raw = raw.trim();
        match self {
            Chain::Evm(_) => prefixed_hex(raw, 64),
            Chain::Solana => {
                (is_base58(raw) && (64..=88).contains(&raw.len())).then(|| raw.to_string())
            }
        }
    }

    pub fn normalize_address(&self, raw: &str) -> Option<String> {
        let raw = raw.trim();
        match self {
            Chain::Evm(_) => prefixed_hex(raw, 40),
            Chain::Solana => {
                (is_base58(raw) && (32..=44).contains(&raw.len())).then(|| raw.to_string())
            }
        }
    }
}

/// `0x` followed by exactly `digits` hex digits, lower-cased.
fn prefixed_hex(raw: &str, digits: usize) -> Option<String> {
    let body = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X"))?;
    if body.len() == digits && body.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(format!("0x{}", body.to_ascii_lowercase()))
    } else {
        None
    }
}

fn is_base58(raw: &str) -> bool {
    !raw.is_empty() && raw.chars().all(|c| BASE58_ALPHABET.contains(c))
}

/// Parse an occurred-at value: RFC 3339 string or integer epoch milliseconds.
pub fn parse_timestamp(raw: &Value) -> Option<DateTime<Utc>> {
    match raw {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct EventValidator {
    max_properties_bytes: usize,
    max_clock_skew: Duration,
}

impl EventValidator {
    pub fn new(max_properties_bytes: usize, max_clock_skew: Duration) -> Self {
        Self {
            max_properties_bytes,
            max_clock_skew,
        }
    }

    /// Validate `raw` as an event of `family` for `tenant_id`.
    ///
    /// `now` bounds how far in the future an occurred-at timestamp may be.
    pub fn validate(
        &self,
        tenant_id: &str,
        family: EventFamily,
        raw: &Value,
        now: DateTime<Utc>,
    ) -> Result<ValidatedEvent, PipelineError> {
        let obj = raw
            .as_object()
            .ok_or_else(|| PipelineError::validation("payload", "must be a JSON object"))?;

        let event_type = self.event_type(obj)?;
        let occurred_at = self.occurred_at(obj, now)?;
        let event_name = optional_string(obj, &["event_name", "eventName"])?
            .unwrap_or_else(|| event_type.clone());
        let user_id = optional_string(obj, &["user_id"])?;
        let anonymous_id = optional_string(obj, &["anonymous_id"])?;
        let session_id = optional_string(obj, &["session_id"])?;
        let properties = self.properties(obj)?;

        let mut event = ValidatedEvent {
            tenant_id: tenant_id.to_string(),
            family,
            event_type,
            event_name,
            occurred_at,
            user_id,
            anonymous_id,
            session_id,
            chain_id: None,
            tx_hash: None,
            wallet_address: None,
            contract_address: None,
            properties,
        };

        if family == EventFamily::Web3 {
            self.web3_fields(obj, &mut event)?;
        }
        Ok(event)
    }

    fn event_type(&self, obj: &Map<String, Value>) -> Result<String, PipelineError> {
        let raw = optional_string(obj, &["type", "event_type"])?
            .ok_or_else(|| PipelineError::validation("type", "is required"))?;
        let normalized = normalize_event_type(&raw);
        if normalized.len() > MAX_EVENT_TYPE_LEN {
            return Err(PipelineError::validation(
                "type",
                format!("must be at most {MAX_EVENT_TYPE_LEN} characters"),
            ));
        }
        Ok(normalized)
    }

    fn occurred_at(
        &self,
        obj: &Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, PipelineError> {
        let raw = first_present(obj, &["timestamp", "occurred_at"])
            .ok_or_else(|| PipelineError::validation("timestamp", "is required"))?;
        let ts = parse_timestamp(raw).ok_or_else(|| {
            PipelineError::validation(
                "timestamp",
                "must be an RFC 3339 string or epoch milliseconds",
            )
        })?;
        if ts > now + self.max_clock_skew {
            return Err(PipelineError::validation(
                "timestamp",
                "is too far in the future",
            ));
        }
        Ok(ts)
    }

    fn properties(&self, obj: &Map<String, Value>) -> Result<Map<String, Value>, PipelineError> {
        let props = match first_present(obj, &["properties"]) {
            None => return Ok(Map::new()),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => {
                return Err(PipelineError::validation(
                    "properties",
                    "must be a JSON object",
                ))
            }
        };
        let size = serde_json::to_vec(&props)
            .map(|bytes| bytes.len())
            .map_err(|e| PipelineError::validation("properties", e.to_string()))?;
        if size > self.max_properties_bytes {
            return Err(PipelineError::PayloadTooLarge {
                size,
                limit: self.max_properties_bytes,
            });
        }
        Ok(props)
    }

    fn web3_fields(
        &self,
        obj: &Map<String, Value>,
        event: &mut ValidatedEvent,
    ) -> Result<(), PipelineError> {
        let chain_raw = first_present(obj, &["chain_id"])
            .ok_or_else(|| PipelineError::validation("chain_id", "is required"))?;
        let chain = Chain::resolve(chain_raw)
            .ok_or_else(|| PipelineError::validation("chain_id", "unknown chain"))?;

        let tx_raw = optional_string(obj, &["transaction_hash", "tx_hash"])?
            .ok_or_else(|| PipelineError::validation("transaction_hash", "is required"))?;
        let tx_hash = chain.normalize_tx_hash(&tx_raw).ok_or_else(|| {
            PipelineError::validation(
                "transaction_hash",
                format!("malformed transaction hash for chain {}", chain.id()),
            )
        })?;

        let wallet_raw = optional_string(obj, &["wallet_address"])?
            .ok_or_else(|| PipelineError::validation("wallet_address", "is required"))?;
        let wallet = chain.normalize_address(&wallet_raw).ok_or_else(|| {
            PipelineError::validation(
                "wallet_address",
                format!("malformed address for chain {}", chain.id()),
            )
        })?;

        let contract = match optional_string(obj, &["contract_address"])? {
            Some(raw) => Some(chain.normalize_address(&raw).ok_or_else(|| {
                PipelineError::validation(
                    "contract_address",
                    format!("malformed address for chain {}", chain.id()),
                )
            })?),
            None => None,
        };

        event.chain_id = Some(chain.id());
        event.tx_hash = Some(tx_hash);
        event.wallet_address = Some(wallet);
        event.contract_address = contract;
        Ok(())
    }
}

/// First non-null value among `keys`.
fn first_present<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null())
}

/// Optional string field (first of `keys`); empty strings read as absent.
fn optional_string(
    obj: &Map<String, Value>,
    keys: &[&str],
) -> Result<Option<String>, PipelineError> {
    let Some(value) = first_present(obj, keys) else {
        return Ok(None);
    };
    let field = keys.first().copied().unwrap_or("field");
    let s = value
        .as_str()
        .ok_or_else(|| PipelineError::validation(field, "must be a string"))?
        .trim();
    if s.len() > MAX_IDENTIFIER_LEN {
        return Err(PipelineError::validation(
            field,
            format!("must be at most {MAX_IDENTIFIER_LEN} characters"),
        ));
    }
    Ok((!s.is_empty()).then(|| s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    const TX: &str = "0x5c504ed432cb51138bcf09aa5e8a410dd4a1e204ef84bfed1be16dfba1b22060";
    const WALLET: &str = "0x52908400098527886E0F7030069857D2E4169EE7";

    fn validator() -> EventValidator {
        EventValidator::new(64 * 1024, Duration::minutes(5))
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).single().unwrap_or_default()
    }

    fn field_of(err: PipelineError) -> String {
        match err {
            PipelineError::Validation { field, .. } => field,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn web2_page_alias_normalizes_to_page_view() {
        let raw = json!({
            "type": " Page ",
            "timestamp": "2025-06-01T11:30:00+02:00",
            "user_id": "u-1",
            "properties": { "path": "/pricing" }
        });
        let event = validator()
            .validate("t1", EventFamily::Web2, &raw, now())
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(event.event_type, "page_view");
        assert_eq!(event.event_name, "page_view");
        assert_eq!(
            event.occurred_at,
            Utc.with_ymd_and_hms(2025, 6, 1, 9, 30, 0).single().unwrap_or_default()
        );
        assert_eq!(event.user_id.as_deref(), Some("u-1"));
        assert_eq!(event.properties.get("path"), Some(&json!("/pricing")));
    }

    #[test]
    fn epoch_millis_timestamp_is_accepted() {
        let raw = json!({ "type": "click", "timestamp": 1_748_779_200_000_i64 });
        let event = validator()
            .validate("t1", EventFamily::Web2, &raw, now())
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(event.occurred_at, now());
    }

    #[test]
    fn missing_type_is_rejected_with_field() {
        let raw = json!({ "timestamp": "2025-06-01T11:00:00Z" });
        let err = validator()
            .validate("t1", EventFamily::Web2, &raw, now())
            .err()
            .unwrap_or_else(|| panic!("expected error"));
        assert_eq!(field_of(err), "type");
    }

    #[test]
    fn unparseable_timestamp_is_rejected() {
        let raw = json!({ "type": "click", "timestamp": "yesterday" });
        let err = validator()
            .validate("t1", EventFamily::Web2, &raw, now())
            .err()
            .unwrap_or_else(|| panic!("expected error"));
        assert_eq!(field_of(err), "timestamp");
    }

    #[test]
    fn future_timestamp_beyond_skew_is_rejected() {
        let raw = json!({ "type": "click", "timestamp": "2025-06-01T13:00:00Z" });
        assert!(validator()
            .validate("t1", EventFamily::Web2, &raw, now())
            .is_err());
    }

    #[test]
    fn oversized_properties_are_payload_too_large() {
        let big = "x".repeat(2048);
        let raw = json!({ "type": "click", "timestamp": "2025-06-01T11:00:00Z", "properties": { "blob": big } });
        let small = EventValidator::new(1024, Duration::minutes(5));
        assert!(matches!(
            small.validate("t1", EventFamily::Web2, &raw, now()),
            Err(PipelineError::PayloadTooLarge { limit: 1024, .. })
        ));
    }

    #[test]
    fn web3_transaction_normalizes_hex_fields() {
        let raw = json!({
            "type": "tx",
            "timestamp": "2025-06-01T11:00:00Z",
            "chain_id": "0x89",
            "transaction_hash": TX.to_uppercase().replacen("0X", "0x", 1),
            "wallet_address": WALLET,
            "properties": { "value": 3.5 }
        });
        let event = validator()
            .validate("t1", EventFamily::Web3, &raw, now())
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(event.event_type, "transaction");
        assert_eq!(event.chain_id.as_deref(), Some("137"));
        assert_eq!(event.tx_hash.as_deref(), Some(TX));
        assert_eq!(
            event.wallet_address.as_deref(),
            Some(WALLET.to_ascii_lowercase().as_str())
        );
    }

    #[test]
    fn web3_non_hex_hash_is_rejected() {
        let raw = json!({
            "type": "transfer",
            "timestamp": "2025-06-01T11:00:00Z",
            "chain_id": 1,
            "transaction_hash": "0xZZ504ed432cb51138bcf09aa5e8a410dd4a1e204ef84bfed1be16dfba1b22060",
            "wallet_address": WALLET
        });
        let err = validator()
            .validate("t1", EventFamily::Web3, &raw, now())
            .err()
            .unwrap_or_else(|| panic!("expected error"));
        assert_eq!(field_of(err), "transaction_hash");
    }

    #[test]
    fn web3_unknown_chain_is_rejected() {
        let raw = json!({
            "type": "transfer",
            "timestamp": "2025-06-01T11:00:00Z",
            "chain_id": "dogechain-classic",
            "transaction_hash": TX,
            "wallet_address": WALLET
        });
        let err = validator()
            .validate("t1", EventFamily::Web3, &raw, now())
            .err()
            .unwrap_or_else(|| panic!("expected error"));
        assert_eq!(field_of(err), "chain_id");
    }

    #[test]
    fn solana_accepts_base58_and_rejects_evm_address() {
        let signature = "5VERv8NMvzbJMEkV8xnrLkEaWRtSz9CosKDYjCJjBRnbJLgp8uirBgmQpjKhoR4tjF3ZpRzrFmBV6UjKdiSZkQUW";
        let ok = json!({
            "type": "transfer",
            "timestamp": "2025-06-01T11:00:00Z",
            "chain_id": "solana",
            "transaction_hash": signature,
            "wallet_address": "7EcDhSYGxXyscszYEp35KHN8vvw3svAuLKTzXwCFLtV"
        });
        assert!(validator()
            .validate("t1", EventFamily::Web3, &ok, now())
            .is_ok());

        let mut bad = ok.clone();
        bad["wallet_address"] = json!(WALLET);
        let err = validator()
            .validate("t1", EventFamily::Web3, &bad, now())
            .err()
            .unwrap_or_else(|| panic!("expected error"));
        assert_eq!(field_of(err), "wallet_address");
    }
}
