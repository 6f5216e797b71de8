//! Metric catalogue, time bucketing and aggregate records.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, PipelineError};
use crate::event::{Event, EventFamily};

// ---------------------------------------------------------------------------
// Buckets
// ---------------------------------------------------------------------------

/// Width of an aggregation bucket. Buckets are aligned to UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    #[default]
    Hour,
    Day,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Hour => "hour",
            Granularity::Day => "day",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "hour" | "hourly" => Some(Granularity::Hour),
            "day" | "daily" => Some(Granularity::Day),
            _ => None,
        }
    }

    pub fn seconds(&self) -> i64 {
        match self {
            Granularity::Hour => 3_600,
            Granularity::Day => 86_400,
        }
    }

    pub fn width(&self) -> Duration {
        Duration::seconds(self.seconds())
    }

    /// Start of the bucket containing `ts`.
    pub fn floor(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let step = self.seconds();
        let floored = ts.timestamp().div_euclid(step) * step;
        DateTime::from_timestamp(floored, 0).unwrap_or(ts)
    }

    /// Smallest bucket boundary at or after `ts`.
    pub fn ceil(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let floored = self.floor(ts);
        if floored == ts {
            floored
        } else {
            floored + self.width()
        }
    }

    /// Exclusive end of the bucket starting at `bucket_start`.
    pub fn bucket_end(&self, bucket_start: DateTime<Utc>) -> DateTime<Utc> {
        bucket_start + self.width()
    }

    /// Every bucket start covered by `range`, ascending.
    pub fn buckets(&self, range: &BucketRange) -> Vec<DateTime<Utc>> {
        let mut out = Vec::new();
        let mut cursor = range.start;
        while cursor < range.end {
            out.push(cursor);
            cursor += self.width();
        }
        out
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Half-open instant range `[start, end)` requested by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, PipelineError> {
        if end <= start {
            return Err(PipelineError::InvalidRange(
                "end must be after start".to_string(),
            ));
        }
        Ok(Self { start, end })
    }

    pub fn span(&self) -> Duration {
        self.end - self.start
    }

    /// Widen to bucket boundaries.
    pub fn to_buckets(&self, granularity: Granularity) -> BucketRange {
        BucketRange {
            start: granularity.floor(self.start),
            end: granularity.ceil(self.end),
        }
    }
}

/// Half-open, bucket-aligned range `[start, end)` of bucket starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BucketRange {
    pub fn contains(&self, bucket_start: DateTime<Utc>) -> bool {
        bucket_start >= self.start && bucket_start < self.end
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// How matching events contribute to a metric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MetricOp {
    Count,
    /// Sum of a numeric property. Events without a numeric value are skipped.
    Sum { property: String },
    /// Exact distinct count of an event field (or property) per bucket.
    Distinct { field: String },
}

/// Maps events of a family/type to a metric key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricRule {
    pub key: String,
    /// `None` matches both families.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family: Option<EventFamily>,
    /// Empty matches every event type.
    #[serde(default)]
    pub event_types: Vec<String>,
    #[serde(flatten)]
    pub op: MetricOp,
}

impl MetricRule {
    pub fn new(key: &str, family: Option<EventFamily>, event_types: &[&str], op: MetricOp) -> Self {
        Self {
            key: key.to_string(),
            family,
            event_types: event_types.iter().map(|t| t.to_string()).collect(),
            op,
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.family.map_or(true, |f| f == event.family)
            && (self.event_types.is_empty()
                || self.event_types.iter().any(|t| *t == event.event_type))
    }

    /// What `event` adds to this metric, or `None` when it does not apply.
    pub fn contribution(&self, event: &Event) -> Option<Contribution> {
        if !self.matches(event) {
            return None;
        }
        match &self.op {
            MetricOp::Count => Some(Contribution::Add(1.0)),
            MetricOp::Sum { property } => {
                numeric_property(event.properties.get(property)?).map(Contribution::Add)
            }
            MetricOp::Distinct { field } => member_of(event, field).map(Contribution::Member),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Contribution {
    Add(f64),
    Member(String),
}

fn numeric_property(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

fn member_of(event: &Event, field: &str) -> Option<String> {
    let direct = match field {
        "user" => event.user_id.clone().or_else(|| event.anonymous_id.clone()),
        "user_id" => event.user_id.clone(),
        "anonymous_id" => event.anonymous_id.clone(),
        "session_id" => event.session_id.clone(),
        "wallet_address" => event.wallet_address.clone(),
        "contract_address" => event.contract_address.clone(),
        "chain_id" => event.chain_id.clone(),
        "event_name" => Some(event.event_name.clone()),
        other => match event.properties.get(other)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        },
    };
    direct.filter(|m| !m.is_empty())
}

/// Default catalogue used when `ADTIVITY_METRIC_RULES` is unset.
pub fn default_metric_rules() -> Vec<MetricRule> {
    use EventFamily::{Web2, Web3};
    vec![
        MetricRule::new("page_view_count", Some(Web2), &["page_view"], MetricOp::Count),
        MetricRule::new("web2_event_count", Some(Web2), &[], MetricOp::Count),
        MetricRule::new(
            "active_users",
            Some(Web2),
            &[],
            MetricOp::Distinct {
                field: "user".to_string(),
            },
        ),
        MetricRule::new(
            "conversion_count",
            Some(Web2),
            &["purchase", "signup", "conversion"],
            MetricOp::Count,
        ),
        MetricRule::new(
            "revenue_usd",
            Some(Web2),
            &["purchase", "signup", "conversion"],
            MetricOp::Sum {
                property: "revenue".to_string(),
            },
        ),
        MetricRule::new("web3_tx_count", Some(Web3), &[], MetricOp::Count),
        MetricRule::new(
            "web3_transfer_volume",
            Some(Web3),
            &["transfer"],
            MetricOp::Sum {
                property: "value".to_string(),
            },
        ),
        MetricRule::new(
            "active_wallets",
            Some(Web3),
            &[],
            MetricOp::Distinct {
                field: "wallet_address".to_string(),
            },
        ),
    ]
}

/// Validated, key-indexed set of metric rules.
#[derive(Debug, Clone)]
pub struct MetricCatalog {
    rules: Vec<MetricRule>,
}

impl MetricCatalog {
    /// Build a catalogue, normalizing event types and rejecting malformed or
    /// duplicate keys.
    pub fn new(rules: Vec<MetricRule>) -> Result<Self, CoreError> {
        let mut seen = BTreeSet::new();
        let mut normalized = Vec::with_capacity(rules.len());
        for mut rule in rules {
            let valid_key = !rule.key.is_empty()
                && rule.key.len() <= 64
                && rule
                    .key
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
            if !valid_key {
                return Err(CoreError::Config(format!(
                    "metric key `{}` must be 1-64 chars of [a-z0-9_]",
                    rule.key
                )));
            }
            if !seen.insert(rule.key.clone()) {
                return Err(CoreError::Config(format!(
                    "duplicate metric key `{}`",
                    rule.key
                )));
            }
            rule.event_types = rule
                .event_types
                .iter()
                .map(|t| crate::validate::normalize_event_type(t))
                .collect();
            normalized.push(rule);
        }
        Ok(Self { rules: normalized })
    }

    pub fn rules(&self) -> &[MetricRule] {
        &self.rules
    }

    pub fn get(&self, key: &str) -> Option<&MetricRule> {
        self.rules.iter().find(|r| r.key == key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Fold `events` into one update per (metric key, bucket).
    ///
    /// Updates come back ordered by metric key then bucket start, each with
    /// `late = false`; the aggregator decides lateness.
    pub fn plan_updates(&self, granularity: Granularity, events: &[Event]) -> Vec<AggregateUpdate> {
        let mut planned: BTreeMap<(String, DateTime<Utc>), AggregateDelta> = BTreeMap::new();
        for event in events {
            let bucket_start = granularity.floor(event.occurred_at);
            for rule in &self.rules {
                let Some(contribution) = rule.contribution(event) else {
                    continue;
                };
                let slot = planned
                    .entry((rule.key.clone(), bucket_start))
                    .or_insert_with(|| match rule.op {
                        MetricOp::Distinct { .. } => AggregateDelta::Members(BTreeSet::new()),
                        _ => AggregateDelta::Add(0.0),
                    });
                match (slot, contribution) {
                    (AggregateDelta::Add(total), Contribution::Add(v)) => *total += v,
                    (AggregateDelta::Members(set), Contribution::Member(m)) => {
                        set.insert(m);
                    }
                    _ => {}
                }
            }
        }
        planned
            .into_iter()
            .map(|((metric_key, bucket_start), delta)| AggregateUpdate {
                metric_key,
                granularity,
                bucket_start,
                delta,
                late: false,
            })
            .collect()
    }

    /// Compute aggregates for `events` from scratch.
    pub fn compute(&self, tenant_id: &str, granularity: Granularity, events: &[Event]) -> Vec<Aggregate> {
        self.plan_updates(granularity, events)
            .into_iter()
            .map(|u| Aggregate {
                tenant_id: tenant_id.to_string(),
                value: u.delta.magnitude(),
                metric_key: u.metric_key,
                granularity,
                bucket_start: u.bucket_start,
                late_corrected: false,
                updated_at: None,
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

/// One metric value for one tenant and bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub tenant_id: String,
    pub metric_key: String,
    pub granularity: Granularity,
    pub bucket_start: DateTime<Utc>,
    pub value: f64,
    /// Set once a late event has been merged into a closed bucket.
    pub late_corrected: bool,
    /// `None` for buckets that never received an event.
    pub updated_at: Option<DateTime<Utc>>,
}

impl Aggregate {
    pub fn empty(
        tenant_id: &str,
        metric_key: &str,
        granularity: Granularity,
        bucket_start: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            metric_key: metric_key.to_string(),
            granularity,
            bucket_start,
            value: 0.0,
            late_corrected: false,
            updated_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AggregateDelta {
    Add(f64),
    /// Distinct members observed; the store keeps the set and the count.
    Members(BTreeSet<String>),
}

impl AggregateDelta {
    pub fn magnitude(&self) -> f64 {
        match self {
            AggregateDelta::Add(v) => *v,
            AggregateDelta::Members(set) => set.len() as f64,
        }
    }
}

/// An atomic merge the store applies to one aggregate row.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateUpdate {
    pub metric_key: String,
    pub granularity: Granularity,
    pub bucket_start: DateTime<Utc>,
    pub delta: AggregateDelta,
    pub late: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::{json, Map};

    fn event(family: EventFamily, event_type: &str, at: DateTime<Utc>) -> Event {
        Event {
            ingestion_id: 1,
            tenant_id: "t1".to_string(),
            family,
            event_type: event_type.to_string(),
            event_name: event_type.to_string(),
            occurred_at: at,
            received_at: at,
            user_id: None,
            anonymous_id: None,
            session_id: None,
            chain_id: None,
            tx_hash: None,
            wallet_address: None,
            contract_address: None,
            properties: Map::new(),
        }
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, h, m, 0).single().unwrap_or_default()
    }

    #[test]
    fn floor_and_ceil_align_to_hour() {
        let g = Granularity::Hour;
        assert_eq!(g.floor(at(10, 42)), at(10, 0));
        assert_eq!(g.ceil(at(10, 42)), at(11, 0));
        assert_eq!(g.ceil(at(10, 0)), at(10, 0));
    }

    #[test]
    fn day_floor_is_utc_midnight() {
        assert_eq!(Granularity::Day.floor(at(23, 59)), at(0, 0));
    }

    #[test]
    fn buckets_cover_widened_range() {
        let range = TimeRange::new(at(10, 30), at(12, 5)).unwrap_or_else(|e| panic!("{e}"));
        let buckets = Granularity::Hour.buckets(&range.to_buckets(Granularity::Hour));
        assert_eq!(buckets, vec![at(10, 0), at(11, 0), at(12, 0)]);
    }

    #[test]
    fn empty_range_is_invalid() {
        assert!(matches!(
            TimeRange::new(at(10, 0), at(10, 0)),
            Err(PipelineError::InvalidRange(_))
        ));
    }

    #[test]
    fn plan_merges_counts_per_bucket() {
        let catalog = MetricCatalog::new(default_metric_rules()).unwrap_or_else(|e| panic!("{e}"));
        let events = vec![
            event(EventFamily::Web2, "page_view", at(10, 1)),
            event(EventFamily::Web2, "page_view", at(10, 59)),
            event(EventFamily::Web2, "page_view", at(11, 0)),
        ];
        let aggregates = catalog.compute("t1", Granularity::Hour, &events);
        let page_views: Vec<(DateTime<Utc>, f64)> = aggregates
            .iter()
            .filter(|a| a.metric_key == "page_view_count")
            .map(|a| (a.bucket_start, a.value))
            .collect();
        assert_eq!(page_views, vec![(at(10, 0), 2.0), (at(11, 0), 1.0)]);
    }

    #[test]
    fn sum_skips_non_numeric_and_parses_strings() {
        let rule = MetricRule::new(
            "volume",
            Some(EventFamily::Web3),
            &["transfer"],
            MetricOp::Sum {
                property: "value".to_string(),
            },
        );
        let mut e = event(EventFamily::Web3, "transfer", at(9, 0));
        e.properties.insert("value".to_string(), json!("12.5"));
        assert_eq!(rule.contribution(&e), Some(Contribution::Add(12.5)));
        e.properties.insert("value".to_string(), json!({ "nested": 1 }));
        assert_eq!(rule.contribution(&e), None);
    }

    #[test]
    fn distinct_counts_unique_members() {
        let catalog = MetricCatalog::new(default_metric_rules()).unwrap_or_else(|e| panic!("{e}"));
        let mut a = event(EventFamily::Web3, "swap", at(8, 0));
        a.wallet_address = Some("0xaa".to_string());
        let mut b = a.clone();
        b.event_type = "transfer".to_string();
        let mut c = a.clone();
        c.wallet_address = Some("0xbb".to_string());
        let aggregates = catalog.compute("t1", Granularity::Hour, &[a, b, c]);
        let wallets = aggregates
            .iter()
            .find(|x| x.metric_key == "active_wallets")
            .map(|x| x.value);
        assert_eq!(wallets, Some(2.0));
    }

    #[test]
    fn catalog_rejects_duplicate_keys() {
        let rules = vec![
            MetricRule::new("a", None, &[], MetricOp::Count),
            MetricRule::new("a", None, &[], MetricOp::Count),
        ];
        assert!(MetricCatalog::new(rules).is_err());
    }

    #[test]
    fn rules_deserialize_from_json() {
        let raw = r#"[{"key":"swaps","family":"web3","event_types":["Swap"],"op":"count"},
                      {"key":"fees","op":"sum","property":"fee"}]"#;
        let rules: Vec<MetricRule> = serde_json::from_str(raw).unwrap_or_default();
        let catalog = MetricCatalog::new(rules).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(catalog.rules().len(), 2);
        assert_eq!(catalog.get("swaps").map(|r| r.event_types.clone()), Some(vec!["swap".to_string()]));
        assert_eq!(
            catalog.get("fees").map(|r| r.op.clone()),
            Some(MetricOp::Sum {
                property: "fee".to_string()
            })
        );
    }
}
