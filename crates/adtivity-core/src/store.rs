use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::event::{Event, IngestionId};
use crate::metric::{Aggregate, AggregateUpdate, BucketRange, Granularity, TimeRange};

/// Result of one `append_batch` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppendOutcome {
    /// Ids newly written by this call, in batch order.
    pub accepted: Vec<IngestionId>,
    /// Ids already present from an earlier attempt; skipped.
    pub duplicates: Vec<IngestionId>,
    /// Ids the store refused, with the reason.
    pub rejected: Vec<(IngestionId, String)>,
}

impl AppendOutcome {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// The durable store collaborator.
///
/// Every method takes the tenant id explicitly and must only read or write
/// that tenant's rows.
#[async_trait]
pub trait AnalyticsStore: Send + Sync + 'static {
    /// Append events in order. Idempotent per `(tenant_id, ingestion_id)`:
    /// ids already stored come back in `duplicates` and are not written
    /// again. Per-event failures go to `rejected` and do not abort the rest
    /// of the batch. An `Err` means nothing from this call was committed.
    async fn append_batch(
        &self,
        tenant_id: &str,
        events: &[Event],
    ) -> Result<AppendOutcome, StoreError>;

    /// Highest ingestion id stored for the tenant.
    async fn max_ingestion_id(&self, tenant_id: &str) -> Result<Option<IngestionId>, StoreError>;

    /// Stored events with `occurred_at` in `range`, by ingestion id.
    async fn scan_events(&self, tenant_id: &str, range: &TimeRange)
        -> Result<Vec<Event>, StoreError>;

    /// Apply atomic merges to aggregate rows: sums add, distinct member sets
    /// union. `late` updates set the row's late-corrected flag.
    async fn merge_aggregates(
        &self,
        tenant_id: &str,
        updates: &[AggregateUpdate],
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Stored aggregate rows in `range`. Buckets with no row are absent.
    async fn scan_aggregate(
        &self,
        tenant_id: &str,
        metric_key: &str,
        granularity: Granularity,
        range: &BucketRange,
    ) -> Result<Vec<Aggregate>, StoreError>;

    /// Atomically drop every aggregate row of the tenant and granularity in
    /// `range` and apply `updates` in their place.
    async fn replace_aggregates(
        &self,
        tenant_id: &str,
        granularity: Granularity,
        range: &BucketRange,
        updates: &[AggregateUpdate],
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}
