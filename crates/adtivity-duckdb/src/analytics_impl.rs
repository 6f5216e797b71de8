use async_trait::async_trait;
use chrono::{DateTime, Utc};

use adtivity_core::error::StoreError;
use adtivity_core::event::{Event, IngestionId};
use adtivity_core::metric::{Aggregate, AggregateUpdate, BucketRange, Granularity, TimeRange};
use adtivity_core::store::{AnalyticsStore, AppendOutcome};

use crate::DuckDbBackend;

#[async_trait]
impl AnalyticsStore for DuckDbBackend {
    async fn append_batch(
        &self,
        tenant_id: &str,
        events: &[Event],
    ) -> Result<AppendOutcome, StoreError> {
        Ok(DuckDbBackend::append_events(self, tenant_id, events).await?)
    }

    async fn max_ingestion_id(&self, tenant_id: &str) -> Result<Option<IngestionId>, StoreError> {
        Ok(DuckDbBackend::max_ingestion_id(self, tenant_id).await?)
    }

    async fn scan_events(
        &self,
        tenant_id: &str,
        range: &TimeRange,
    ) -> Result<Vec<Event>, StoreError> {
        Ok(DuckDbBackend::scan_events(self, tenant_id, range).await?)
    }

    async fn merge_aggregates(
        &self,
        tenant_id: &str,
        updates: &[AggregateUpdate],
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        Ok(DuckDbBackend::merge_aggregates(self, tenant_id, updates, now).await?)
    }

    async fn scan_aggregate(
        &self,
        tenant_id: &str,
        metric_key: &str,
        granularity: Granularity,
        range: &BucketRange,
    ) -> Result<Vec<Aggregate>, StoreError> {
        Ok(DuckDbBackend::scan_aggregate(self, tenant_id, metric_key, granularity, range).await?)
    }

    async fn replace_aggregates(
        &self,
        tenant_id: &str,
        granularity: Granularity,
        range: &BucketRange,
        updates: &[AggregateUpdate],
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        Ok(
            DuckDbBackend::replace_aggregates(self, tenant_id, granularity, range, updates, now)
                .await?,
        )
    }

    async fn ping(&self) -> Result<(), StoreError> {
        DuckDbBackend::ping(self)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}
