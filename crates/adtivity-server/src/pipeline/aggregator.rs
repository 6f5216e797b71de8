use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info};

use adtivity_core::cache::{AggregateCache, CacheKey};
use adtivity_core::clock::Clock;
use adtivity_core::config::PipelineConfig;
use adtivity_core::error::PipelineError;
use adtivity_core::event::{Batch, Event};
use adtivity_core::metric::{BucketRange, MetricCatalog, TimeRange};
use adtivity_core::operator::OperatorChannel;
use adtivity_core::store::AnalyticsStore;

use super::cache::CacheFence;
use super::writer::with_backoff;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RebuildReport {
    pub events: usize,
    pub buckets: usize,
    pub aggregates: usize,
}

/// Folds written events into stored aggregates and keeps the cache honest.
pub(crate) struct MetricsAggregator {
    store: Arc<dyn AnalyticsStore>,
    cache: Arc<dyn AggregateCache>,
    operator: Arc<dyn OperatorChannel>,
    clock: Arc<dyn Clock>,
    catalog: Arc<MetricCatalog>,
    config: Arc<PipelineConfig>,
    fence: Arc<CacheFence>,
}

impl MetricsAggregator {
    pub(crate) fn new(
        store: Arc<dyn AnalyticsStore>,
        cache: Arc<dyn AggregateCache>,
        operator: Arc<dyn OperatorChannel>,
        clock: Arc<dyn Clock>,
        catalog: Arc<MetricCatalog>,
        config: Arc<PipelineConfig>,
        fence: Arc<CacheFence>,
    ) -> Self {
        Self {
            store,
            cache,
            operator,
            clock,
            catalog,
            config,
            fence,
        }
    }

    /// Merge `events` (already durably written) into their buckets.
    ///
    /// Updates for buckets that closed before `now` are flagged late. Within
    /// the grace window their cache entries are invalidated like any other;
    /// past it the store is corrected but cached reads may stay stale until
    /// an explicit invalidation or TTL expiry.
    pub(crate) async fn apply(&self, tenant_id: &str, events: &[Event]) {
        if events.is_empty() {
            return;
        }
        let granularity = self.config.granularity;
        let now = self.clock.now();
        let grace = self.config.late_grace();

        let mut updates = self.catalog.plan_updates(granularity, events);
        let mut stale = Vec::with_capacity(updates.len());
        for update in &mut updates {
            let closed_at = granularity.bucket_end(update.bucket_start);
            let past_grace = closed_at <= now && now - closed_at > grace;
            update.late = closed_at <= now;
            if past_grace {
                debug!(
                    tenant_id,
                    metric_key = %update.metric_key,
                    bucket_start = %update.bucket_start,
                    "late correction past grace window; cache left as is"
                );
            } else {
                stale.push(CacheKey::new(
                    tenant_id,
                    &update.metric_key,
                    granularity,
                    update.bucket_start,
                ));
            }
        }

        let merged = with_backoff(&self.config, "merge_aggregates", |_| {
            self.store.merge_aggregates(tenant_id, &updates, now)
        })
        .await;
        if let Err(e) = merged {
            let err = PipelineError::from(e);
            let summary = Batch::new(tenant_id, events.to_vec()).summary();
            error!(
                batch = %summary,
                error = %err,
                "aggregate merge failed; events are stored, rebuild the range to recover"
            );
            self.operator.report_failed_batch(&summary, &err).await;
            return;
        }

        self.fence
            .invalidate(tenant_id, self.cache.as_ref(), stale.iter())
            .await;
    }

    /// Recompute every catalogue aggregate for the buckets covering `range`
    /// from stored events, replacing what the store holds.
    pub(crate) async fn rebuild(
        &self,
        tenant_id: &str,
        range: &TimeRange,
    ) -> Result<RebuildReport, PipelineError> {
        let granularity = self.config.granularity;
        let buckets = range.to_buckets(granularity);
        let covered = TimeRange::new(buckets.start, buckets.end)?;

        let events = with_backoff(&self.config, "scan_events", |_| {
            self.store.scan_events(tenant_id, &covered)
        })
        .await?;
        let updates = self.catalog.plan_updates(granularity, &events);
        let now = self.clock.now();
        with_backoff(&self.config, "replace_aggregates", |_| {
            self.store
                .replace_aggregates(tenant_id, granularity, &buckets, &updates, now)
        })
        .await?;

        let keys = self.keys(tenant_id, self.catalog.rules().iter().map(|r| r.key.as_str()), &buckets);
        self.fence
            .invalidate(tenant_id, self.cache.as_ref(), keys.iter())
            .await;

        let report = RebuildReport {
            events: events.len(),
            buckets: granularity.buckets(&buckets).len(),
            aggregates: updates.len(),
        };
        info!(tenant_id, ?report, "aggregates rebuilt");
        Ok(report)
    }

    /// Drop cached values for `metric_keys` over the buckets covering `range`.
    pub(crate) async fn invalidate<'a>(
        &self,
        tenant_id: &str,
        metric_keys: impl Iterator<Item = &'a str>,
        range: &TimeRange,
    ) -> usize {
        let buckets = range.to_buckets(self.config.granularity);
        let keys = self.keys(tenant_id, metric_keys, &buckets);
        self.fence
            .invalidate(tenant_id, self.cache.as_ref(), keys.iter())
            .await;
        keys.len()
    }

    fn keys<'a>(
        &self,
        tenant_id: &str,
        metric_keys: impl Iterator<Item = &'a str>,
        buckets: &BucketRange,
    ) -> Vec<CacheKey> {
        let granularity = self.config.granularity;
        let starts = granularity.buckets(buckets);
        metric_keys
            .flat_map(|metric| {
                starts
                    .iter()
                    .map(move |start| CacheKey::new(tenant_id, metric, granularity, *start))
            })
            .collect()
    }
}
