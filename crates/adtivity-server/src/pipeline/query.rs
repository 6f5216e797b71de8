use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use adtivity_core::cache::{AggregateCache, CacheKey};
use adtivity_core::config::PipelineConfig;
use adtivity_core::error::PipelineError;
use adtivity_core::metric::{Aggregate, BucketRange, MetricCatalog, TimeRange};
use adtivity_core::store::AnalyticsStore;

use super::cache::CacheFence;

/// Read side: cache first, store on miss, zero for buckets nobody wrote.
pub(crate) struct QueryService {
    store: Arc<dyn AnalyticsStore>,
    cache: Arc<dyn AggregateCache>,
    catalog: Arc<MetricCatalog>,
    config: Arc<PipelineConfig>,
    fence: Arc<CacheFence>,
}

impl QueryService {
    pub(crate) fn new(
        store: Arc<dyn AnalyticsStore>,
        cache: Arc<dyn AggregateCache>,
        catalog: Arc<MetricCatalog>,
        config: Arc<PipelineConfig>,
        fence: Arc<CacheFence>,
    ) -> Self {
        Self {
            store,
            cache,
            catalog,
            config,
            fence,
        }
    }

    /// Check and de-duplicate requested metric keys, keeping first-seen order.
    pub(crate) fn resolve_keys<'a>(&self, metric_keys: &'a [String]) -> Result<Vec<&'a str>, PipelineError> {
        if metric_keys.is_empty() {
            return Err(PipelineError::validation(
                "metrics",
                "at least one metric key is required",
            ));
        }
        let mut resolved: Vec<&str> = Vec::with_capacity(metric_keys.len());
        for key in metric_keys {
            let key = key.trim();
            if !self.catalog.contains(key) {
                return Err(PipelineError::UnknownMetric(key.to_string()));
            }
            if !resolved.contains(&key) {
                resolved.push(key);
            }
        }
        if resolved.len() > self.config.max_query_metrics {
            return Err(PipelineError::validation(
                "metrics",
                format!(
                    "at most {} metric keys per query",
                    self.config.max_query_metrics
                ),
            ));
        }
        Ok(resolved)
    }

    /// Reject ranges wider than `max_query_span_days`.
    pub(crate) fn check_span(&self, range: &TimeRange) -> Result<(), PipelineError> {
        if range.span() > self.config.max_query_span() {
            return Err(PipelineError::InvalidRange(format!(
                "range exceeds the maximum span of {} days",
                self.config.max_query_span_days
            )));
        }
        Ok(())
    }

    /// One aggregate per (metric key, bucket) for the buckets covering
    /// `range`, grouped by key in request order and ascending by bucket.
    pub(crate) async fn get_metrics(
        &self,
        tenant_id: &str,
        metric_keys: &[String],
        range: &TimeRange,
    ) -> Result<Vec<Aggregate>, PipelineError> {
        let keys = self.resolve_keys(metric_keys)?;
        self.check_span(range)?;

        let granularity = self.config.granularity;
        let starts = granularity.buckets(&range.to_buckets(granularity));
        let mut out = Vec::with_capacity(keys.len() * starts.len());
        for metric_key in keys {
            let series = self.series(tenant_id, metric_key, &starts).await?;
            out.extend(series);
        }
        Ok(out)
    }

    async fn series(
        &self,
        tenant_id: &str,
        metric_key: &str,
        starts: &[DateTime<Utc>],
    ) -> Result<Vec<Aggregate>, PipelineError> {
        let granularity = self.config.granularity;
        let mut series: Vec<Option<Aggregate>> = Vec::with_capacity(starts.len());
        let mut missing = Vec::new();

        for (idx, start) in starts.iter().enumerate() {
            let key = CacheKey::new(tenant_id, metric_key, granularity, *start);
            match self.cache.get(&key).await {
                Some(hit)
                    if hit.tenant_id == tenant_id
                        && hit.metric_key == metric_key
                        && hit.bucket_start == *start =>
                {
                    series.push(Some(hit));
                }
                Some(foreign) => {
                    warn!(
                        tenant_id,
                        cached_tenant_id = %foreign.tenant_id,
                        metric_key,
                        "cache returned an aggregate for another key; treating as a miss"
                    );
                    series.push(None);
                    missing.push(idx);
                }
                None => {
                    series.push(None);
                    missing.push(idx);
                }
            }
        }

        if let (Some(&first), Some(&last)) = (missing.first(), missing.last()) {
            let seen = self.fence.epoch(tenant_id).await;
            let span = BucketRange {
                start: starts[first],
                end: granularity.bucket_end(starts[last]),
            };
            let mut stored: HashMap<DateTime<Utc>, Aggregate> = self
                .store
                .scan_aggregate(tenant_id, metric_key, granularity, &span)
                .await?
                .into_iter()
                .filter(|a| a.tenant_id == tenant_id)
                .map(|a| (a.bucket_start, a))
                .collect();

            let fill = self.fence.fill().await;
            let current = fill.is_current(tenant_id, seen);
            for idx in missing {
                let start = starts[idx];
                let value = stored.remove(&start).unwrap_or_else(|| {
                    Aggregate::empty(tenant_id, metric_key, granularity, start)
                });
                if current {
                    self.cache
                        .set(
                            CacheKey::new(tenant_id, metric_key, granularity, start),
                            value.clone(),
                            self.config.cache_ttl(),
                        )
                        .await;
                }
                series[idx] = Some(value);
            }
        }

        Ok(series.into_iter().flatten().collect())
    }
}
