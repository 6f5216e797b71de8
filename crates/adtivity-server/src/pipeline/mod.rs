//! Ingestion and metrics pipeline.
//!
//! Events are validated on the caller's task, admitted to a bounded
//! per-tenant lane, written in batches by that lane's writer task and then
//! folded into time-bucketed aggregates. Reads go through a TTL cache that
//! writers invalidate after every merge.

mod aggregator;
pub mod cache;
mod query;
mod queue;
mod writer;

use std::sync::Arc;

use serde_json::Value;

use adtivity_core::cache::AggregateCache;
use adtivity_core::clock::Clock;
use adtivity_core::config::PipelineConfig;
use adtivity_core::error::{CoreError, PipelineError};
use adtivity_core::event::{EventFamily, IngestionId};
use adtivity_core::metric::{Aggregate, MetricCatalog, TimeRange};
use adtivity_core::operator::OperatorChannel;
use adtivity_core::store::AnalyticsStore;
use adtivity_core::validate::EventValidator;

pub use aggregator::RebuildReport;
pub use cache::InMemoryAggregateCache;

use aggregator::MetricsAggregator;
use cache::CacheFence;
use query::QueryService;
use queue::IngestionQueue;
use writer::EventWriter;

pub struct Pipeline {
    config: Arc<PipelineConfig>,
    catalog: Arc<MetricCatalog>,
    validator: EventValidator,
    clock: Arc<dyn Clock>,
    queue: IngestionQueue,
    query: QueryService,
    aggregator: Arc<MetricsAggregator>,
}

impl Pipeline {
    /// Wire the pipeline around its collaborators. Fails if `config` is
    /// inconsistent or its metric rules do not form a valid catalogue.
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn AnalyticsStore>,
        cache: Arc<dyn AggregateCache>,
        operator: Arc<dyn OperatorChannel>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CoreError> {
        config.validate()?;
        let catalog = Arc::new(config.catalog()?);
        let config = Arc::new(config);
        let fence = Arc::new(CacheFence::default());

        let writer = Arc::new(EventWriter::new(
            Arc::clone(&store),
            Arc::clone(&operator),
            Arc::clone(&config),
        ));
        let aggregator = Arc::new(MetricsAggregator::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            operator,
            Arc::clone(&clock),
            Arc::clone(&catalog),
            Arc::clone(&config),
            Arc::clone(&fence),
        ));
        let queue = IngestionQueue::new(
            Arc::clone(&store),
            writer,
            Arc::clone(&aggregator),
            Arc::clone(&config),
        );
        let query = QueryService::new(
            store,
            cache,
            Arc::clone(&catalog),
            Arc::clone(&config),
            fence,
        );

        Ok(Self {
            validator: EventValidator::new(config.max_properties_bytes, config.max_clock_skew()),
            config,
            catalog,
            clock,
            queue,
            query,
            aggregator,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &MetricCatalog {
        &self.catalog
    }

    /// Validate and enqueue one event. Returns once the event is admitted,
    /// not once it is written.
    pub async fn submit_event(
        &self,
        tenant_id: &str,
        family: EventFamily,
        payload: &Value,
    ) -> Result<IngestionId, PipelineError> {
        let now = self.clock.now();
        let validated = self.validator.validate(tenant_id, family, payload, now)?;
        let ids = self.queue.enqueue(tenant_id, vec![validated], now).await?;
        ids.into_iter()
            .next()
            .ok_or_else(|| PipelineError::StoreUnavailable("no ingestion id assigned".to_string()))
    }

    /// Validate every payload, then enqueue all of them or none. Validation
    /// errors name the offending index as `events[i]`.
    pub async fn submit_events(
        &self,
        tenant_id: &str,
        payloads: &[(EventFamily, Value)],
    ) -> Result<Vec<IngestionId>, PipelineError> {
        let now = self.clock.now();
        let validated = payloads
            .iter()
            .enumerate()
            .map(|(i, (family, payload))| {
                self.validator
                    .validate(tenant_id, *family, payload, now)
                    .map_err(|e| e.within(&format!("events[{i}]")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if validated.is_empty() {
            return Ok(Vec::new());
        }
        self.queue.enqueue(tenant_id, validated, now).await
    }

    pub async fn get_metrics(
        &self,
        tenant_id: &str,
        metric_keys: &[String],
        range: &TimeRange,
    ) -> Result<Vec<Aggregate>, PipelineError> {
        self.query.get_metrics(tenant_id, metric_keys, range).await
    }

    /// Recompute aggregates over `range` from stored events. Runs on the
    /// tenant's writer task after everything already admitted. The range is
    /// bounded like a query range.
    pub async fn rebuild_metrics(
        &self,
        tenant_id: &str,
        range: TimeRange,
    ) -> Result<RebuildReport, PipelineError> {
        self.query.check_span(&range)?;
        self.queue.rebuild(tenant_id, range).await
    }

    /// Drop cached values for `metric_keys` over `range`; returns the number
    /// of cache keys invalidated.
    pub async fn invalidate_metrics(
        &self,
        tenant_id: &str,
        metric_keys: &[String],
        range: &TimeRange,
    ) -> Result<usize, PipelineError> {
        let keys = self.query.resolve_keys(metric_keys)?;
        self.query.check_span(range)?;
        Ok(self
            .aggregator
            .invalidate(tenant_id, keys.into_iter(), range)
            .await)
    }

    pub async fn pending(&self, tenant_id: &str) -> usize {
        self.queue.pending(tenant_id).await
    }

    /// Queue depth summed over every tenant.
    pub async fn pending_total(&self) -> usize {
        self.queue.pending_total().await
    }

    pub async fn flush(&self, tenant_id: &str) {
        self.queue.flush(tenant_id).await;
    }

    pub async fn flush_all(&self) {
        self.queue.flush_all().await;
    }

    /// Stop admitting events and drain every lane.
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }
}
