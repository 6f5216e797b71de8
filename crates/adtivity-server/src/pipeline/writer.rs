use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use tracing::{error, info, warn};

use adtivity_core::config::PipelineConfig;
use adtivity_core::error::{PipelineError, StoreError};
use adtivity_core::event::{Batch, Event};
use adtivity_core::operator::OperatorChannel;
use adtivity_core::store::AnalyticsStore;

/// Run `op` until it succeeds or `write_max_attempts` is spent, sleeping with
/// exponential backoff between attempts. `op` receives the 1-based attempt
/// number.
pub(crate) async fn with_backoff<T, F, Fut>(
    config: &PipelineConfig,
    what: &str,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= config.write_max_attempts => return Err(e),
            Err(e) => {
                let backoff = config.write_backoff(attempt);
                warn!(
                    what,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "store call failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

/// Durably appends batches, idempotently, with bounded retries.
pub(crate) struct EventWriter {
    store: Arc<dyn AnalyticsStore>,
    operator: Arc<dyn OperatorChannel>,
    config: Arc<PipelineConfig>,
}

impl EventWriter {
    pub(crate) fn new(
        store: Arc<dyn AnalyticsStore>,
        operator: Arc<dyn OperatorChannel>,
        config: Arc<PipelineConfig>,
    ) -> Self {
        Self {
            store,
            operator,
            config,
        }
    }

    /// Append `batch` and return the events that now need aggregating.
    ///
    /// Returns an empty list when the batch failed for good; that failure has
    /// already been reported to the operator channel.
    pub(crate) async fn write(&self, batch: &Batch) -> Vec<Event> {
        if batch.is_empty() {
            return Vec::new();
        }

        let mut ambiguous_failure = false;
        let result = with_backoff(&self.config, "append_batch", |attempt| {
            ambiguous_failure |= attempt > 1;
            self.store.append_batch(&batch.tenant_id, &batch.events)
        })
        .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                let err = PipelineError::from(e);
                error!(batch = %batch.summary(), error = %err, "batch write failed");
                self.operator
                    .report_failed_batch(&batch.summary(), &err)
                    .await;
                return Vec::new();
            }
        };

        if !outcome.rejected.is_empty() {
            self.report_rejected(batch, &outcome.rejected).await;
        }

        // A failed attempt may still have committed before its error
        // surfaced; those events come back as duplicates and were never
        // aggregated. Duplicates on a clean first attempt were.
        let mut to_aggregate: HashSet<_> = outcome.accepted.iter().copied().collect();
        if ambiguous_failure {
            to_aggregate.extend(outcome.duplicates.iter().copied());
        } else if !outcome.duplicates.is_empty() {
            warn!(
                tenant_id = %batch.tenant_id,
                duplicates = outcome.duplicates.len(),
                "batch contained ids that were already stored"
            );
        }

        info!(
            batch = %batch.summary(),
            accepted = outcome.accepted.len(),
            duplicates = outcome.duplicates.len(),
            rejected = outcome.rejected.len(),
            "batch written"
        );

        batch
            .events
            .iter()
            .filter(|e| to_aggregate.contains(&e.ingestion_id))
            .cloned()
            .collect()
    }

    async fn report_rejected(&self, batch: &Batch, rejected: &[(u64, String)]) {
        for (ingestion_id, reason) in rejected {
            warn!(
                tenant_id = %batch.tenant_id,
                ingestion_id,
                reason = %reason,
                "event rejected by store"
            );
        }
        let ids: HashSet<_> = rejected.iter().map(|(id, _)| *id).collect();
        let failed = Batch::new(
            batch.tenant_id.clone(),
            batch
                .events
                .iter()
                .filter(|e| ids.contains(&e.ingestion_id))
                .cloned()
                .collect(),
        );
        let err = PipelineError::PartialBatchFailure {
            rejected: rejected.len(),
        };
        self.operator
            .report_failed_batch(&failed.summary(), &err)
            .await;
    }
}
