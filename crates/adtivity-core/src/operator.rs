use async_trait::async_trait;

use crate::error::PipelineError;
use crate::event::BatchSummary;

/// Destination for failures no caller is waiting on.
///
/// Batches whose write retries are exhausted land here. The pipeline never
/// drops them silently.
#[async_trait]
pub trait OperatorChannel: Send + Sync + 'static {
    async fn report_failed_batch(&self, summary: &BatchSummary, error: &PipelineError);
}

/// Reports failures as structured `error` log records.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogOperatorChannel;

#[async_trait]
impl OperatorChannel for LogOperatorChannel {
    async fn report_failed_batch(&self, summary: &BatchSummary, error: &PipelineError) {
        tracing::error!(
            target: "adtivity::operator",
            tenant_id = %summary.tenant_id,
            events = summary.event_count,
            first_ingestion_id = ?summary.first_ingestion_id,
            last_ingestion_id = ?summary.last_ingestion_id,
            error = %error,
            "batch dropped after write retries were exhausted"
        );
    }
}
