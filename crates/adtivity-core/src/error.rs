use thiserror::Error;

/// Every failure the ingestion and metrics pipeline can surface to its caller.
///
/// Input-shape errors (`Validation`, `PayloadTooLarge`, `InvalidRange`,
/// `UnknownMetric`) are returned synchronously and never retried.
/// `Backpressure` is a load-shedding signal for the caller. `StoreUnavailable`
/// is retried inside the writer and only escapes once the retry budget is
/// spent.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("tenant suspended")]
    TenantSuspended,

    #[error("validation error on `{field}`: {message}")]
    Validation { field: String, message: String },

    #[error("payload too large: {size} bytes (limit {limit})")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("ingestion queue full, retry after {retry_after_secs}s")]
    Backpressure { retry_after_secs: u64 },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("{rejected} event(s) rejected by the store")]
    PartialBatchFailure { rejected: usize },

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("unknown metric: {0}")]
    UnknownMetric(String),
}

impl PipelineError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Prefix the field path of a validation error, e.g. `type` -> `events[2].type`.
    pub fn within(self, prefix: &str) -> Self {
        match self {
            Self::Validation { field, message } => Self::Validation {
                field: format!("{prefix}.{field}"),
                message,
            },
            other => other,
        }
    }
}

/// Failure reported by the durable store collaborator.
///
/// The writer treats every variant as transient: the whole batch is retried
/// with backoff. Per-event rejections are not errors; they travel in
/// [`crate::store::AppendOutcome::rejected`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        PipelineError::StoreUnavailable(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}
