use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use adtivity_core::error::PipelineError;

/// Maximum number of events accepted in one SDK request.
pub const MAX_EVENTS_PER_REQUEST: usize = 50;

/// Application-level errors that map directly to HTTP responses.
///
/// Every variant implements [`IntoResponse`] so Axum handlers can use
/// `Result<impl IntoResponse, AppError>` as their return type.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("batch too large: {0} events (max 50)")]
    BatchTooLarge(usize),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message, field, retry_after_seconds) = match &self {
            AppError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                "validation_error",
                msg.clone(),
                None,
                None,
            ),
            AppError::BatchTooLarge(_) => (
                StatusCode::BAD_REQUEST,
                "batch_too_large",
                format!("Batch exceeds maximum of {MAX_EVENTS_PER_REQUEST} events"),
                None,
                None,
            ),
            AppError::Pipeline(err) => match err {
                PipelineError::Unauthorized => (
                    StatusCode::UNAUTHORIZED,
                    "unauthorized",
                    "Not authenticated".to_string(),
                    None,
                    None,
                ),
                PipelineError::TenantSuspended => (
                    StatusCode::FORBIDDEN,
                    "tenant_suspended",
                    "Tenant is suspended".to_string(),
                    None,
                    None,
                ),
                PipelineError::Validation { field, message } => (
                    StatusCode::BAD_REQUEST,
                    "validation_error",
                    message.clone(),
                    Some(field.clone()),
                    None,
                ),
                PipelineError::PayloadTooLarge { .. } => (
                    StatusCode::PAYLOAD_TOO_LARGE,
                    "payload_too_large",
                    err.to_string(),
                    Some("properties".to_string()),
                    None,
                ),
                PipelineError::Backpressure { retry_after_secs } => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "ingest_overloaded",
                    "Ingestion queue is overloaded, retry later".to_string(),
                    None,
                    Some(*retry_after_secs),
                ),
                PipelineError::StoreUnavailable(detail) => {
                    tracing::error!(error = %detail, "store unavailable");
                    (
                        StatusCode::SERVICE_UNAVAILABLE,
                        "store_unavailable",
                        "Storage is temporarily unavailable".to_string(),
                        None,
                        None,
                    )
                }
                PipelineError::PartialBatchFailure { .. } => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "partial_batch_failure",
                    err.to_string(),
                    None,
                    None,
                ),
                PipelineError::InvalidRange(msg) => (
                    StatusCode::BAD_REQUEST,
                    "invalid_range",
                    msg.clone(),
                    None,
                    None,
                ),
                PipelineError::UnknownMetric(key) => (
                    StatusCode::BAD_REQUEST,
                    "unknown_metric",
                    format!("Unknown metric: {key}"),
                    Some("metrics".to_string()),
                    None,
                ),
            },
        };

        let mut response = (
            status,
            Json(json!({
                "error": {
                    "code": code,
                    "message": message,
                    "field": field
                }
            })),
        )
            .into_response();

        if let Some(retry_after_seconds) = retry_after_seconds {
            if let Ok(value) = retry_after_seconds.to_string().parse() {
                response
                    .headers_mut()
                    .insert(axum::http::header::RETRY_AFTER, value);
            }
        }

        response
    }
}
