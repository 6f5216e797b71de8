use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::state::AppState;

/// `GET /health`: liveness check.
///
/// `200 OK` when the event store answers a ping, `503` otherwise. Both bodies
/// carry the ingestion queue depth summed over every tenant, so a store that
/// answers but cannot keep up is visible too.
///
/// ```json
/// { "status": "ok", "version": "0.1.0", "pending_events": 12 }
/// ```
#[tracing::instrument(skip(state))]
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let pending_events = state.pipeline.pending_total().await;
    let (status, label) = match state.db.ping().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(e) => {
            tracing::error!(error = %e, pending_events, "Health check: event store unreachable");
            (StatusCode::SERVICE_UNAVAILABLE, "degraded")
        }
    };
    (
        status,
        Json(json!({
            "status": label,
            "version": env!("CARGO_PKG_VERSION"),
            "pending_events": pending_events,
        })),
    )
}
