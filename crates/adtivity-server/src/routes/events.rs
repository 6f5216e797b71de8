use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::{json, Value};

use adtivity_core::error::PipelineError;
use adtivity_core::event::EventFamily;

use crate::{
    auth::TenantContext,
    error::{AppError, MAX_EVENTS_PER_REQUEST},
    state::AppState,
};

/// `POST /api/sdk/events`: ingest one event object or an array of up to 50.
///
/// Each event may carry `"family": "web2" | "web3"`; without it the family
/// is inferred from the payload. An array is admitted all-or-nothing.
///
/// ## Response
/// `202 Accepted` with `{ "data": { "ingestion_ids": [..] } }`. The events
/// are queued, not yet written.
#[tracing::instrument(skip(state, tenant, body), fields(tenant_id = %tenant.0.tenant_id))]
pub async fn ingest(
    State(state): State<Arc<AppState>>,
    tenant: TenantContext,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, AppError> {
    let tenant_id = tenant.0.tenant_id;

    let ingestion_ids = match body {
        Value::Array(items) => {
            if items.len() > MAX_EVENTS_PER_REQUEST {
                return Err(AppError::BatchTooLarge(items.len()));
            }
            if items.is_empty() {
                return Err(AppError::BadRequest("empty batch".to_string()));
            }
            let payloads = items
                .into_iter()
                .enumerate()
                .map(|(i, item)| {
                    family_of(&item)
                        .map(|family| (family, item))
                        .map_err(|e| e.within(&format!("events[{i}]")))
                })
                .collect::<Result<Vec<_>, _>>()?;
            state.pipeline.submit_events(&tenant_id, &payloads).await?
        }
        item @ Value::Object(_) => {
            let family = family_of(&item)?;
            vec![state.pipeline.submit_event(&tenant_id, family, &item).await?]
        }
        _ => {
            return Err(AppError::BadRequest(
                "body must be an event object or an array of events".to_string(),
            ))
        }
    };

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "data": { "ingestion_ids": ingestion_ids } })),
    ))
}

fn family_of(item: &Value) -> Result<EventFamily, PipelineError> {
    match item.get("family") {
        None | Some(Value::Null) => Ok(EventFamily::infer(item)),
        Some(Value::String(raw)) => EventFamily::parse(raw)
            .ok_or_else(|| PipelineError::validation("family", "must be `web2` or `web3`")),
        Some(_) => Err(PipelineError::validation("family", "must be a string")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_is_declared_or_inferred() {
        assert_eq!(
            family_of(&json!({ "family": "WEB3", "type": "connect" })).ok(),
            Some(EventFamily::Web3)
        );
        assert_eq!(
            family_of(&json!({ "type": "tx" })).ok(),
            Some(EventFamily::Web3)
        );
        assert_eq!(
            family_of(&json!({ "type": "page_view" })).ok(),
            Some(EventFamily::Web2)
        );
        assert!(family_of(&json!({ "family": "web4" })).is_err());
    }
}
