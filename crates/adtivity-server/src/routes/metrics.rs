use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use adtivity_core::error::PipelineError;
use adtivity_core::metric::{Aggregate, TimeRange};

use crate::{auth::TenantContext, error::AppError, state::AppState};

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    /// Comma-separated metric keys.
    pub metrics: String,
    pub start: String,
    pub end: String,
}

fn parse_instant(field: &str, raw: &str) -> Result<DateTime<Utc>, PipelineError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| PipelineError::validation(field, "must be an RFC 3339 timestamp"))
}

/// `GET /api/metrics?metrics=a,b&start=..&end=..`
///
/// Returns one series per requested key with a point for every bucket
/// covering `[start, end)`, zero-filled where nothing was recorded.
#[tracing::instrument(skip(state, tenant), fields(tenant_id = %tenant.0.tenant_id))]
pub async fn get_metrics(
    State(state): State<Arc<AppState>>,
    tenant: TenantContext,
    Query(query): Query<MetricsQuery>,
) -> Result<impl IntoResponse, AppError> {
    let keys: Vec<String> = query
        .metrics
        .split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect();
    let start = parse_instant("start", &query.start)?;
    let end = parse_instant("end", &query.end)?;
    let range = TimeRange::new(start, end)?;

    let aggregates = state
        .pipeline
        .get_metrics(&tenant.0.tenant_id, &keys, &range)
        .await?;

    Ok(Json(json!({
        "data": {
            "granularity": state.pipeline.config().granularity.as_str(),
            "start": range.start,
            "end": range.end,
            "series": series(&aggregates),
        }
    })))
}

/// Group a flat, key-ordered aggregate list into per-key series.
fn series(aggregates: &[Aggregate]) -> Vec<Value> {
    let mut out: Vec<(String, Vec<Value>)> = Vec::new();
    for agg in aggregates {
        let point = json!({
            "bucket_start": agg.bucket_start,
            "value": agg.value,
            "late_corrected": agg.late_corrected,
        });
        match out.last_mut() {
            Some((key, points)) if *key == agg.metric_key => points.push(point),
            _ => out.push((agg.metric_key.clone(), vec![point])),
        }
    }
    out.into_iter()
        .map(|(metric_key, points)| json!({ "metric_key": metric_key, "points": points }))
        .collect()
}

/// `GET /api/metrics/catalog`: the metric rules this server aggregates.
#[tracing::instrument(skip(state, _tenant))]
pub async fn catalog(
    State(state): State<Arc<AppState>>,
    _tenant: TenantContext,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(json!({
        "data": {
            "granularity": state.pipeline.config().granularity.as_str(),
            "metrics": state.pipeline.catalog().rules(),
        }
    })))
}
