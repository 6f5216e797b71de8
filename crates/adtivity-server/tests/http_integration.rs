use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use adtivity_core::config::{Config, PipelineConfig};
use adtivity_duckdb::DuckDbBackend;
use adtivity_server::app::build_app;
use adtivity_server::auth::api_keys::{provision_tenant, rotate_tenant_key};
use adtivity_server::metadata::IdentityStore;
use adtivity_server::state::AppState;

fn test_config() -> Config {
    Config {
        port: 0,
        data_dir: "/tmp/adtivity-test".to_string(),
        duckdb_memory_limit: "1GB".to_string(),
        cors_origins: vec![],
        pipeline: PipelineConfig {
            flush_interval_ms: 60_000,
            write_backoff_ms: 1,
            write_backoff_max_ms: 2,
            ..PipelineConfig::default()
        },
    }
}

async fn setup() -> (Arc<AppState>, axum::Router, String, String) {
    let db = DuckDbBackend::open_in_memory().expect("in-memory DuckDB");
    let state = Arc::new(AppState::new(db, test_config()).expect("state"));
    let (tenant, raw_key) = provision_tenant(state.identity.as_ref(), "Acme")
        .await
        .expect("provision");
    let app = build_app(Arc::clone(&state));
    (state, app, tenant.id, raw_key)
}

fn post_events(key: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/sdk/events")
        .header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header("authorization", format!("Bearer {key}"));
    }
    builder
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn get_with_key(uri: &str, key: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .header("x-api-key", key)
        .body(Body::empty())
        .expect("request")
}

async fn json_body(response: axum::http::Response<Body>) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("json")
}

fn page_view_at(ts: chrono::DateTime<chrono::Utc>, user: &str) -> Value {
    json!({
        "type": "page_view",
        "timestamp": ts.to_rfc3339(),
        "user_id": user,
    })
}

fn recent_page_view(user: &str) -> Value {
    page_view_at(chrono::Utc::now(), user)
}

#[tokio::test]
async fn test_health_reports_ok() {
    let (_state, app, _, _) = setup().await;
    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["pending_events"], 0);
}

#[tokio::test]
async fn test_ingest_requires_valid_key() {
    let (_state, app, _, _) = setup().await;

    let missing = app
        .clone()
        .oneshot(post_events(None, recent_page_view("u1")))
        .await
        .expect("response");
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(missing).await;
    assert_eq!(body["error"]["code"], "unauthorized");

    let bogus = app
        .oneshot(post_events(Some("adt_notreal"), recent_page_view("u1")))
        .await
        .expect("response");
    assert_eq!(bogus.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_suspended_tenant_is_forbidden() {
    let (state, app, tenant_id, key) = setup().await;
    state
        .identity
        .set_tenant_active(&tenant_id, false)
        .await
        .expect("suspend");

    let response = app
        .oneshot(post_events(Some(&key), recent_page_view("u1")))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "tenant_suspended");
}

#[tokio::test]
async fn test_rotated_key_replaces_old_one() {
    let (state, app, tenant_id, old_key) = setup().await;
    let new_key = rotate_tenant_key(state.identity.as_ref(), &tenant_id)
        .await
        .expect("rotate")
        .expect("tenant exists");

    let old = app
        .clone()
        .oneshot(post_events(Some(&old_key), recent_page_view("u1")))
        .await
        .expect("response");
    assert_eq!(old.status(), StatusCode::UNAUTHORIZED);

    let new = app
        .oneshot(post_events(Some(&new_key), recent_page_view("u1")))
        .await
        .expect("response");
    assert_eq!(new.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_ingest_then_query_metrics() {
    let (state, app, tenant_id, key) = setup().await;
    let now = chrono::Utc::now();

    let single = app
        .clone()
        .oneshot(post_events(Some(&key), page_view_at(now, "u1")))
        .await
        .expect("response");
    assert_eq!(single.status(), StatusCode::ACCEPTED);
    let body = json_body(single).await;
    assert_eq!(body["data"]["ingestion_ids"], json!([1]));

    let batch = app
        .clone()
        .oneshot(post_events(
            Some(&key),
            json!([page_view_at(now, "u2"), page_view_at(now, "u1")]),
        ))
        .await
        .expect("response");
    assert_eq!(batch.status(), StatusCode::ACCEPTED);
    let body = json_body(batch).await;
    assert_eq!(body["data"]["ingestion_ids"], json!([2, 3]));

    state.pipeline.flush(&tenant_id).await;

    let start = (now - chrono::Duration::hours(1)).to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    let end = (now + chrono::Duration::hours(1)).to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    let uri = format!("/api/metrics?metrics=page_view_count,active_users&start={start}&end={end}");
    let response = app
        .oneshot(get_with_key(&uri, &key))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;

    assert_eq!(body["data"]["granularity"], "hour");
    let series = body["data"]["series"].as_array().expect("series");
    assert_eq!(series.len(), 2);
    assert_eq!(series[0]["metric_key"], "page_view_count");
    assert_eq!(series[1]["metric_key"], "active_users");

    let total = |s: &Value| -> f64 {
        s["points"]
            .as_array()
            .expect("points")
            .iter()
            .map(|p| p["value"].as_f64().unwrap_or(0.0))
            .sum()
    };
    assert_eq!(total(&series[0]), 3.0);
    assert_eq!(total(&series[1]), 2.0);
}

#[tokio::test]
async fn test_batch_limit_and_validation_errors() {
    let (_state, app, _, key) = setup().await;

    let too_big: Vec<Value> = (0..51).map(|i| recent_page_view(&format!("u{i}"))).collect();
    let response = app
        .clone()
        .oneshot(post_events(Some(&key), Value::Array(too_big)))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "batch_too_large");

    let response = app
        .oneshot(post_events(
            Some(&key),
            json!([recent_page_view("u1"), { "type": "page_view" }]),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "validation_error");
    assert_eq!(body["error"]["field"], "events[1].timestamp");
}

#[tokio::test]
async fn test_metrics_rejects_bad_ranges_and_keys() {
    let (_state, app, _, key) = setup().await;

    let backwards = app
        .clone()
        .oneshot(get_with_key(
            "/api/metrics?metrics=page_view_count&start=2025-06-02T00:00:00Z&end=2025-06-01T00:00:00Z",
            &key,
        ))
        .await
        .expect("response");
    assert_eq!(backwards.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(backwards).await["error"]["code"], "invalid_range");

    let unknown = app
        .oneshot(get_with_key(
            "/api/metrics?metrics=bogus&start=2025-06-01T00:00:00Z&end=2025-06-02T00:00:00Z",
            &key,
        ))
        .await
        .expect("response");
    assert_eq!(unknown.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(unknown).await["error"]["code"], "unknown_metric");
}

#[tokio::test]
async fn test_catalog_lists_metric_rules() {
    let (_state, app, _, key) = setup().await;
    let response = app
        .oneshot(get_with_key("/api/metrics/catalog", &key))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    let keys: Vec<&str> = body["data"]["metrics"]
        .as_array()
        .expect("metrics")
        .iter()
        .filter_map(|m| m["key"].as_str())
        .collect();
    assert!(keys.contains(&"page_view_count"));
    assert!(keys.contains(&"active_wallets"));
}
