use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use adtivity_server::{
    auth::api_keys::{describe_tenant, provision_tenant, rotate_tenant_key},
    state::AppState,
};

/// `adtivity health`: liveness probe for Docker HEALTHCHECK.
///
/// Calls `GET http://localhost:$ADTIVITY_PORT/health`.
/// Exits 0 if the server responds with HTTP 200, exits 1 otherwise.
fn run_health_check() -> ! {
    let port = std::env::var("ADTIVITY_PORT").unwrap_or_else(|_| "3000".to_string());
    let url = format!("http://localhost:{}/health", port);
    match ureq::get(&url).call() {
        Ok(resp) if resp.status() == 200 => std::process::exit(0),
        _ => std::process::exit(1),
    }
}

/// `adtivity create-tenant <name>`: provision a tenant and print its API key.
///
/// The raw key is printed once and is not recoverable afterwards.
async fn run_create_tenant(name: &str) -> Result<()> {
    let state = open_state()?;

    let (tenant, raw_key) = provision_tenant(state.identity.as_ref(), name).await?;
    println!("tenant_id: {}", tenant.id);
    println!("api_key:   {}", raw_key);
    Ok(())
}

/// `adtivity rotate-key <tenant_id>`: revoke the tenant's key and print a new one.
async fn run_rotate_key(tenant_id: &str) -> Result<()> {
    let state = open_state()?;
    match rotate_tenant_key(state.identity.as_ref(), tenant_id).await? {
        Some(raw_key) => {
            println!("tenant_id: {}", tenant_id);
            println!("api_key:   {}", raw_key);
            Ok(())
        }
        None => anyhow::bail!("no tenant with id {tenant_id}"),
    }
}

/// `adtivity show-tenant <tenant_id>`: print the tenant and its keys.
async fn run_show_tenant(tenant_id: &str) -> Result<()> {
    let state = open_state()?;
    let Some((tenant, keys)) = describe_tenant(state.identity.as_ref(), tenant_id).await? else {
        anyhow::bail!("no tenant with id {tenant_id}");
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({ "tenant": tenant, "api_keys": keys }))?
    );
    Ok(())
}

fn open_state() -> Result<AppState> {
    let cfg = adtivity_core::config::Config::from_env().map_err(|e| anyhow::anyhow!(e))?;
    std::fs::create_dir_all(&cfg.data_dir)?;
    let db_path = format!("{}/adtivity.db", cfg.data_dir);
    let db = adtivity_duckdb::DuckDbBackend::open(&db_path, &cfg.duckdb_memory_limit)?;
    Ok(AppState::new(db, cfg)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(|s| s.as_str()) == Some("health") {
        run_health_check();
    }

    // Structured JSON logging. Level controlled via RUST_LOG env var.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("adtivity=info".parse()?),
        )
        .json()
        .init();

    if args.get(1).map(|s| s.as_str()) == Some("create-tenant") {
        let name = args
            .get(2)
            .ok_or_else(|| anyhow::anyhow!("usage: adtivity create-tenant <name>"))?;
        return run_create_tenant(name).await;
    }
    if args.get(1).map(|s| s.as_str()) == Some("rotate-key") {
        let tenant_id = args
            .get(2)
            .ok_or_else(|| anyhow::anyhow!("usage: adtivity rotate-key <tenant_id>"))?;
        return run_rotate_key(tenant_id).await;
    }
    if args.get(1).map(|s| s.as_str()) == Some("show-tenant") {
        let tenant_id = args
            .get(2)
            .ok_or_else(|| anyhow::anyhow!("usage: adtivity show-tenant <tenant_id>"))?;
        return run_show_tenant(tenant_id).await;
    }

    let cfg = adtivity_core::config::Config::from_env().map_err(|e| anyhow::anyhow!(e))?;

    // Ensure data directory exists before opening DuckDB.
    std::fs::create_dir_all(&cfg.data_dir)?;
    let db_path = format!("{}/adtivity.db", cfg.data_dir);
    let db = adtivity_duckdb::DuckDbBackend::open(&db_path, &cfg.duckdb_memory_limit)?;

    let state = Arc::new(AppState::new(db, cfg.clone())?);

    // Spawn background cache purge task.
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            state.run_cache_purge_loop().await;
        });
    }

    let addr = format!("0.0.0.0:{}", cfg.port);
    let app = adtivity_server::app::build_app(Arc::clone(&state));

    info!(
        port = cfg.port,
        granularity = cfg.pipeline.granularity.as_str(),
        "Adtivity listening on {}",
        addr
    );

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let state_for_shutdown = Arc::clone(&state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    // Drain every tenant lane. Not bounded by a deadline: a flush in progress
    // runs to completion and anything it cannot write reaches the operator
    // channel.
    let pending = state_for_shutdown.pipeline.pending_total().await;
    info!(pending, "draining ingestion queue");
    state_for_shutdown.pipeline.shutdown().await;

    Ok(())
}
