use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use adtivity_core::clock::SystemClock;
use adtivity_core::config::Config;
use adtivity_core::error::CoreError;
use adtivity_core::operator::LogOperatorChannel;
use adtivity_duckdb::DuckDbBackend;

use crate::auth::TenantAuthenticator;
use crate::metadata::{duckdb::DuckDbIdentityStore, IdentityStore};
use crate::pipeline::{InMemoryAggregateCache, Pipeline};

/// Shared application state injected into every Axum handler via
/// [`axum::extract::State`].
pub struct AppState {
    /// The DuckDB backend. Events, aggregates and tenants all live here.
    pub db: Arc<DuckDbBackend>,

    /// Parsed configuration, loaded once at startup from environment variables.
    pub config: Arc<Config>,

    pub identity: Arc<dyn IdentityStore>,

    pub authenticator: TenantAuthenticator,

    pub pipeline: Pipeline,

    /// Kept concretely typed so the purge loop can reach it; the pipeline
    /// sees it only as an `AggregateCache`.
    pub cache: Arc<InMemoryAggregateCache>,
}

impl AppState {
    /// Wire the production collaborators: DuckDB for events, aggregates and
    /// identity, the in-process cache, log-based operator alerts and the
    /// system clock.
    pub fn new(db: DuckDbBackend, config: Config) -> Result<Self, CoreError> {
        let db = Arc::new(db);
        let identity: Arc<dyn IdentityStore> = Arc::new(DuckDbIdentityStore::new(Arc::clone(&db)));
        let cache = Arc::new(InMemoryAggregateCache::new());
        let pipeline = Pipeline::new(
            config.pipeline.clone(),
            db.clone(),
            cache.clone(),
            Arc::new(LogOperatorChannel),
            Arc::new(SystemClock),
        )?;

        Ok(Self {
            authenticator: TenantAuthenticator::new(Arc::clone(&identity)),
            identity,
            pipeline,
            cache,
            db,
            config: Arc::new(config),
        })
    }

    /// Background loop: drop expired cache entries on a fixed interval.
    ///
    /// Expired entries already read as misses; this only bounds memory.
    pub async fn run_cache_purge_loop(self: Arc<Self>) {
        let period = self
            .config
            .pipeline
            .cache_ttl()
            .clamp(Duration::from_secs(1), Duration::from_secs(60));
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let purged = self.cache.purge_expired().await;
            if purged > 0 {
                debug!(purged, "expired aggregate cache entries purged");
            }
        }
    }
}
