/// DuckDB initialization SQL.
///
/// Executed once at database open time via `Connection::execute_batch`.
/// Every statement uses `IF NOT EXISTS`, so re-running on each startup is
/// safe.
///
/// `memory_limit` comes from `Config.duckdb_memory_limit`
/// (env `ADTIVITY_DUCKDB_MEMORY`, default `"1GB"`). Always set an explicit
/// limit: the DuckDB default of 80% of system RAM is not acceptable for a
/// server process.
///
/// Timestamps are stored as epoch integers (milliseconds for events,
/// seconds for bucket starts) so bucket arithmetic stays exact and
/// timezone-free.
pub fn init_sql(memory_limit: &str) -> String {
    format!(
        r#"SET memory_limit = '{memory_limit}';
SET threads = 2;

-- ===========================================
-- TENANTS / API KEYS (identity collaborator)
-- ===========================================
CREATE TABLE IF NOT EXISTS tenants (
    id              VARCHAR PRIMARY KEY,           -- 'tnt_' + uuid v4 (simple)
    name            VARCHAR NOT NULL,
    active          BOOLEAN NOT NULL DEFAULT true,
    created_at      TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS api_keys (
    key_id          VARCHAR PRIMARY KEY,           -- 10 chars [a-z0-9], embedded in the raw key
    tenant_id       VARCHAR NOT NULL,
    key_salt        VARCHAR NOT NULL,              -- 16-byte random hex
    key_hash        VARCHAR NOT NULL,              -- sha256(salt || raw key) hex
    key_prefix      VARCHAR NOT NULL,              -- display only
    created_at      TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    last_used_at    TIMESTAMP,
    revoked_at      TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_api_keys_tenant ON api_keys(tenant_id);

-- ===========================================
-- EVENTS (append-only, never deleted by the pipeline)
-- ===========================================
CREATE TABLE IF NOT EXISTS events (
    tenant_id        VARCHAR NOT NULL,
    ingestion_id     BIGINT NOT NULL,              -- per-tenant, monotonically increasing
    family           VARCHAR NOT NULL,             -- 'web2' | 'web3'
    event_type       VARCHAR NOT NULL,
    event_name       VARCHAR NOT NULL,
    occurred_at_ms   BIGINT NOT NULL,
    received_at_ms   BIGINT NOT NULL,
    user_id          VARCHAR,
    anonymous_id     VARCHAR,
    session_id       VARCHAR,
    chain_id         VARCHAR,
    tx_hash          VARCHAR,
    wallet_address   VARCHAR,
    contract_address VARCHAR,
    properties       VARCHAR NOT NULL,             -- JSON object
    PRIMARY KEY (tenant_id, ingestion_id)
);
CREATE INDEX IF NOT EXISTS idx_events_tenant_occurred
    ON events(tenant_id, occurred_at_ms);

-- ===========================================
-- AGGREGATES (derived, rebuildable from events)
-- ===========================================
CREATE TABLE IF NOT EXISTS aggregates (
    tenant_id       VARCHAR NOT NULL,
    metric_key      VARCHAR NOT NULL,
    granularity     VARCHAR NOT NULL,              -- 'hour' | 'day'
    bucket_start    BIGINT NOT NULL,               -- epoch seconds, UTC-aligned
    value           DOUBLE NOT NULL,
    late_corrected  BOOLEAN NOT NULL DEFAULT false,
    updated_at_ms   BIGINT NOT NULL,
    PRIMARY KEY (tenant_id, metric_key, granularity, bucket_start)
);

-- Member sets behind distinct-count aggregates.
CREATE TABLE IF NOT EXISTS aggregate_members (
    tenant_id       VARCHAR NOT NULL,
    metric_key      VARCHAR NOT NULL,
    granularity     VARCHAR NOT NULL,
    bucket_start    BIGINT NOT NULL,
    member          VARCHAR NOT NULL,
    PRIMARY KEY (tenant_id, metric_key, granularity, bucket_start, member)
);
"#
    )
}

/// Migrations tracking table SQL.
///
/// Run before [`init_sql`]. Tracks which numbered migrations have been
/// applied so restarts don't re-run them.
pub const MIGRATIONS_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS _migrations (
    id          VARCHAR PRIMARY KEY,
    applied_at  TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#;
