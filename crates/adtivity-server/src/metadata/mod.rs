//! Identity storage used by the authenticator and provisioning commands.
//!
//! Self-hosted mode uses the DuckDB implementation; anything implementing
//! [`IdentityStore`] can take its place without touching the routes.

pub mod duckdb;

pub use adtivity_metadata::{ApiKeyRecord, IdentityStore, Tenant, TenantCredentials};
