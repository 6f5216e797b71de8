pub mod aggregates;
pub mod analytics_impl;
pub mod backend;
pub mod events;
pub mod schema;
pub mod tenants;

pub use backend::DuckDbBackend;

/// Re-export the `duckdb` crate so consumers (especially tests) can use
/// `adtivity_duckdb::duckdb::params!` without an extra dependency.
pub use duckdb;
