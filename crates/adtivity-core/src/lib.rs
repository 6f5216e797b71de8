pub mod cache;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod error;
pub mod event;
pub mod metric;
pub mod operator;
pub mod store;
pub mod validate;
