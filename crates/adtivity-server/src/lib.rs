pub mod app;
pub mod auth;
pub mod error;
pub mod metadata;
pub mod pipeline;
pub mod routes;
pub mod state;
