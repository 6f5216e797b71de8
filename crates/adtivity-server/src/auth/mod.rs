pub mod api_keys;
pub mod authenticator;

use std::sync::Arc;

use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts},
};

use crate::{error::AppError, state::AppState};

pub use authenticator::{AuthenticatedTenant, TenantAuthenticator};

/// Extractor for SDK routes: the tenant behind the request's API key.
///
/// Accepts `Authorization: Bearer <key>` or `X-API-Key: <key>`.
#[derive(Debug, Clone)]
pub struct TenantContext(pub AuthenticatedTenant);

impl FromRequestParts<Arc<AppState>> for TenantContext {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let raw_key = presented_key(parts);
        let tenant = state.authenticator.authenticate(raw_key.as_deref()).await?;
        Ok(TenantContext(tenant))
    }
}

fn presented_key(parts: &Parts) -> Option<String> {
    let bearer = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "));
    let header_key = parts
        .headers
        .get("x-api-key")
        .and_then(|h| h.to_str().ok());
    bearer.or(header_key).map(|k| k.trim().to_string())
}
