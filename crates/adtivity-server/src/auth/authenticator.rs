use std::sync::Arc;

use tracing::{info, warn};

use adtivity_core::credentials::{parse_api_key, verify_api_key};
use adtivity_core::error::PipelineError;
use adtivity_metadata::IdentityStore;

/// The tenant a request acts for, resolved from its API key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedTenant {
    pub tenant_id: String,
    pub key_id: String,
}

/// Resolves raw API keys to tenants.
pub struct TenantAuthenticator {
    identity: Arc<dyn IdentityStore>,
}

impl TenantAuthenticator {
    pub fn new(identity: Arc<dyn IdentityStore>) -> Self {
        Self { identity }
    }

    /// `Unauthorized` for a missing, malformed, unknown or non-matching key.
    /// `TenantSuspended` only once the key itself has verified, so a bad key
    /// never reveals whether its tenant exists.
    pub async fn authenticate(
        &self,
        raw_key: Option<&str>,
    ) -> Result<AuthenticatedTenant, PipelineError> {
        let raw_key = raw_key.map(str::trim).ok_or(PipelineError::Unauthorized)?;
        let key_id = parse_api_key(raw_key).ok_or(PipelineError::Unauthorized)?;

        let credentials = self
            .identity
            .find_credentials(key_id)
            .await
            .map_err(|e| {
                warn!(error = %e, "api key lookup failed");
                PipelineError::StoreUnavailable(e.to_string())
            })?
            .ok_or(PipelineError::Unauthorized)?;

        if !verify_api_key(raw_key, &credentials.key_salt, &credentials.key_hash) {
            return Err(PipelineError::Unauthorized);
        }
        if !credentials.active {
            info!(
                target: "adtivity::audit",
                tenant_id = %credentials.tenant_id,
                key_id = %credentials.key_id,
                "request refused: tenant suspended"
            );
            return Err(PipelineError::TenantSuspended);
        }

        info!(
            target: "adtivity::audit",
            tenant_id = %credentials.tenant_id,
            key_id = %credentials.key_id,
            "api key authenticated"
        );

        // Fire-and-forget: update last_used_at.
        let identity = Arc::clone(&self.identity);
        let touched = credentials.key_id.clone();
        tokio::spawn(async move {
            let _ = identity.touch_api_key(&touched).await;
        });

        Ok(AuthenticatedTenant {
            tenant_id: credentials.tenant_id,
            key_id: credentials.key_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use adtivity_core::credentials::generate_api_key;
    use adtivity_duckdb::DuckDbBackend;

    use crate::metadata::duckdb::DuckDbIdentityStore;

    fn authenticator() -> (TenantAuthenticator, Arc<DuckDbIdentityStore>) {
        let db = Arc::new(DuckDbBackend::open_in_memory().expect("db"));
        let identity = Arc::new(DuckDbIdentityStore::new(db));
        (TenantAuthenticator::new(identity.clone()), identity)
    }

    #[tokio::test]
    async fn test_valid_key_resolves_tenant() {
        let (auth, identity) = authenticator();
        let key = generate_api_key();
        let tenant = identity.create_tenant("Acme", &key).await.expect("create");

        let resolved = auth.authenticate(Some(&key.raw)).await.expect("auth");
        assert_eq!(resolved.tenant_id, tenant.id);
        assert_eq!(resolved.key_id, key.key_id);
    }

    #[tokio::test]
    async fn test_bad_keys_are_unauthorized() {
        let (auth, identity) = authenticator();
        let key = generate_api_key();
        identity.create_tenant("Acme", &key).await.expect("create");

        assert!(matches!(auth.authenticate(None).await, Err(PipelineError::Unauthorized)));
        assert!(matches!(
            auth.authenticate(Some("not-a-key")).await,
            Err(PipelineError::Unauthorized)
        ));
        // Right key id, wrong secret.
        let forged = format!("adt_{}_{}", key.key_id, "0".repeat(32));
        assert!(matches!(
            auth.authenticate(Some(&forged)).await,
            Err(PipelineError::Unauthorized)
        ));
        // Well-formed but unknown.
        let other = generate_api_key();
        assert!(matches!(
            auth.authenticate(Some(&other.raw)).await,
            Err(PipelineError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_suspended_tenant() {
        let (auth, identity) = authenticator();
        let key = generate_api_key();
        let tenant = identity.create_tenant("Acme", &key).await.expect("create");
        identity
            .set_tenant_active(&tenant.id, false)
            .await
            .expect("suspend");

        assert!(matches!(
            auth.authenticate(Some(&key.raw)).await,
            Err(PipelineError::TenantSuspended)
        ));
    }

    #[tokio::test]
    async fn test_identity_outage_is_not_unauthorized() {
        let db = Arc::new(DuckDbBackend::open_in_memory().expect("db"));
        let identity = Arc::new(DuckDbIdentityStore::new(Arc::clone(&db)));
        let auth = TenantAuthenticator::new(identity.clone());
        let key = generate_api_key();
        identity.create_tenant("Acme", &key).await.expect("create");

        db.conn_for_test()
            .await
            .execute_batch("DROP INDEX IF EXISTS idx_api_keys_tenant; DROP TABLE api_keys;")
            .expect("drop api_keys");

        assert!(matches!(
            auth.authenticate(Some(&key.raw)).await,
            Err(PipelineError::StoreUnavailable(_))
        ));
    }
}
