use adtivity_core::credentials::generate_api_key;
use adtivity_metadata::{ApiKeyRecord, IdentityStore, Tenant};

/// Create a tenant together with its first API key.
///
/// Returns the tenant and the raw key. The raw key is not stored anywhere
/// and cannot be recovered later.
pub async fn provision_tenant(
    identity: &dyn IdentityStore,
    name: &str,
) -> anyhow::Result<(Tenant, String)> {
    let name = name.trim();
    if name.is_empty() {
        anyhow::bail!("tenant name must not be empty");
    }
    let key = generate_api_key();
    let tenant = identity.create_tenant(name, &key).await?;
    tracing::info!(
        target: "adtivity::audit",
        tenant_id = %tenant.id,
        key_prefix = %key.prefix,
        "tenant provisioned"
    );
    Ok((tenant, key.raw))
}

/// Replace the tenant's active key. `Ok(None)` when the tenant does not exist.
pub async fn rotate_tenant_key(
    identity: &dyn IdentityStore,
    tenant_id: &str,
) -> anyhow::Result<Option<String>> {
    let key = generate_api_key();
    if !identity.rotate_api_key(tenant_id, &key).await? {
        return Ok(None);
    }
    tracing::info!(
        target: "adtivity::audit",
        tenant_id,
        key_prefix = %key.prefix,
        "api key rotated"
    );
    Ok(Some(key.raw))
}

/// The tenant with every key it has held, newest first. `Ok(None)` when the
/// tenant does not exist.
pub async fn describe_tenant(
    identity: &dyn IdentityStore,
    tenant_id: &str,
) -> anyhow::Result<Option<(Tenant, Vec<ApiKeyRecord>)>> {
    let Some(tenant) = identity.get_tenant(tenant_id).await? else {
        return Ok(None);
    };
    let keys = identity.list_api_keys(tenant_id).await?;
    Ok(Some((tenant, keys)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use adtivity_duckdb::DuckDbBackend;

    use crate::metadata::duckdb::DuckDbIdentityStore;

    fn identity() -> DuckDbIdentityStore {
        DuckDbIdentityStore::new(Arc::new(DuckDbBackend::open_in_memory().expect("db")))
    }

    #[tokio::test]
    async fn test_rotation_shows_up_in_tenant_description() {
        let identity = identity();
        let (tenant, _) = provision_tenant(&identity, "  Acme ").await.expect("provision");
        assert_eq!(tenant.name, "Acme");

        let rotated = rotate_tenant_key(&identity, &tenant.id)
            .await
            .expect("rotate");
        assert!(rotated.is_some());

        let (described, keys) = describe_tenant(&identity, &tenant.id)
            .await
            .expect("describe")
            .expect("tenant exists");
        assert_eq!(described.id, tenant.id);
        assert_eq!(keys.len(), 2);
        assert_eq!(keys.iter().filter(|k| k.revoked_at.is_some()).count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_tenant_and_blank_name() {
        let identity = identity();
        assert!(provision_tenant(&identity, "   ").await.is_err());
        assert!(rotate_tenant_key(&identity, "tnt_missing")
            .await
            .expect("rotate")
            .is_none());
        assert!(describe_tenant(&identity, "tnt_missing")
            .await
            .expect("describe")
            .is_none());
    }
}
