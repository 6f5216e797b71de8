use std::sync::Arc;

use async_trait::async_trait;

use adtivity_core::credentials::GeneratedKey;
use adtivity_duckdb::DuckDbBackend;

use super::{ApiKeyRecord, IdentityStore, Tenant, TenantCredentials};

pub struct DuckDbIdentityStore {
    db: Arc<DuckDbBackend>,
}

impl DuckDbIdentityStore {
    pub fn new(db: Arc<DuckDbBackend>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl IdentityStore for DuckDbIdentityStore {
    async fn find_credentials(&self, key_id: &str) -> anyhow::Result<Option<TenantCredentials>> {
        self.db.find_credentials(key_id).await
    }

    async fn touch_api_key(&self, key_id: &str) -> anyhow::Result<()> {
        self.db.touch_api_key(key_id).await
    }

    async fn create_tenant(&self, name: &str, key: &GeneratedKey) -> anyhow::Result<Tenant> {
        self.db.create_tenant(name, key).await
    }

    async fn get_tenant(&self, tenant_id: &str) -> anyhow::Result<Option<Tenant>> {
        self.db.get_tenant(tenant_id).await
    }

    async fn set_tenant_active(&self, tenant_id: &str, active: bool) -> anyhow::Result<bool> {
        self.db.set_tenant_active(tenant_id, active).await
    }

    async fn rotate_api_key(&self, tenant_id: &str, key: &GeneratedKey) -> anyhow::Result<bool> {
        self.db.rotate_api_key(tenant_id, key).await
    }

    async fn list_api_keys(&self, tenant_id: &str) -> anyhow::Result<Vec<ApiKeyRecord>> {
        self.db.list_api_keys(tenant_id).await
    }
}
