use adtivity_core::credentials::GeneratedKey;
use async_trait::async_trait;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub active: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyRecord {
    pub key_id: String,
    pub tenant_id: String,
    pub key_prefix: String,
    pub created_at: String,
    pub last_used_at: Option<String>,
    pub revoked_at: Option<String>,
}

/// What the authenticator needs to check a presented key. Never serialized.
#[derive(Debug, Clone)]
pub struct TenantCredentials {
    pub tenant_id: String,
    pub key_id: String,
    pub key_salt: String,
    pub key_hash: String,
    pub active: bool,
}

/// Storage interface for tenants and their API keys.
///
/// The pipeline only reads credentials; tenant lifecycle calls exist for
/// provisioning tools and tests.
#[async_trait]
pub trait IdentityStore: Send + Sync + 'static {
    /// Credentials of the live (non-revoked) key with this id.
    async fn find_credentials(&self, key_id: &str) -> anyhow::Result<Option<TenantCredentials>>;
    async fn touch_api_key(&self, key_id: &str) -> anyhow::Result<()>;

    async fn create_tenant(&self, name: &str, key: &GeneratedKey) -> anyhow::Result<Tenant>;
    async fn get_tenant(&self, tenant_id: &str) -> anyhow::Result<Option<Tenant>>;
    /// Returns `false` when the tenant does not exist.
    async fn set_tenant_active(&self, tenant_id: &str, active: bool) -> anyhow::Result<bool>;

    /// Revoke every live key of the tenant and store `key` in their place.
    /// Returns `false` when the tenant does not exist.
    async fn rotate_api_key(&self, tenant_id: &str, key: &GeneratedKey) -> anyhow::Result<bool>;
    async fn list_api_keys(&self, tenant_id: &str) -> anyhow::Result<Vec<ApiKeyRecord>>;
}
