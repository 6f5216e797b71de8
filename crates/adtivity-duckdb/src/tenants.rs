use anyhow::Result;

use adtivity_core::credentials::GeneratedKey;
pub use adtivity_metadata::{ApiKeyRecord, Tenant, TenantCredentials};

use crate::DuckDbBackend;

/// Tenant id: `tnt_` + simple (dashless) UUID v4.
pub(crate) fn new_tenant_id() -> String {
    format!("tnt_{}", uuid::Uuid::new_v4().simple())
}

impl DuckDbBackend {
    /// Create a tenant together with its first API key, atomically.
    pub async fn create_tenant(&self, name: &str, key: &GeneratedKey) -> Result<Tenant> {
        let id = new_tenant_id();
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO tenants (id, name, active) VALUES (?1, ?2, true)",
            duckdb::params![id, name],
        )?;
        insert_key(&tx, &id, key)?;
        let tenant = tx
            .prepare(
                "SELECT id, name, active, CAST(created_at AS VARCHAR) FROM tenants WHERE id = ?1",
            )?
            .query_row(duckdb::params![id], |row| {
                Ok(Tenant {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    active: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })?;
        tx.commit()?;
        Ok(tenant)
    }

    pub async fn get_tenant(&self, tenant_id: &str) -> Result<Option<Tenant>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, name, active, CAST(created_at AS VARCHAR) FROM tenants WHERE id = ?1",
        )?;
        match stmt.query_row(duckdb::params![tenant_id], |row| {
            Ok(Tenant {
                id: row.get(0)?,
                name: row.get(1)?,
                active: row.get(2)?,
                created_at: row.get(3)?,
            })
        }) {
            Ok(tenant) => Ok(Some(tenant)),
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(anyhow::anyhow!(e)),
        }
    }

    pub async fn set_tenant_active(&self, tenant_id: &str, active: bool) -> Result<bool> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE tenants SET active = ?1 WHERE id = ?2",
            duckdb::params![active, tenant_id],
        )?;
        Ok(updated > 0)
    }

    /// Look up a live key by its key id. Revoked keys are invisible.
    pub async fn find_credentials(&self, key_id: &str) -> Result<Option<TenantCredentials>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT k.tenant_id, k.key_id, k.key_salt, k.key_hash, t.active \
             FROM api_keys k JOIN tenants t ON t.id = k.tenant_id \
             WHERE k.key_id = ?1 AND k.revoked_at IS NULL",
        )?;
        match stmt.query_row(duckdb::params![key_id], |row| {
            Ok(TenantCredentials {
                tenant_id: row.get(0)?,
                key_id: row.get(1)?,
                key_salt: row.get(2)?,
                key_hash: row.get(3)?,
                active: row.get(4)?,
            })
        }) {
            Ok(credentials) => Ok(Some(credentials)),
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(anyhow::anyhow!(e)),
        }
    }

    /// Update last_used_at for an API key.
    pub async fn touch_api_key(&self, key_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE api_keys SET last_used_at = CURRENT_TIMESTAMP WHERE key_id = ?1",
            duckdb::params![key_id],
        )?;
        Ok(())
    }

    pub async fn rotate_api_key(&self, tenant_id: &str, key: &GeneratedKey) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let exists: i64 = tx
            .prepare("SELECT COUNT(*) FROM tenants WHERE id = ?1")?
            .query_row(duckdb::params![tenant_id], |row| row.get(0))?;
        if exists == 0 {
            return Ok(false);
        }
        tx.execute(
            "UPDATE api_keys SET revoked_at = CURRENT_TIMESTAMP \
             WHERE tenant_id = ?1 AND revoked_at IS NULL",
            duckdb::params![tenant_id],
        )?;
        insert_key(&tx, tenant_id, key)?;
        tx.commit()?;
        Ok(true)
    }

    pub async fn list_api_keys(&self, tenant_id: &str) -> Result<Vec<ApiKeyRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT key_id, tenant_id, key_prefix, \
             CAST(created_at AS VARCHAR), \
             CAST(last_used_at AS VARCHAR), \
             CAST(revoked_at AS VARCHAR) \
             FROM api_keys WHERE tenant_id = ?1 \
             ORDER BY created_at DESC",
        )?;
        let mapped = stmt.query_map(duckdb::params![tenant_id], |row| {
            Ok(ApiKeyRecord {
                key_id: row.get(0)?,
                tenant_id: row.get(1)?,
                key_prefix: row.get(2)?,
                created_at: row.get(3)?,
                last_used_at: row.get(4)?,
                revoked_at: row.get(5)?,
            })
        })?;
        let mut keys = Vec::new();
        for key in mapped {
            keys.push(key?);
        }
        Ok(keys)
    }
}

fn insert_key(conn: &duckdb::Connection, tenant_id: &str, key: &GeneratedKey) -> Result<()> {
    conn.execute(
        "INSERT INTO api_keys (key_id, tenant_id, key_salt, key_hash, key_prefix) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        duckdb::params![key.key_id, tenant_id, key.salt, key.hash, key.prefix],
    )?;
    Ok(())
}
