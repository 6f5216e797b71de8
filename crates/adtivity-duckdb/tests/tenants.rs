use adtivity_core::credentials::{generate_api_key, parse_api_key, verify_api_key};
use adtivity_duckdb::DuckDbBackend;

#[tokio::test]
async fn test_create_tenant_stores_salted_key() {
    let db = DuckDbBackend::open_in_memory().expect("db");
    let key = generate_api_key();
    let tenant = db.create_tenant("Acme", &key).await.expect("create");
    assert!(tenant.id.starts_with("tnt_"));
    assert!(tenant.active);

    let key_id = parse_api_key(&key.raw).expect("well-formed key");
    let creds = db
        .find_credentials(key_id)
        .await
        .expect("lookup")
        .expect("credentials present");
    assert_eq!(creds.tenant_id, tenant.id);
    assert_ne!(creds.key_hash, key.raw, "raw key must never be stored");
    assert!(verify_api_key(&key.raw, &creds.key_salt, &creds.key_hash));
}

#[tokio::test]
async fn test_suspended_tenant_is_visible_as_inactive() {
    let db = DuckDbBackend::open_in_memory().expect("db");
    let key = generate_api_key();
    let tenant = db.create_tenant("Acme", &key).await.expect("create");

    assert!(db.set_tenant_active(&tenant.id, false).await.expect("suspend"));
    let creds = db
        .find_credentials(&key.key_id)
        .await
        .expect("lookup")
        .expect("credentials present");
    assert!(!creds.active);

    assert!(!db
        .set_tenant_active("tnt_missing", false)
        .await
        .expect("missing"));
}

#[tokio::test]
async fn test_rotate_revokes_previous_key() {
    let db = DuckDbBackend::open_in_memory().expect("db");
    let old = generate_api_key();
    let tenant = db.create_tenant("Acme", &old).await.expect("create");

    let new = generate_api_key();
    assert!(db.rotate_api_key(&tenant.id, &new).await.expect("rotate"));
    assert!(db.find_credentials(&old.key_id).await.expect("old").is_none());
    assert!(db.find_credentials(&new.key_id).await.expect("new").is_some());

    let keys = db.list_api_keys(&tenant.id).await.expect("list");
    assert_eq!(keys.len(), 2);
    assert_eq!(keys.iter().filter(|k| k.revoked_at.is_none()).count(), 1);

    assert!(!db
        .rotate_api_key("tnt_missing", &generate_api_key())
        .await
        .expect("missing tenant"));
}

#[tokio::test]
async fn test_touch_api_key_sets_last_used() {
    let db = DuckDbBackend::open_in_memory().expect("db");
    let key = generate_api_key();
    let tenant = db.create_tenant("Acme", &key).await.expect("create");
    db.touch_api_key(&key.key_id).await.expect("touch");
    let keys = db.list_api_keys(&tenant.id).await.expect("list");
    assert!(keys[0].last_used_at.is_some());
    assert_eq!(db.get_tenant(&tenant.id).await.expect("get").map(|t| t.name), Some("Acme".to_string()));
}

#[tokio::test]
async fn test_lookup_errors_are_not_reported_as_missing() {
    let db = DuckDbBackend::open_in_memory().expect("db");
    let key = generate_api_key();
    let tenant = db.create_tenant("Acme", &key).await.expect("create");

    assert!(db.find_credentials("nosuchkey").await.expect("lookup").is_none());
    assert!(db.get_tenant("tnt_missing").await.expect("get").is_none());

    {
        let conn = db.conn_for_test().await;
        conn.execute_batch("DROP INDEX IF EXISTS idx_api_keys_tenant; DROP TABLE api_keys; DROP TABLE tenants;")
            .expect("drop identity tables");
    }
    assert!(db.find_credentials(&key.key_id).await.is_err());
    assert!(db.get_tenant(&tenant.id).await.is_err());
}
