use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{RwLock, RwLockReadGuard};
use tokio::time::Instant;

use adtivity_core::cache::{AggregateCache, CacheKey};
use adtivity_core::metric::Aggregate;

struct CacheEntry {
    value: Aggregate,
    expires_at: Instant,
}

/// Process-local aggregate cache with per-entry TTL.
///
/// Expired entries are treated as misses on read and dropped by
/// [`InMemoryAggregateCache::purge_expired`], which the server runs on a
/// timer.
#[derive(Default)]
pub struct InMemoryAggregateCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
}

impl InMemoryAggregateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries; returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl AggregateCache for InMemoryAggregateCache {
    async fn get(&self, key: &CacheKey) -> Option<Aggregate> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.value.clone())
    }

    async fn set(&self, key: CacheKey, value: Aggregate, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        self.entries
            .write()
            .await
            .insert(key, CacheEntry { value, expires_at });
    }

    async fn invalidate(&self, key: &CacheKey) {
        self.entries.write().await.remove(key);
    }
}

/// Orders cache fills against invalidations, per tenant.
///
/// Writers bump the tenant's epoch and invalidate while holding the write
/// lock. Readers record the epoch before reading the store and only fill the
/// cache, under the read lock, if the epoch is unchanged. A fill can
/// therefore never resurrect a value that an invalidation already removed.
#[derive(Default)]
pub(crate) struct CacheFence {
    epochs: RwLock<HashMap<String, u64>>,
}

impl CacheFence {
    pub(crate) async fn epoch(&self, tenant_id: &str) -> u64 {
        self.epochs
            .read()
            .await
            .get(tenant_id)
            .copied()
            .unwrap_or(0)
    }

    /// Hold while filling; check [`FillGuard::is_current`] first.
    pub(crate) async fn fill(&self) -> FillGuard<'_> {
        FillGuard {
            epochs: self.epochs.read().await,
        }
    }

    pub(crate) async fn invalidate<'a, I>(&self, tenant_id: &str, cache: &dyn AggregateCache, keys: I)
    where
        I: IntoIterator<Item = &'a CacheKey>,
    {
        let mut epochs = self.epochs.write().await;
        *epochs.entry(tenant_id.to_string()).or_default() += 1;
        for key in keys {
            cache.invalidate(key).await;
        }
    }
}

pub(crate) struct FillGuard<'a> {
    epochs: RwLockReadGuard<'a, HashMap<String, u64>>,
}

impl FillGuard<'_> {
    pub(crate) fn is_current(&self, tenant_id: &str, seen: u64) -> bool {
        self.epochs.get(tenant_id).copied().unwrap_or(0) == seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adtivity_core::metric::Granularity;
    use chrono::DateTime;

    fn key(tenant: &str) -> CacheKey {
        let bucket = DateTime::from_timestamp(7_200, 0).unwrap_or_default();
        CacheKey::new(tenant, "page_view_count", Granularity::Hour, bucket)
    }

    fn value(tenant: &str, v: f64) -> Aggregate {
        let mut agg = Aggregate::empty(tenant, "page_view_count", Granularity::Hour, key(tenant).bucket_start);
        agg.value = v;
        agg
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = InMemoryAggregateCache::new();
        cache.set(key("t1"), value("t1", 3.0), Duration::from_secs(10)).await;
        assert_eq!(cache.get(&key("t1")).await.map(|a| a.value), Some(3.0));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.get(&key("t1")).await.is_none());
        assert_eq!(cache.purge_expired().await, 1);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn keys_are_tenant_scoped() {
        let cache = InMemoryAggregateCache::new();
        cache.set(key("t1"), value("t1", 3.0), Duration::from_secs(60)).await;
        assert!(cache.get(&key("t2")).await.is_none());
        cache.invalidate(&key("t1")).await;
        assert!(cache.get(&key("t1")).await.is_none());
    }

    #[tokio::test]
    async fn fence_rejects_fill_after_invalidation() {
        let cache = InMemoryAggregateCache::new();
        let fence = CacheFence::default();
        let seen = fence.epoch("t1").await;
        fence.invalidate("t1", &cache, [&key("t1")]).await;
        assert!(!fence.fill().await.is_current("t1", seen));
        assert!(fence.fill().await.is_current("t2", 0));
    }
}
