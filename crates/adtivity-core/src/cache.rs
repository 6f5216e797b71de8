use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::metric::{Aggregate, Granularity};

/// Cache key for one aggregate bucket. The tenant id is part of the key, so
/// entries of different tenants can never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub tenant_id: String,
    pub metric_key: String,
    pub granularity: Granularity,
    pub bucket_start: DateTime<Utc>,
}

impl CacheKey {
    pub fn new(
        tenant_id: &str,
        metric_key: &str,
        granularity: Granularity,
        bucket_start: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            metric_key: metric_key.to_string(),
            granularity,
            bucket_start,
        }
    }

    /// Flat string form for string-keyed caches.
    ///
    /// The tenant id is length-prefixed so no tenant id can forge another
    /// tenant's namespace, whatever characters it contains.
    pub fn namespaced(&self) -> String {
        format!(
            "agg:{}:{}|{}|{}|{}",
            self.tenant_id.len(),
            self.tenant_id,
            self.metric_key,
            self.granularity,
            self.bucket_start.timestamp()
        )
    }
}

/// The cache collaborator holding derived, disposable aggregate copies.
#[async_trait]
pub trait AggregateCache: Send + Sync + 'static {
    async fn get(&self, key: &CacheKey) -> Option<Aggregate>;
    async fn set(&self, key: CacheKey, value: Aggregate, ttl: Duration);
    async fn invalidate(&self, key: &CacheKey);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_cannot_be_forged_by_tenant_id() {
        let at = DateTime::from_timestamp(3_600, 0).unwrap_or_default();
        let a = CacheKey::new("t1|x", "m", Granularity::Hour, at);
        let b = CacheKey::new("t1", "x|m", Granularity::Hour, at);
        assert_ne!(a.namespaced(), b.namespaced());
    }
}
