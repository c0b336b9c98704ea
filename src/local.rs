//! In-process cache tier
//!
//! A bounded Moka cache with per-entry expiry. It only ever holds copies of
//! payloads that were read from or written to the shared tier, so dropping it
//! (capacity zero) changes latency, never results.

use std::time::{Duration, Instant};

use moka::{Expiry, future::Cache, policy::EvictionPolicy};
use tracing::debug;

use crate::{CacheConfig, key::Expiration, negative::Payload};

#[derive(Debug, Clone)]
struct LocalEntry {
    payload: Payload,
    ttl: Duration,
}

/// Expires each entry after its own TTL.
struct PerEntryExpiry;

impl Expiry<String, LocalEntry> for PerEntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &LocalEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &LocalEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

#[derive(Clone)]
pub struct LocalTier {
    cache: Option<Cache<String, LocalEntry>>,
    max_ttl: Duration,
}

impl LocalTier {
    /// Create a local tier holding at most `capacity` entries, each for at most
    /// `max_ttl`. A capacity of zero disables the tier.
    pub fn new(capacity: u64, max_ttl: Duration) -> Self {
        let cache = (capacity > 0).then(|| {
            Cache::builder()
                .max_capacity(capacity)
                .eviction_policy(EvictionPolicy::lru())
                .expire_after(PerEntryExpiry)
                .build()
        });
        Self { cache, max_ttl }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.local_max_capacity, config.local_ttl)
    }

    pub fn is_enabled(&self) -> bool {
        self.cache.is_some()
    }

    pub async fn get(&self, key: &str) -> Option<Payload> {
        let cache = self.cache.as_ref()?;
        cache.get(key).await.map(|entry| entry.payload)
    }

    /// Store a copy of `payload`, expiring at the earlier of `ttl` and the tier's cap.
    pub async fn put(&self, key: &str, payload: Payload, ttl: Expiration) {
        let Some(cache) = &self.cache else {
            return;
        };
        let ttl = ttl.capped(self.max_ttl);
        if ttl.is_zero() {
            return;
        }
        cache.insert(key.to_owned(), LocalEntry { payload, ttl }).await;
    }

    pub async fn invalidate(&self, key: &str) {
        if let Some(cache) = &self.cache {
            cache.invalidate(key).await;
        }
    }

    /// Drop every entry whose key starts with `prefix`. Returns how many were dropped.
    pub async fn invalidate_prefix(&self, prefix: &str) -> usize {
        let Some(cache) = &self.cache else {
            return 0;
        };
        let doomed: Vec<_> = cache
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k)
            .collect();
        for key in &doomed {
            cache.invalidate(key.as_str()).await;
        }
        debug!("Local tier dropped {} entries under {}", doomed.len(), prefix);
        doomed.len()
    }

    /// Approximate number of live entries.
    pub async fn entry_count(&self) -> u64 {
        match &self.cache {
            Some(cache) => {
                cache.run_pending_tasks().await;
                cache.entry_count()
            }
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn value(s: &str) -> Payload {
        Payload::Value(Arc::new(s.as_bytes().to_vec()))
    }

    #[tokio::test]
    async fn test_put_get_invalidate() {
        let tier = LocalTier::new(16, Duration::from_secs(60));
        tier.put("orders:1", value("a"), Expiration::Never).await;
        assert_eq!(tier.get("orders:1").await, Some(value("a")));

        tier.invalidate("orders:1").await;
        assert_eq!(tier.get("orders:1").await, None);
    }

    #[tokio::test]
    async fn test_per_entry_expiry() {
        let tier = LocalTier::new(16, Duration::from_secs(60));
        tier.put("short", value("a"), Expiration::After(Duration::from_millis(50)))
            .await;
        tier.put("long", value("b"), Expiration::After(Duration::from_secs(30)))
            .await;

        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(tier.get("short").await, None);
        assert_eq!(tier.get("long").await, Some(value("b")));
    }

    #[tokio::test]
    async fn test_ttl_is_capped() {
        let tier = LocalTier::new(16, Duration::from_millis(50));
        tier.put("k", value("a"), Expiration::Never).await;
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(tier.get("k").await, None);
    }

    #[tokio::test]
    async fn test_capacity_is_bounded() {
        let tier = LocalTier::new(4, Duration::from_secs(60));
        for i in 0..32 {
            tier.put(&format!("k{i}"), value("v"), Expiration::Never).await;
        }
        assert!(tier.entry_count().await <= 4);
    }

    #[tokio::test]
    async fn test_zero_capacity_disables_tier() {
        let tier = LocalTier::new(0, Duration::from_secs(60));
        assert!(!tier.is_enabled());
        tier.put("k", value("a"), Expiration::Never).await;
        assert_eq!(tier.get("k").await, None);
    }

    #[tokio::test]
    async fn test_invalidate_prefix() {
        let tier = LocalTier::new(16, Duration::from_secs(60));
        tier.put("orders:1", value("a"), Expiration::Never).await;
        tier.put("orders:2", value("b"), Expiration::Never).await;
        tier.put("users:1", value("c"), Expiration::Never).await;

        assert_eq!(tier.invalidate_prefix("orders:").await, 2);
        assert_eq!(tier.get("orders:1").await, None);
        assert_eq!(tier.get("users:1").await, Some(value("c")));
    }
}
