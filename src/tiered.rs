//! Local + shared tier composition
//!
//! Reads go local first, then shared, promoting shared hits into the local tier.
//! Writes go to the shared tier first and only then to the local tier; evictions
//! delete from the shared tier before dropping the local copy, so a concurrent
//! reader cannot repopulate the local tier from a shared entry that is about to go.

use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, warn};

use crate::{
    CacheError, CacheKey, LocalTier, SharedTier,
    invalidation::{InvalidationScope, Publisher},
    key::Expiration,
    negative::Payload,
    shared::TtlRemaining,
};

/// Values that can be stored in the cache
pub trait Cacheable: Serialize + DeserializeOwned + Send + Sync + 'static {}
impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Result of a cache read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<V> {
    Hit(V),
    /// A previous computation yielded no result.
    Negative,
    /// Nothing cached.
    Miss,
}

impl<V> Lookup<V> {
    pub fn is_miss(&self) -> bool {
        matches!(self, Lookup::Miss)
    }

    /// `Some(value)` for hits, `None` for negative entries and misses.
    pub fn into_value(self) -> Option<V> {
        match self {
            Lookup::Hit(v) => Some(v),
            Lookup::Negative | Lookup::Miss => None,
        }
    }
}

#[derive(Clone)]
pub struct TieredCacheStore {
    local: LocalTier,
    shared: SharedTier,
    negative_ttl: Duration,
    publisher: Option<Publisher>,
}

impl TieredCacheStore {
    pub fn new(local: LocalTier, shared: SharedTier, negative_ttl: Duration) -> Self {
        Self {
            local,
            shared,
            negative_ttl,
            publisher: None,
        }
    }

    pub(crate) fn with_publisher(mut self, publisher: Publisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn local(&self) -> &LocalTier {
        &self.local
    }

    pub fn shared(&self) -> &SharedTier {
        &self.shared
    }

    pub fn negative_ttl(&self) -> Duration {
        self.negative_ttl
    }

    /// Raw payload lookup. Shared-tier failures degrade to a miss.
    pub(crate) async fn lookup(&self, key: &CacheKey) -> Option<Payload> {
        if let Some(payload) = self.local.get(key.as_str()).await {
            debug!("Cache hit L1 for key: {}", key);
            return Some(payload);
        }
        debug!("Cache miss L1 for key: {}", key);

        match self.shared.get(key.as_str()).await {
            Ok(Some(payload)) => {
                debug!("Cache hit L2 for key: {}", key);
                self.promote(key, &payload).await;
                Some(payload)
            }
            Ok(None) => {
                debug!("Cache miss L2 for key: {}", key);
                None
            }
            Err(e) => {
                warn!(
                    "L2 GET error for key {} ({}). Treating as a miss.",
                    key, e
                );
                None
            }
        }
    }

    /// Copy a shared-tier hit into the local tier, expiring no later than the
    /// shared entry. Best effort: if the remaining TTL is unknown, skip the copy.
    async fn promote(&self, key: &CacheKey, payload: &Payload) {
        if !self.local.is_enabled() {
            return;
        }
        let remaining = match self.shared.ttl_remaining(key.as_str()).await {
            Ok(TtlRemaining::Expires(d)) => Expiration::After(d),
            Ok(TtlRemaining::Persistent) => Expiration::Never,
            Ok(TtlRemaining::Missing) => return,
            Err(e) => {
                warn!("L2 TTL lookup failed for key {} ({}). Not promoting.", key, e);
                return;
            }
        };
        let local_ttl = if payload.is_negative() {
            remaining.min(Expiration::After(self.negative_ttl))
        } else {
            remaining
        };
        self.local
            .put(key.as_str(), payload.clone(), local_ttl)
            .await;
    }

    /// Read `key` as `V`.
    ///
    /// An entry that no longer decodes as `V` is deleted and reported as a miss.
    pub async fn get<V: DeserializeOwned>(&self, key: &CacheKey) -> Result<Lookup<V>, CacheError> {
        let Some(payload) = self.lookup(key).await else {
            return Ok(Lookup::Miss);
        };
        match payload.decode::<V>() {
            Ok(Some(value)) => Ok(Lookup::Hit(value)),
            Ok(None) => Ok(Lookup::Negative),
            Err(e) => {
                warn!(
                    "Failed to deserialize cached value for key {}: {}. Deleting corrupt entry.",
                    key, e
                );
                self.local.invalidate(key.as_str()).await;
                if let Err(del_err) = self.shared.delete(key.as_str()).await {
                    warn!(
                        "Failed to delete corrupt L2 entry for key {}: {}",
                        key, del_err
                    );
                }
                Ok(Lookup::Miss)
            }
        }
    }

    /// Write-through of an already encoded payload.
    pub(crate) async fn write(
        &self,
        key: &CacheKey,
        payload: Payload,
        ttl: Expiration,
        notify: bool,
    ) -> Result<(), CacheError> {
        self.shared.set(key.as_str(), &payload, ttl).await?;
        self.local.put(key.as_str(), payload, ttl).await;
        if notify && let Some(publisher) = &self.publisher {
            publisher
                .publish(InvalidationScope::Key, key.as_str())
                .await;
        }
        Ok(())
    }

    pub async fn put<V: Serialize>(
        &self,
        key: &CacheKey,
        value: &V,
        ttl: Expiration,
    ) -> Result<(), CacheError> {
        let payload = Payload::encode(value)?;
        self.write(key, payload, ttl, true).await
    }

    /// Store the negative sentinel for `key`, bounded by the negative TTL.
    pub async fn put_negative(&self, key: &CacheKey, ttl: Expiration) -> Result<(), CacheError> {
        let ttl = ttl.min(Expiration::After(self.negative_ttl));
        self.write(key, Payload::Negative, ttl, true).await
    }

    /// Remove `key` from both tiers. Returns whether the shared tier held it.
    pub async fn evict(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let deleted = self.shared.delete(key.as_str()).await;
        self.local.invalidate(key.as_str()).await;
        let deleted = deleted?;
        debug!("Evicted key {} (present in L2: {})", key, deleted);
        if let Some(publisher) = &self.publisher {
            publisher
                .publish(InvalidationScope::Key, key.as_str())
                .await;
        }
        Ok(deleted)
    }

    /// Remove every key starting with `prefix` from both tiers.
    pub async fn evict_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let deleted = self.shared.delete_prefix(prefix).await;
        self.local.invalidate_prefix(prefix).await;
        let deleted = deleted?;
        if let Some(publisher) = &self.publisher {
            publisher
                .publish(InvalidationScope::Namespace, prefix)
                .await;
        }
        Ok(deleted)
    }
}
