//! Cache-aside engine
//!
//! `CacheEngine` ties the key codec, both tiers, the population lock and the
//! invalidation bus together behind namespace/identifier calls. Clones share one
//! engine; the invalidation listener stops when the last clone is dropped.

use std::{error::Error, future::Future, sync::Arc};

use serde::{Serialize, de::DeserializeOwned};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    CacheConfig, CacheError, CacheKey, DistributedLock, KeyCodec, LocalTier, MemoryStore,
    PrefixCodec, SharedTier, SingleflightPopulator, TieredCacheStore,
    invalidation::{InvalidationBus, Publisher, spawn_listener},
    key::{TimeUnit, Ttl},
    lock::LockBackend,
    redis_backend::{RedisBus, RedisStore},
    shared::{SharedStore, TtlRemaining},
    tiered::{Cacheable, Lookup},
};

/// External services an engine runs against.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn SharedStore>,
    pub lock: Arc<dyn LockBackend>,
    pub bus: Option<Arc<dyn InvalidationBus>>,
}

impl Backends {
    /// Shared tier and locks on an in-process [`MemoryStore`].
    pub fn memory(store: &MemoryStore, bus: Option<Arc<dyn InvalidationBus>>) -> Self {
        Self {
            store: Arc::new(store.clone()),
            lock: Arc::new(store.clone()),
            bus,
        }
    }

    /// Shared tier, locks and invalidation on one Redis deployment.
    pub async fn redis(client: redis::Client, config: &CacheConfig) -> Result<Self, CacheError> {
        let store = Arc::new(RedisStore::new(client.clone()).await?);
        let bus: Option<Arc<dyn InvalidationBus>> = if config.enable_invalidation {
            Some(Arc::new(
                RedisBus::new(client, config.invalidation_channel.clone()).await?,
            ))
        } else {
            None
        };
        Ok(Self {
            store: store.clone(),
            lock: store,
            bus,
        })
    }
}

/// What a [`CacheOperation`] does around its computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Return the cached value, computing it on a miss.
    Read,
    /// Always compute, then write the result through.
    Put,
    /// Compute, then evict the key.
    Delete,
    /// Compute, then evict the whole namespace.
    DeleteAll,
}

/// A cache operation requested by an interception layer around a computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOperation {
    pub namespace: String,
    /// Ignored by [`OperationKind::DeleteAll`].
    pub identifier: String,
    /// Raw TTL amount: zero uses the default, negative never expires.
    pub ttl: i64,
    pub time_unit: TimeUnit,
    pub kind: OperationKind,
}

impl CacheOperation {
    pub fn new(
        kind: OperationKind,
        namespace: impl Into<String>,
        identifier: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            identifier: identifier.into(),
            ttl: 0,
            time_unit: TimeUnit::default(),
            kind,
        }
    }

    pub fn read(namespace: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self::new(OperationKind::Read, namespace, identifier)
    }

    pub fn put(namespace: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self::new(OperationKind::Put, namespace, identifier)
    }

    pub fn delete(namespace: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self::new(OperationKind::Delete, namespace, identifier)
    }

    pub fn delete_all(namespace: impl Into<String>) -> Self {
        Self::new(OperationKind::DeleteAll, namespace, String::new())
    }

    pub fn with_ttl(mut self, amount: i64, unit: TimeUnit) -> Self {
        self.ttl = amount;
        self.time_unit = unit;
        self
    }

    pub fn requested_ttl(&self) -> Ttl {
        Ttl::from_raw(self.ttl, self.time_unit)
    }
}

struct EngineInner {
    config: CacheConfig,
    codec: KeyCodec,
    populator: SingleflightPopulator,
    listener: Option<JoinHandle<()>>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

#[derive(Clone)]
pub struct CacheEngine {
    inner: Arc<EngineInner>,
}

impl CacheEngine {
    /// Build an engine on `backends`.
    ///
    /// With invalidation enabled and a bus present, the engine subscribes before
    /// returning, so it sees every invalidation published after construction.
    pub async fn new(config: CacheConfig, backends: Backends) -> Result<Self, CacheError> {
        config.validate()?;

        let local = LocalTier::from_config(&config);
        let shared = SharedTier::new(backends.store, PrefixCodec::from_config(&config));
        let mut store = TieredCacheStore::new(local.clone(), shared, config.negative_ttl);

        let mut listener = None;
        if config.enable_invalidation
            && let Some(bus) = backends.bus
        {
            let origin = Uuid::new_v4().to_string();
            let initial = bus.subscribe().await?;
            listener = Some(spawn_listener(
                Arc::clone(&bus),
                local,
                origin.clone(),
                initial,
            ));
            info!("Cache engine {} listening for invalidations", origin);
            store = store.with_publisher(Publisher::new(bus, origin));
        }

        let lock = DistributedLock::from_config(backends.lock, &config);
        let populator = SingleflightPopulator::new(store, lock, &config);

        Ok(Self {
            inner: Arc::new(EngineInner {
                codec: KeyCodec::from_config(&config),
                config,
                populator,
                listener,
            }),
        })
    }

    /// Engine on a fresh in-process store with no invalidation bus.
    pub async fn in_memory(config: CacheConfig) -> Result<Self, CacheError> {
        Self::new(config, Backends::memory(&MemoryStore::new(), None)).await
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &TieredCacheStore {
        self.inner.populator.store()
    }

    pub fn key(&self, namespace: &str, identifier: &str) -> Result<CacheKey, CacheError> {
        self.inner.codec.build_key(namespace, identifier)
    }

    /// Read without populating.
    pub async fn get<V: DeserializeOwned>(
        &self,
        namespace: &str,
        identifier: &str,
    ) -> Result<Lookup<V>, CacheError> {
        let key = self.key(namespace, identifier)?;
        self.store().get(&key).await
    }

    /// Cache-aside read: return the cached value or compute, cache and return it.
    ///
    /// `Ok(None)` means the computation yielded no result, now or within the
    /// negative TTL of an earlier call.
    pub async fn get_or_compute<V, F, Fut, E>(
        &self,
        namespace: &str,
        identifier: &str,
        ttl: Ttl,
        compute: F,
    ) -> Result<Option<V>, CacheError>
    where
        V: Cacheable,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, E>>,
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        let key = self.key(namespace, identifier)?;
        let expiration = key.resolve_ttl(ttl, self.inner.config.default_ttl)?;
        self.inner
            .populator
            .get_or_populate(&key, expiration, compute)
            .await
    }

    pub async fn put<V: Serialize>(
        &self,
        namespace: &str,
        identifier: &str,
        value: &V,
        ttl: Ttl,
    ) -> Result<(), CacheError> {
        let key = self.key(namespace, identifier)?;
        let expiration = key.resolve_ttl(ttl, self.inner.config.default_ttl)?;
        self.store().put(&key, value, expiration).await
    }

    /// Record that `identifier` has no value.
    pub async fn put_negative(
        &self,
        namespace: &str,
        identifier: &str,
        ttl: Ttl,
    ) -> Result<(), CacheError> {
        let key = self.key(namespace, identifier)?;
        let expiration = key.resolve_ttl(ttl, self.inner.config.default_ttl)?;
        self.store().put_negative(&key, expiration).await
    }

    /// Remove one entry from both tiers. Returns whether the shared tier held it.
    pub async fn evict(&self, namespace: &str, identifier: &str) -> Result<bool, CacheError> {
        let key = self.key(namespace, identifier)?;
        self.store().evict(&key).await
    }

    /// Remove every entry of `namespace` from both tiers.
    pub async fn evict_namespace(&self, namespace: &str) -> Result<u64, CacheError> {
        let prefix = self.inner.codec.namespace_prefix(namespace)?;
        let deleted = self.store().evict_prefix(&prefix).await?;
        info!("Evicted {} entries from namespace {}", deleted, namespace);
        Ok(deleted)
    }

    /// Cache keys of `namespace` currently in the shared tier.
    pub async fn keys(&self, namespace: &str) -> Result<Vec<String>, CacheError> {
        let prefix = self.inner.codec.namespace_prefix(namespace)?;
        self.store().shared().keys(&prefix).await
    }

    pub async fn exists(&self, namespace: &str, identifier: &str) -> Result<bool, CacheError> {
        let key = self.key(namespace, identifier)?;
        self.store().shared().exists(key.as_str()).await
    }

    pub async fn ttl_remaining(
        &self,
        namespace: &str,
        identifier: &str,
    ) -> Result<TtlRemaining, CacheError> {
        let key = self.key(namespace, identifier)?;
        self.store().shared().ttl_remaining(key.as_str()).await
    }

    /// Run `compute` under the caching behaviour of `operation`.
    ///
    /// Key and TTL errors are reported before `compute` runs. For put and delete
    /// operations the computation has already taken effect when the cache is
    /// updated, so a cache failure at that point is logged and its result is
    /// still returned. A failed computation leaves the cache untouched.
    pub async fn execute<V, F, Fut, E>(
        &self,
        operation: &CacheOperation,
        compute: F,
    ) -> Result<Option<V>, CacheError>
    where
        V: Cacheable,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, E>>,
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        let ttl = operation.requested_ttl();
        match operation.kind {
            OperationKind::Read => {
                self.get_or_compute(&operation.namespace, &operation.identifier, ttl, compute)
                    .await
            }
            OperationKind::Put => {
                let key = self.key(&operation.namespace, &operation.identifier)?;
                let expiration = key.resolve_ttl(ttl, self.inner.config.default_ttl)?;
                let value = run(compute).await?;
                let written = match &value {
                    Some(v) => self.store().put(&key, v, expiration).await,
                    None if self.inner.config.cache_negative => {
                        self.store().put_negative(&key, expiration).await
                    }
                    // Without negative caching an absent result must not leave
                    // the previous value behind.
                    None => self.store().evict(&key).await.map(|_| ()),
                };
                if let Err(e) = written {
                    warn!("Cache put failed for key {}: {}", key, e);
                }
                Ok(value)
            }
            OperationKind::Delete => {
                let key = self.key(&operation.namespace, &operation.identifier)?;
                let value = run(compute).await?;
                match self.store().evict(&key).await {
                    Ok(present) => {
                        debug!("Evicted key {} after operation (present: {})", key, present)
                    }
                    Err(e) => warn!("Cache evict failed for key {}: {}", key, e),
                }
                Ok(value)
            }
            OperationKind::DeleteAll => {
                let prefix = self.inner.codec.namespace_prefix(&operation.namespace)?;
                let value = run(compute).await?;
                if let Err(e) = self.store().evict_prefix(&prefix).await {
                    warn!(
                        "Cache evict failed for namespace {}: {}",
                        operation.namespace, e
                    );
                }
                Ok(value)
            }
        }
    }
}

async fn run<V, F, Fut, E>(compute: F) -> Result<Option<V>, CacheError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Option<V>, E>>,
    E: Into<Box<dyn Error + Send + Sync>>,
{
    compute()
        .await
        .map_err(|e| CacheError::Computation(e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn engine() -> CacheEngine {
        CacheEngine::in_memory(CacheConfig::default()).await.unwrap()
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = CacheConfig {
            delimiter: '#',
            ..Default::default()
        };
        assert!(matches!(
            CacheEngine::in_memory(config).await,
            Err(CacheError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let engine = engine().await;
        engine
            .put("orders", "42", &"shipped".to_owned(), Ttl::Default)
            .await
            .unwrap();
        assert_eq!(
            engine.get::<String>("orders", "42").await.unwrap(),
            Lookup::Hit("shipped".to_owned())
        );
        assert!(engine.exists("orders", "42").await.unwrap());
    }

    #[tokio::test]
    async fn test_namespace_ttl_is_applied() {
        let engine = engine().await;
        engine
            .put("orders#300", "42", &1u32, Ttl::Default)
            .await
            .unwrap();

        // The TTL suffix is not part of the key.
        assert_eq!(engine.get::<u32>("orders", "42").await.unwrap(), Lookup::Hit(1));
        match engine.ttl_remaining("orders", "42").await.unwrap() {
            TtlRemaining::Expires(d) => {
                assert!(d <= Duration::from_secs(300) && d > Duration::from_secs(290))
            }
            other => panic!("expected an expiring entry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_zero_ttl_is_rejected() {
        let engine = engine().await;
        let err = engine
            .put("orders", "1", &1u32, Ttl::After(Duration::ZERO))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidTtl(_)));
    }

    #[tokio::test]
    async fn test_invalid_key_fails_before_compute() {
        let engine = engine().await;
        let ran = std::sync::atomic::AtomicBool::new(false);
        let err = engine
            .get_or_compute("orders", "  ", Ttl::Default, || async {
                ran.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok::<_, CacheError>(Some(1u32))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidKey(_)));
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_execute_delete_all_evicts_namespace_only() {
        let engine = engine().await;
        for id in ["1", "2", "3"] {
            engine.put("orders", id, &id, Ttl::Default).await.unwrap();
        }
        engine.put("users", "1", &"u", Ttl::Default).await.unwrap();

        let out = engine
            .execute(&CacheOperation::delete_all("orders"), || async {
                Ok::<_, CacheError>(Some(true))
            })
            .await
            .unwrap();
        assert_eq!(out, Some(true));
        assert!(engine.keys("orders").await.unwrap().is_empty());
        assert_eq!(engine.keys("users").await.unwrap(), vec!["users:1".to_owned()]);
        assert!(engine.get::<String>("orders", "1").await.unwrap().is_miss());
    }

    #[tokio::test]
    async fn test_failed_delete_leaves_cache_untouched() {
        let engine = engine().await;
        engine.put("orders", "9", &9u32, Ttl::Default).await.unwrap();

        let err = engine
            .execute::<u32, _, _, _>(&CacheOperation::delete("orders", "9"), || async {
                Err("constraint violation")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Computation(_)));
        assert_eq!(engine.get::<u32>("orders", "9").await.unwrap(), Lookup::Hit(9));
    }

    #[test]
    fn test_operation_ttl() {
        let op = CacheOperation::read("orders", "1");
        assert_eq!(op.requested_ttl(), Ttl::Default);
        let op = op.with_ttl(-1, TimeUnit::Seconds);
        assert_eq!(op.requested_ttl(), Ttl::Never);
        let op = op.with_ttl(5, TimeUnit::Minutes);
        assert_eq!(op.requested_ttl(), Ttl::secs(300));
    }
}
