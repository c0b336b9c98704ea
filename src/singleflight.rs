//! Miss population with at most one computation per key
//!
//! Two layers of coordination:
//!
//! 1. In-process coalescing: concurrent callers on the same key share one
//!    in-flight population through a `watch` channel. If the leader is cancelled
//!    or its computation fails, waiters are released and run the protocol
//!    themselves, so abandoning one wait never blocks the others.
//! 2. Cross-process mutual exclusion: the leader probes the cache, then takes the
//!    distributed lock for the key. The holder computes, writes the result (or the
//!    negative sentinel) through both tiers and releases the lock. Competitors
//!    sleep, re-probe and retry; once retries are used up the configured
//!    [`ExhaustedPolicy`] decides between computing anyway and failing.

use std::{
    error::Error,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::{DashMap, mapref::entry::Entry};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::{
    CacheConfig, CacheError, CacheKey, DistributedLock, ExhaustedPolicy, TieredCacheStore,
    key::Expiration,
    negative::Payload,
    tiered::{Cacheable, Lookup},
};

#[derive(Debug, Clone)]
enum Outcome {
    Ready(Payload),
    /// The leader went away without a result.
    Abandoned,
}

struct InFlight {
    id: u64,
    rx: watch::Receiver<Option<Outcome>>,
}

type InFlightMap = DashMap<String, InFlight>;

/// Leader's handle on an in-flight population.
///
/// Dropping it without calling [`FlightGuard::complete`] (panic, cancellation or
/// error) removes the in-flight entry and tells waiters to go on their own.
struct FlightGuard {
    key: String,
    id: u64,
    in_flight: Arc<InFlightMap>,
    tx: Option<watch::Sender<Option<Outcome>>>,
}

impl FlightGuard {
    fn complete(mut self, payload: Payload) {
        self.in_flight.remove_if(&self.key, |_, f| f.id == self.id);
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(Outcome::Ready(payload)));
        }
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        // Remove before notifying so released waiters never see the stale entry.
        self.in_flight.remove_if(&self.key, |_, f| f.id == self.id);
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(Outcome::Abandoned));
        }
    }
}

async fn wait_for_leader(mut rx: watch::Receiver<Option<Outcome>>) -> Outcome {
    match rx.wait_for(Option::is_some).await {
        Ok(outcome) => outcome.clone().unwrap_or(Outcome::Abandoned),
        Err(_) => Outcome::Abandoned,
    }
}

enum Resolved<V> {
    /// Someone else populated the key meanwhile.
    Cached(Payload),
    /// This caller ran the computation.
    Computed(Payload, Option<V>),
}

impl<V: DeserializeOwned> Resolved<V> {
    fn payload(&self) -> &Payload {
        match self {
            Resolved::Cached(p) | Resolved::Computed(p, _) => p,
        }
    }

    fn into_value(self) -> Result<Option<V>, CacheError> {
        match self {
            Resolved::Cached(p) => p.decode(),
            Resolved::Computed(_, v) => Ok(v),
        }
    }
}

#[derive(Clone)]
pub struct SingleflightPopulator {
    store: TieredCacheStore,
    lock: DistributedLock,
    in_flight: Arc<InFlightMap>,
    next_id: Arc<AtomicU64>,
    retry_count: i32,
    retry_interval: Duration,
    policy: ExhaustedPolicy,
    cache_negative: bool,
}

impl SingleflightPopulator {
    pub fn new(store: TieredCacheStore, lock: DistributedLock, config: &CacheConfig) -> Self {
        Self {
            store,
            lock,
            in_flight: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(0)),
            retry_count: config.lock_retry_count,
            retry_interval: config.lock_retry_interval,
            policy: config.exhausted_policy,
            cache_negative: config.cache_negative,
        }
    }

    pub fn store(&self) -> &TieredCacheStore {
        &self.store
    }

    /// Return the cached value for `key`, computing and caching it on a miss.
    ///
    /// `Ok(None)` means the computation (now or earlier, via the negative
    /// sentinel) yielded no result. Computation errors are returned as
    /// [`CacheError::Computation`] and never cached.
    pub async fn get_or_populate<V, F, Fut, E>(
        &self,
        key: &CacheKey,
        ttl: Expiration,
        compute: F,
    ) -> Result<Option<V>, CacheError>
    where
        V: Cacheable,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, E>>,
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        match self.store.get::<V>(key).await? {
            Lookup::Hit(value) => return Ok(Some(value)),
            Lookup::Negative => return Ok(None),
            Lookup::Miss => {}
        }

        let guard = loop {
            let rx = match self.in_flight.entry(key.as_str().to_owned()) {
                Entry::Occupied(flight) => flight.get().rx.clone(),
                Entry::Vacant(slot) => {
                    let (tx, rx) = watch::channel(None);
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    slot.insert(InFlight { id, rx });
                    break FlightGuard {
                        key: key.as_str().to_owned(),
                        id,
                        in_flight: Arc::clone(&self.in_flight),
                        tx: Some(tx),
                    };
                }
            };

            debug!("Waiting for in-flight population of key: {}", key);
            match wait_for_leader(rx).await {
                Outcome::Ready(payload) => return payload.decode(),
                Outcome::Abandoned => {
                    debug!("In-flight population of key {} was abandoned", key);
                }
            }
        };

        let resolved = self.populate(key, ttl, compute).await?;
        guard.complete(resolved.payload().clone());
        resolved.into_value()
    }

    async fn populate<V, F, Fut, E>(
        &self,
        key: &CacheKey,
        ttl: Expiration,
        compute: F,
    ) -> Result<Resolved<V>, CacheError>
    where
        V: Cacheable,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, E>>,
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        let mut retries: u32 = 0;
        loop {
            if let Some(payload) = self.store.lookup(key).await {
                return Ok(Resolved::Cached(payload));
            }

            match self.lock.try_acquire(key).await {
                Ok(Some(token)) => {
                    // The previous holder may have written and released between
                    // our probe and the acquire.
                    let result = match self.store.lookup(key).await {
                        Some(payload) => Ok(Resolved::Cached(payload)),
                        None => self.compute_and_store(key, ttl, compute).await,
                    };
                    if let Err(e) = self.lock.release(token).await {
                        warn!(
                            "Failed to release population lock for key {}: {}. Lease will expire.",
                            key, e
                        );
                    }
                    return result;
                }
                Ok(None) => {
                    debug!(
                        "Population lock for key {} is held elsewhere (retry {})",
                        key, retries
                    );
                }
                Err(e) => {
                    warn!(
                        "Lock backend unavailable for key {} ({}). Treating as contended.",
                        key, e
                    );
                }
            }

            if self.retry_count >= 0 && retries >= self.retry_count.unsigned_abs() {
                return match self.policy {
                    ExhaustedPolicy::FailOpen => {
                        warn!(
                            "Lock retries exhausted for key {} after {} retries; computing without the lock",
                            key, retries
                        );
                        self.compute_and_store(key, ttl, compute).await
                    }
                    ExhaustedPolicy::FailClosed => Err(CacheError::LockContended(key.to_string())),
                };
            }

            retries = retries.saturating_add(1);
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    async fn compute_and_store<V, F, Fut, E>(
        &self,
        key: &CacheKey,
        ttl: Expiration,
        compute: F,
    ) -> Result<Resolved<V>, CacheError>
    where
        V: Cacheable,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, E>>,
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        let value = compute()
            .await
            .map_err(|e| CacheError::Computation(e.into()))?;
        let payload = Payload::encode_option(value.as_ref())?;

        let stored = match &payload {
            Payload::Negative if !self.cache_negative => Ok(()),
            Payload::Negative => {
                debug!("Caching negative result for key: {}", key);
                let ttl = ttl.min(Expiration::After(self.store.negative_ttl()));
                self.store.write(key, Payload::Negative, ttl, false).await
            }
            Payload::Value(_) => self.store.write(key, payload.clone(), ttl, false).await,
        };
        if let Err(e) = stored {
            warn!(
                "Failed to store computed value for key {}: {}. Returning it uncached.",
                key, e
            );
        }

        Ok(Resolved::Computed(payload, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{KeyCodec, LocalTier, LockBackend, MemoryStore, PrefixCodec, SharedTier};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    fn config() -> CacheConfig {
        CacheConfig {
            lock_retry_count: -1,
            lock_retry_interval: Duration::from_millis(5),
            ..Default::default()
        }
    }

    fn populator_with(
        memory: &MemoryStore,
        lock: Arc<dyn LockBackend>,
        config: &CacheConfig,
    ) -> SingleflightPopulator {
        let store = TieredCacheStore::new(
            LocalTier::from_config(config),
            SharedTier::new(Arc::new(memory.clone()), PrefixCodec::default()),
            config.negative_ttl,
        );
        SingleflightPopulator::new(store, DistributedLock::from_config(lock, config), config)
    }

    fn populator(memory: &MemoryStore, config: &CacheConfig) -> SingleflightPopulator {
        populator_with(memory, Arc::new(memory.clone()), config)
    }

    fn key() -> CacheKey {
        KeyCodec::new("", ':', '#').build_key("orders", "42").unwrap()
    }

    const TTL: Expiration = Expiration::After(Duration::from_secs(60));

    /// Lock backend that is never free.
    struct RefusingLock {
        attempts: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl LockBackend for RefusingLock {
        async fn try_acquire(&self, _: &[u8], _: &str, _: Duration) -> Result<bool, CacheError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(CacheError::backend("connection refused"))
            } else {
                Ok(false)
            }
        }

        async fn release(&self, _: &[u8], _: &str) -> Result<bool, CacheError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_in_one_process_compute_once() {
        let memory = MemoryStore::new();
        let populator = populator(&memory, &config());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let populator = populator.clone();
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                populator
                    .get_or_populate(&key(), TTL, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, CacheError>(Some(42u32))
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), Some(42));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_instances_compute_once() {
        let memory = MemoryStore::new();
        let config = config();
        let instances: Vec<_> = (0..4).map(|_| populator(&memory, &config)).collect();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for populator in instances {
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                populator
                    .get_or_populate(&key(), TTL, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, CacheError>(Some("value".to_owned()))
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), Some("value".to_owned()));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_negative_result_is_cached() {
        let memory = MemoryStore::new();
        let populator = populator(&memory, &config());
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let result = populator
                .get_or_populate(&key(), TTL, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<Option<u32>, CacheError>(None)
                })
                .await
                .unwrap();
            assert_eq!(result, None);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            populator.store().get::<u32>(&key()).await.unwrap(),
            Lookup::Negative
        );
    }

    #[tokio::test]
    async fn test_negative_caching_can_be_disabled() {
        let memory = MemoryStore::new();
        let config = CacheConfig {
            cache_negative: false,
            ..config()
        };
        let populator = populator(&memory, &config);
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            populator
                .get_or_populate(&key(), TTL, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<Option<u32>, CacheError>(None)
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_computation_error_is_propagated_and_not_cached() {
        let memory = MemoryStore::new();
        let populator = populator(&memory, &config());

        let err = populator
            .get_or_populate::<u32, _, _, _>(&key(), TTL, || async { Err("database down") })
            .await
            .unwrap_err();
        match err {
            CacheError::Computation(inner) => assert_eq!(inner.to_string(), "database down"),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(
            populator.store().get::<u32>(&key()).await.unwrap(),
            Lookup::Miss
        );
        assert!(memory.is_empty(), "lock must be released after a failed computation");

        let value = populator
            .get_or_populate(&key(), TTL, || async { Ok::<_, CacheError>(Some(7u32)) })
            .await
            .unwrap();
        assert_eq!(value, Some(7));
    }

    #[tokio::test]
    async fn test_fail_open_after_exhausted_retries() {
        let memory = MemoryStore::new();
        let lock = Arc::new(RefusingLock {
            attempts: AtomicUsize::new(0),
            fail: false,
        });
        let config = CacheConfig {
            lock_retry_count: 3,
            lock_retry_interval: Duration::from_millis(1),
            ..Default::default()
        };
        let populator = populator_with(&memory, lock.clone(), &config);
        let calls = AtomicUsize::new(0);

        let value = populator
            .get_or_populate(&key(), TTL, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, CacheError>(Some(99u32))
            })
            .await
            .unwrap();

        assert_eq!(value, Some(99));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(lock.attempts.load(Ordering::SeqCst), 4);
        assert_eq!(
            populator.store().get::<u32>(&key()).await.unwrap(),
            Lookup::Hit(99)
        );
    }

    #[tokio::test]
    async fn test_zero_retries_goes_straight_to_fail_open() {
        let memory = MemoryStore::new();
        let lock = Arc::new(RefusingLock {
            attempts: AtomicUsize::new(0),
            fail: false,
        });
        let config = CacheConfig {
            lock_retry_count: 0,
            ..Default::default()
        };
        let populator = populator_with(&memory, lock.clone(), &config);

        let value = populator
            .get_or_populate(&key(), TTL, || async { Ok::<_, CacheError>(Some(1u8)) })
            .await
            .unwrap();
        assert_eq!(value, Some(1));
        assert_eq!(lock.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fail_closed_reports_contention() {
        let memory = MemoryStore::new();
        let lock = Arc::new(RefusingLock {
            attempts: AtomicUsize::new(0),
            fail: false,
        });
        let config = CacheConfig {
            lock_retry_count: 2,
            lock_retry_interval: Duration::from_millis(1),
            exhausted_policy: ExhaustedPolicy::FailClosed,
            ..Default::default()
        };
        let populator = populator_with(&memory, lock, &config);
        let calls = AtomicUsize::new(0);

        let err = populator
            .get_or_populate(&key(), TTL, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, CacheError>(Some(1u8))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::LockContended(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unavailable_lock_backend_does_not_fail_reads() {
        let memory = MemoryStore::new();
        let lock = Arc::new(RefusingLock {
            attempts: AtomicUsize::new(0),
            fail: true,
        });
        let config = CacheConfig {
            lock_retry_count: 1,
            lock_retry_interval: Duration::from_millis(1),
            ..Default::default()
        };
        let populator = populator_with(&memory, lock, &config);

        let value = populator
            .get_or_populate(&key(), TTL, || async { Ok::<_, CacheError>(Some(5u8)) })
            .await
            .unwrap();
        assert_eq!(value, Some(5));
    }

    #[tokio::test]
    async fn test_abandoned_leader_does_not_block_waiters() {
        let memory = MemoryStore::new();
        let config = CacheConfig {
            lock_retry_count: 3,
            lock_retry_interval: Duration::from_millis(5),
            ..Default::default()
        };
        let populator = populator(&memory, &config);

        let leader = {
            let populator = populator.clone();
            tokio::spawn(async move {
                populator
                    .get_or_populate(&key(), TTL, || async {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Ok::<_, CacheError>(Some(1u32))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let follower = {
            let populator = populator.clone();
            tokio::spawn(async move {
                populator
                    .get_or_populate(&key(), TTL, || async { Ok::<_, CacheError>(Some(2u32)) })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        leader.abort();

        let value = tokio::time::timeout(Duration::from_secs(2), follower)
            .await
            .expect("follower must not wait for the abandoned leader")
            .unwrap()
            .unwrap();
        assert_eq!(value, Some(2));
    }
}
