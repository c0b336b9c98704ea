//! tiercache - Tiered cache-aside engine
//!
//! This library caches the results of expensive computations in two tiers:
//! - Local: in-process Moka cache (fastest, per instance)
//! - Shared: Redis or any [`SharedStore`] (shared across instances, source of truth)
//!
//! The cache supports:
//! - Keys built from a namespace and an identifier, with optional per-namespace TTLs
//! - Singleflight population: one computation per key across all instances
//! - Negative caching of "no result" outcomes
//! - Cross-instance invalidation of the local tier
//! - Byte-prefix isolation of keys at the shared-store boundary

mod config;
mod engine;
mod error;
mod invalidation;
mod key;
mod local;
mod lock;
mod memory;
mod negative;
mod prefix;
mod redis_backend;
mod shared;
mod singleflight;
mod tiered;

pub use config::{CacheConfig, ExhaustedPolicy};
pub use engine::{Backends, CacheEngine, CacheOperation, OperationKind};
pub use error::CacheError;
pub use invalidation::{Invalidation, InvalidationBus, InvalidationScope, LocalBus};
pub use key::{CacheKey, Expiration, KeyCodec, MAX_TTL, TimeUnit, Ttl};
pub use local::LocalTier;
pub use lock::{DistributedLock, LockBackend, LockToken};
pub use memory::MemoryStore;
pub use negative::{NEGATIVE_SENTINEL, Payload};
pub use prefix::PrefixCodec;
pub use redis_backend::{RedisBus, RedisStore};
pub use shared::{SharedStore, SharedTier, TtlRemaining};
pub use singleflight::SingleflightPopulator;
pub use tiered::{Cacheable, Lookup, TieredCacheStore};

// Re-export async_trait for backend implementors
pub use async_trait::async_trait;
