//! Shared (process-external) cache tier
//!
//! [`SharedStore`] is the backend seam: anything offering GET/SET/DEL/EXISTS/TTL on
//! byte keys with per-key expiry. [`SharedTier`] sits in front of it, applies the
//! [`PrefixCodec`] on the way in and out, and guards against zero-duration writes.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::debug;

use crate::{CacheError, PrefixCodec, key::Expiration, negative::Payload};

/// Remaining lifetime of a shared-store key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlRemaining {
    /// The key does not exist.
    Missing,
    /// The key exists and never expires.
    Persistent,
    Expires(Duration),
}

/// Backend of the shared tier.
#[async_trait]
pub trait SharedStore: Send + Sync + 'static {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, CacheError>;

    /// Write `value`. `ttl` is either `Never` or a non-zero duration.
    async fn set(&self, key: &[u8], value: &[u8], ttl: Expiration) -> Result<(), CacheError>;

    /// Delete `key`, returning whether it existed.
    async fn delete(&self, key: &[u8]) -> Result<bool, CacheError>;

    /// Delete several keys, returning how many existed.
    async fn delete_many(&self, keys: &[Vec<u8>]) -> Result<u64, CacheError> {
        let mut deleted = 0;
        for key in keys {
            if self.delete(key).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn exists(&self, key: &[u8]) -> Result<bool, CacheError>;

    async fn ttl_remaining(&self, key: &[u8]) -> Result<TtlRemaining, CacheError>;

    /// Enumerate raw keys starting with `prefix`.
    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, CacheError>;
}

#[derive(Clone)]
pub struct SharedTier {
    store: Arc<dyn SharedStore>,
    codec: PrefixCodec,
}

impl SharedTier {
    pub fn new(store: Arc<dyn SharedStore>, codec: PrefixCodec) -> Self {
        Self { store, codec }
    }

    pub fn codec(&self) -> &PrefixCodec {
        &self.codec
    }

    pub async fn get(&self, key: &str) -> Result<Option<Payload>, CacheError> {
        let raw = self.codec.wrap(key.as_bytes());
        Ok(self.store.get(&raw).await?.map(Payload::from_bytes))
    }

    pub async fn set(&self, key: &str, payload: &Payload, ttl: Expiration) -> Result<(), CacheError> {
        if let Expiration::After(d) = ttl
            && d.is_zero()
        {
            return Err(CacheError::InvalidTtl(format!(
                "refusing zero-duration write for key {key}"
            )));
        }
        let raw = self.codec.wrap(key.as_bytes());
        self.store.set(&raw, payload.as_bytes(), ttl).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let raw = self.codec.wrap(key.as_bytes());
        self.store.delete(&raw).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let raw = self.codec.wrap(key.as_bytes());
        self.store.exists(&raw).await
    }

    pub async fn ttl_remaining(&self, key: &str) -> Result<TtlRemaining, CacheError> {
        let raw = self.codec.wrap(key.as_bytes());
        self.store.ttl_remaining(&raw).await
    }

    /// Logical keys starting with `prefix`, with the store prefix removed.
    pub async fn keys(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        let raw_prefix = self.codec.wrap(prefix.as_bytes());
        let raw_keys = self.store.scan_prefix(&raw_prefix).await?;
        Ok(raw_keys
            .iter()
            .map(|raw| String::from_utf8_lossy(self.codec.unwrap(raw)).into_owned())
            .collect())
    }

    /// Delete every key starting with `prefix`, returning how many were deleted.
    pub async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let raw_prefix = self.codec.wrap(prefix.as_bytes());
        let raw_keys = self.store.scan_prefix(&raw_prefix).await?;
        if raw_keys.is_empty() {
            return Ok(0);
        }
        let deleted = self.store.delete_many(&raw_keys).await?;
        debug!("Shared tier deleted {} keys under {}", deleted, prefix);
        Ok(deleted)
    }
}
