//! Distributed population locks
//!
//! A lock is a key in a shared backend holding a random token, written with
//! set-if-absent and a fixed lease. Release deletes the key only while it still
//! holds the caller's token, so a holder whose lease already lapsed cannot free a
//! lock that another caller has since taken.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::{CacheConfig, CacheError, CacheKey, PrefixCodec};

/// Backend providing atomic set-if-absent with expiry and token-checked delete.
#[async_trait]
pub trait LockBackend: Send + Sync + 'static {
    /// Set `key` to `token` if it is absent, expiring after `lease`.
    /// Returns whether the lock was taken.
    async fn try_acquire(&self, key: &[u8], token: &str, lease: Duration)
    -> Result<bool, CacheError>;

    /// Delete `key` if it still holds `token`. Returns whether it was deleted.
    async fn release(&self, key: &[u8], token: &str) -> Result<bool, CacheError>;
}

/// Ownership of the right to populate one cache key.
#[derive(Debug)]
pub struct LockToken {
    key: Vec<u8>,
    token: String,
    acquired_at: Instant,
    lease: Duration,
}

impl LockToken {
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Whether the lease has run out, after which another caller may hold the lock.
    pub fn is_expired(&self) -> bool {
        self.acquired_at.elapsed() >= self.lease
    }
}

#[derive(Clone)]
pub struct DistributedLock {
    backend: Arc<dyn LockBackend>,
    codec: PrefixCodec,
    prefix: String,
    lease: Duration,
}

impl DistributedLock {
    pub fn new(
        backend: Arc<dyn LockBackend>,
        codec: PrefixCodec,
        prefix: impl Into<String>,
        lease: Duration,
    ) -> Self {
        Self {
            backend,
            codec,
            prefix: prefix.into(),
            lease,
        }
    }

    /// Lock keys start with the TTL separator, which no namespace or key prefix
    /// may contain, so they never coincide with a cache key.
    pub fn from_config(backend: Arc<dyn LockBackend>, config: &CacheConfig) -> Self {
        Self::new(
            backend,
            PrefixCodec::from_config(config),
            format!("{}{}", config.ttl_separator, config.lock_prefix),
            config.lock_lease,
        )
    }

    fn lock_key(&self, key: &CacheKey) -> Vec<u8> {
        let mut logical = Vec::with_capacity(self.prefix.len() + key.as_str().len());
        logical.extend_from_slice(self.prefix.as_bytes());
        logical.extend_from_slice(key.as_str().as_bytes());
        self.codec.wrap(&logical)
    }

    /// Try once to take the lock for `key`.
    pub async fn try_acquire(&self, key: &CacheKey) -> Result<Option<LockToken>, CacheError> {
        let lock_key = self.lock_key(key);
        let token = Uuid::new_v4().to_string();
        let acquired_at = Instant::now();

        if self.backend.try_acquire(&lock_key, &token, self.lease).await? {
            debug!("Acquired population lock for key: {}", key);
            Ok(Some(LockToken {
                key: lock_key,
                token,
                acquired_at,
                lease: self.lease,
            }))
        } else {
            Ok(None)
        }
    }

    /// Release a held lock. Returns `false` if the lease had already lapsed.
    pub async fn release(&self, token: LockToken) -> Result<bool, CacheError> {
        let released = self.backend.release(&token.key, &token.token).await?;
        if !released {
            debug!(
                "Population lock was no longer held at release (expired: {})",
                token.is_expired()
            );
        }
        Ok(released)
    }
}
