//! In-process shared-store backend
//!
//! `MemoryStore` implements both [`SharedStore`] and [`LockBackend`] on a
//! `DashMap`, with the same expiry semantics as the Redis backend. Clones share
//! state, so several engines in one process can use it as their common shared
//! tier, e.g. in single-instance deployments and tests.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};

use crate::{
    CacheError,
    key::Expiration,
    lock::LockBackend,
    shared::{SharedStore, TtlRemaining},
};

#[derive(Debug, Clone)]
struct StoredEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn new(value: Vec<u8>, ttl: Expiration) -> Self {
        let expires_at = match ttl {
            Expiration::Never => None,
            Expiration::After(d) => Some(Instant::now() + d),
        };
        Self { value, expires_at }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<Vec<u8>, StoredEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys, lock keys included.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live(&self, key: &[u8]) -> Option<StoredEntry> {
        let entry = self.entries.get(key)?;
        if entry.is_expired() {
            drop(entry);
            self.entries.remove_if(key, |_, e| e.is_expired());
            return None;
        }
        Some(entry.value().clone())
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.live(key).map(|e| e.value))
    }

    async fn set(&self, key: &[u8], value: &[u8], ttl: Expiration) -> Result<(), CacheError> {
        self.entries
            .insert(key.to_vec(), StoredEntry::new(value.to_vec(), ttl));
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<bool, CacheError> {
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, e)| !e.is_expired()))
    }

    async fn exists(&self, key: &[u8]) -> Result<bool, CacheError> {
        Ok(self.live(key).is_some())
    }

    async fn ttl_remaining(&self, key: &[u8]) -> Result<TtlRemaining, CacheError> {
        Ok(match self.live(key) {
            None => TtlRemaining::Missing,
            Some(StoredEntry {
                expires_at: None, ..
            }) => TtlRemaining::Persistent,
            Some(StoredEntry {
                expires_at: Some(at),
                ..
            }) => TtlRemaining::Expires(at.saturating_duration_since(Instant::now())),
        })
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, CacheError> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && !e.value().is_expired())
            .map(|e| e.key().clone())
            .collect())
    }
}

#[async_trait]
impl LockBackend for MemoryStore {
    async fn try_acquire(
        &self,
        key: &[u8],
        token: &str,
        lease: Duration,
    ) -> Result<bool, CacheError> {
        let entry = StoredEntry::new(token.as_bytes().to_vec(), Expiration::After(lease));
        match self.entries.entry(key.to_vec()) {
            Entry::Occupied(mut held) => {
                if held.get().is_expired() {
                    held.insert(entry);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &[u8], token: &str) -> Result<bool, CacheError> {
        Ok(self
            .entries
            .remove_if(key, |_, e| {
                !e.is_expired() && e.value.as_slice() == token.as_bytes()
            })
            .is_some())
    }
}
