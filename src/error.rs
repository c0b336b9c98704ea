//! Cache error types

use redis::RedisError;

/// Cache-related errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Namespace or identifier rejected before any I/O took place.
    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    #[error("Invalid TTL: {0}")]
    InvalidTtl(String),

    #[error("Invalid cache configuration: {0}")]
    InvalidConfig(String),

    /// The shared store, lock backend or invalidation bus could not be reached.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The caller-supplied computation failed. Carries the caller's error unchanged.
    #[error("Computation error: {0}")]
    Computation(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Lock retries were exhausted and the fail-closed policy is active.
    #[error("Lock contended for key {0}")]
    LockContended(String),
}

impl From<RedisError> for CacheError {
    fn from(e: RedisError) -> Self {
        CacheError::BackendUnavailable(Box::new(e))
    }
}

impl CacheError {
    /// True for failures of a collaborator backend, which read paths absorb.
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, CacheError::BackendUnavailable(_))
    }

    #[cfg(test)]
    pub(crate) fn backend(msg: impl Into<String>) -> Self {
        CacheError::BackendUnavailable(msg.into().into())
    }
}
