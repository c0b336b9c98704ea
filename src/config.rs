//! Cache configuration

use std::time::Duration;

use crate::CacheError;

/// What the populator does once lock retries are used up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExhaustedPolicy {
    /// Run the computation anyway and accept duplicate work.
    #[default]
    FailOpen,
    /// Give up with [`CacheError::LockContended`].
    FailClosed,
}

/// Configuration for the tiered cache engine
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Global key prefix, prepended to every key with `delimiter`. Empty disables it.
    pub key_prefix: String,
    /// Separator between prefix, namespace and identifier
    pub delimiter: char,
    /// Separator between a namespace and its embedded TTL (`orders#300s`)
    pub ttl_separator: char,
    /// TTL used when neither the call nor the namespace specifies one
    pub default_ttl: Duration,
    /// Maximum number of entries in the local tier. Zero disables the local tier.
    pub local_max_capacity: u64,
    /// Upper bound on how long an entry lives in the local tier
    pub local_ttl: Duration,
    /// Cache "no result" outcomes as a negative sentinel
    pub cache_negative: bool,
    /// TTL of negative sentinels
    pub negative_ttl: Duration,
    /// Byte prefix applied to keys at the shared-store boundary
    pub store_prefix: String,
    /// Enables `store_prefix`
    pub store_prefix_enabled: bool,
    /// Prefix of lock keys. Lock keys are `<ttl_separator><lock_prefix><cache key>`.
    pub lock_prefix: String,
    /// Lease of a population lock; a crashed holder frees the key after this
    pub lock_lease: Duration,
    /// Lock acquisition retries after the first attempt. Negative retries forever.
    pub lock_retry_count: i32,
    /// Sleep between lock acquisition attempts
    pub lock_retry_interval: Duration,
    pub exhausted_policy: ExhaustedPolicy,
    /// Broadcast local-tier invalidations to other instances
    pub enable_invalidation: bool,
    /// Channel used for cross-instance invalidation messages
    pub invalidation_channel: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: String::new(),
            delimiter: ':',
            ttl_separator: '#',
            default_ttl: Duration::from_secs(1800), // 30 minutes
            local_max_capacity: 1000,
            local_ttl: Duration::from_secs(300), // 5 minutes
            cache_negative: true,
            negative_ttl: Duration::from_secs(60),
            store_prefix: String::new(),
            store_prefix_enabled: false,
            lock_prefix: "lock:".to_owned(),
            lock_lease: Duration::from_secs(30),
            lock_retry_count: 3,
            lock_retry_interval: Duration::from_millis(100),
            exhausted_policy: ExhaustedPolicy::FailOpen,
            enable_invalidation: true,
            invalidation_channel: "cache:invalidate".to_owned(),
        }
    }
}

impl CacheConfig {
    /// Reject configurations the engine cannot operate with.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.delimiter == self.ttl_separator {
            return Err(CacheError::InvalidConfig(format!(
                "delimiter and ttl_separator must differ (both '{}')",
                self.delimiter
            )));
        }
        if self.key_prefix.contains(self.ttl_separator) {
            return Err(CacheError::InvalidConfig(format!(
                "key_prefix '{}' contains the ttl separator",
                self.key_prefix
            )));
        }
        for (name, value) in [
            ("default_ttl", self.default_ttl),
            ("negative_ttl", self.negative_ttl),
            ("local_ttl", self.local_ttl),
            ("lock_lease", self.lock_lease),
        ] {
            if value.is_zero() {
                return Err(CacheError::InvalidConfig(format!("{name} must be non-zero")));
            }
        }
        if self.lock_prefix.is_empty() {
            return Err(CacheError::InvalidConfig(
                "lock_prefix must not be empty".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CacheConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_shared_separator() {
        let config = CacheConfig {
            ttl_separator: ':',
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(CacheError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_zero_durations() {
        let config = CacheConfig {
            lock_lease: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = CacheConfig {
            negative_ttl: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
