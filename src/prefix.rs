//! Byte-level key prefixing at the shared-store boundary
//!
//! Every key written to the shared store is wrapped with the configured tenant or
//! deployment prefix, and every key read back from an enumeration is unwrapped
//! again, so callers only ever see their own logical keys.

use tracing::warn;

use crate::CacheConfig;

#[derive(Debug, Clone, Default)]
pub struct PrefixCodec {
    prefix: Vec<u8>,
    enabled: bool,
}

impl PrefixCodec {
    pub fn new(prefix: impl Into<Vec<u8>>, enabled: bool) -> Self {
        let prefix = prefix.into();
        if enabled && prefix.is_empty() {
            warn!("Store key prefixing is enabled but the prefix is empty; keys are left unprefixed");
        }
        Self { prefix, enabled }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.store_prefix.as_bytes(), config.store_prefix_enabled)
    }

    /// Whether keys are actually rewritten.
    pub fn matches(&self) -> bool {
        self.enabled && !self.prefix.is_empty()
    }

    pub fn prefix(&self) -> &[u8] {
        if self.matches() { self.prefix.as_slice() } else { &[] }
    }

    pub fn wrap(&self, key: &[u8]) -> Vec<u8> {
        if !self.matches() {
            return key.to_vec();
        }
        let mut out = Vec::with_capacity(self.prefix.len() + key.len());
        out.extend_from_slice(&self.prefix);
        out.extend_from_slice(key);
        out
    }

    /// Strip the prefix length from `key`.
    ///
    /// Keys shorter than the prefix, or not starting with it, are returned unchanged
    /// and logged, since they were not written through this codec.
    pub fn unwrap<'a>(&self, key: &'a [u8]) -> &'a [u8] {
        if !self.matches() {
            return key;
        }
        match key.strip_prefix(self.prefix.as_slice()) {
            Some(rest) => rest,
            None => {
                warn!(
                    "Store key {:?} does not carry the configured prefix",
                    String::from_utf8_lossy(key)
                );
                key
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_wrap_prepends_prefix() {
        let codec = PrefixCodec::new("tenant-a:", true);
        assert_eq!(codec.wrap(b"orders:42"), b"tenant-a:orders:42".to_vec());
        assert_eq!(codec.unwrap(b"tenant-a:orders:42"), b"orders:42");
    }

    #[test]
    fn test_disabled_is_noop() {
        let codec = PrefixCodec::new("tenant-a:", false);
        assert!(!codec.matches());
        assert_eq!(codec.wrap(b"orders:42"), b"orders:42".to_vec());
        assert_eq!(codec.unwrap(b"tenant-a:orders:42"), b"tenant-a:orders:42");
    }

    #[test]
    fn test_empty_prefix_is_noop() {
        let codec = PrefixCodec::new(Vec::new(), true);
        assert!(!codec.matches());
        assert_eq!(codec.wrap(b"k"), b"k".to_vec());
        assert_eq!(codec.unwrap(b"k"), b"k");
    }

    #[test]
    fn test_unwrap_foreign_key_is_untouched() {
        let codec = PrefixCodec::new("t:", true);
        assert_eq!(codec.unwrap(b"x"), b"x");
        assert_eq!(codec.unwrap(b"other:k"), b"other:k");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        /// unwrap(wrap(x)) == x for every non-empty prefix and byte sequence.
        #[test]
        fn prop_wrap_unwrap_roundtrip(
            prefix in proptest::collection::vec(any::<u8>(), 1..16),
            key in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let codec = PrefixCodec::new(prefix, true);
            let wrapped = codec.wrap(&key);
            prop_assert_eq!(codec.unwrap(&wrapped), key.as_slice());
        }
    }
}
