//! Cache key construction and TTL resolution
//!
//! Keys have the shape `<prefix><delimiter><namespace><delimiter><identifier>`.
//! A namespace may carry an embedded TTL after the TTL separator, e.g.
//! `orders#300` or `orders#5m`. The suffix is split off before the key is built,
//! so every entry of a namespace shares one key prefix regardless of its TTL.

use std::{
    fmt::{self, Display},
    hash::{Hash, Hasher},
    time::Duration,
};

use crate::{CacheConfig, CacheError};

/// Unit of a raw TTL amount handed over by the trigger interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeUnit {
    Milliseconds,
    #[default]
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    pub fn to_duration(self, amount: u64) -> Duration {
        match self {
            Self::Milliseconds => Duration::from_millis(amount),
            Self::Seconds => Duration::from_secs(amount),
            Self::Minutes => Duration::from_secs(amount.saturating_mul(60)),
            Self::Hours => Duration::from_secs(amount.saturating_mul(3600)),
            Self::Days => Duration::from_secs(amount.saturating_mul(86_400)),
        }
    }
}

/// Longest TTL accepted anywhere. Shared stores keep expiry as a millisecond
/// timestamp, so anything much longer overflows on their side.
pub const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 86_400);

/// Per-call TTL request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ttl {
    /// Use the namespace-embedded TTL, or the global default.
    #[default]
    Default,
    /// Never expire.
    Never,
    /// Expire after the given duration. A zero duration is rejected.
    After(Duration),
}

impl Ttl {
    /// Interpret a raw amount: zero means default, negative means never expire.
    pub fn from_raw(amount: i64, unit: TimeUnit) -> Self {
        match amount {
            0 => Ttl::Default,
            a if a < 0 => Ttl::Never,
            a => Ttl::After(unit.to_duration(a.unsigned_abs())),
        }
    }

    pub fn secs(secs: u64) -> Self {
        Ttl::After(Duration::from_secs(secs))
    }
}

/// A resolved expiry, as written to the tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiration {
    Never,
    After(Duration),
}

impl Expiration {
    /// The shorter of two expirations.
    pub fn min(self, other: Expiration) -> Expiration {
        match (self, other) {
            (Expiration::Never, o) => o,
            (s, Expiration::Never) => s,
            (Expiration::After(a), Expiration::After(b)) => Expiration::After(a.min(b)),
        }
    }

    /// Duration bounded by `cap`; never-expiring entries get `cap`.
    pub fn capped(self, cap: Duration) -> Duration {
        match self {
            Expiration::Never => cap,
            Expiration::After(d) => d.min(cap),
        }
    }
}

/// Fully-qualified cache key.
///
/// Equality and hashing consider only the key string.
#[derive(Debug, Clone)]
pub struct CacheKey {
    full: String,
    namespace: String,
    embedded_ttl: Option<Duration>,
}

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.full
    }

    /// Logical namespace with any TTL suffix removed
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// TTL parsed from the namespace suffix, if any
    pub fn embedded_ttl(&self) -> Option<Duration> {
        self.embedded_ttl
    }

    /// Resolve the TTL for a write: explicit call TTL, then the namespace TTL,
    /// then `default`.
    pub fn resolve_ttl(&self, explicit: Ttl, default: Duration) -> Result<Expiration, CacheError> {
        let resolved = match explicit {
            Ttl::Never => Expiration::Never,
            Ttl::After(d) => Expiration::After(d),
            Ttl::Default => Expiration::After(self.embedded_ttl.unwrap_or(default)),
        };
        match resolved {
            Expiration::After(d) if d.is_zero() => Err(CacheError::InvalidTtl(format!(
                "zero TTL for key {}",
                self.full
            ))),
            Expiration::After(d) if d > MAX_TTL => Err(CacheError::InvalidTtl(format!(
                "TTL {:?} for key {} exceeds {:?}",
                d, self.full, MAX_TTL
            ))),
            r => Ok(r),
        }
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.full == other.full
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.full.hash(state);
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.full
    }
}

/// Builds cache keys from a namespace and an identifier
#[derive(Debug, Clone)]
pub struct KeyCodec {
    prefix: String,
    delimiter: char,
    ttl_separator: char,
}

impl KeyCodec {
    pub fn new(prefix: impl Into<String>, delimiter: char, ttl_separator: char) -> Self {
        Self {
            prefix: prefix.into(),
            delimiter,
            ttl_separator,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.key_prefix.clone(), config.delimiter, config.ttl_separator)
    }

    /// Build the key for `identifier` within `namespace`.
    ///
    /// The namespace must not contain the delimiter, which keeps the
    /// namespace/identifier boundary unambiguous.
    pub fn build_key(&self, namespace: &str, identifier: &str) -> Result<CacheKey, CacheError> {
        if identifier.trim().is_empty() {
            return Err(CacheError::InvalidKey(format!(
                "blank identifier in namespace '{namespace}'"
            )));
        }
        let (base, embedded_ttl) = self.resolve_ttl(namespace)?;

        let mut full = self.namespace_prefix_unchecked(base);
        full.push_str(identifier);

        Ok(CacheKey {
            full,
            namespace: base.to_owned(),
            embedded_ttl,
        })
    }

    /// Split a namespace into its logical name and embedded TTL.
    pub fn resolve_ttl<'a>(
        &self,
        namespace: &'a str,
    ) -> Result<(&'a str, Option<Duration>), CacheError> {
        let (base, ttl) = match namespace.rsplit_once(self.ttl_separator) {
            Some((base, literal)) => {
                let ttl = parse_duration(literal).ok_or_else(|| {
                    CacheError::InvalidKey(format!(
                        "invalid TTL suffix '{literal}' in namespace '{namespace}'"
                    ))
                })?;
                (base, Some(ttl))
            }
            None => (namespace, None),
        };

        if base.trim().is_empty() {
            return Err(CacheError::InvalidKey(format!(
                "blank namespace '{namespace}'"
            )));
        }
        if base.contains(self.delimiter) || base.contains(self.ttl_separator) {
            return Err(CacheError::InvalidKey(format!(
                "namespace '{base}' contains a reserved separator"
            )));
        }
        Ok((base, ttl))
    }

    /// Key prefix shared by every entry of `namespace`, including the trailing
    /// delimiter.
    pub fn namespace_prefix(&self, namespace: &str) -> Result<String, CacheError> {
        let (base, _) = self.resolve_ttl(namespace)?;
        Ok(self.namespace_prefix_unchecked(base))
    }

    fn namespace_prefix_unchecked(&self, base: &str) -> String {
        let mut out = String::with_capacity(self.prefix.len() + base.len() + 2);
        if !self.prefix.is_empty() {
            out.push_str(&self.prefix);
            out.push(self.delimiter);
        }
        out.push_str(base);
        out.push(self.delimiter);
        out
    }
}

/// Parse `<digits>[s|m|h|d]`; no unit means seconds. Zero and anything above
/// [`MAX_TTL`] are rejected.
fn parse_duration(literal: &str) -> Option<Duration> {
    let literal = literal.trim();
    let split = literal
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(literal.len());
    let (digits, unit) = literal.split_at(split);
    let amount: u64 = digits.parse().ok()?;
    if amount == 0 {
        return None;
    }
    let unit = match unit.to_ascii_lowercase().as_str() {
        "" | "s" => TimeUnit::Seconds,
        "m" => TimeUnit::Minutes,
        "h" => TimeUnit::Hours,
        "d" => TimeUnit::Days,
        _ => return None,
    };
    let ttl = unit.to_duration(amount);
    (ttl <= MAX_TTL).then_some(ttl)
}
