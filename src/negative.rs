//! Negative-result sentinel and payload encoding
//!
//! Values are stored as JSON. A computation that legitimately yields nothing is
//! stored as the literal `N_V`, which can never be produced by JSON encoding, so a
//! sentinel is always distinguishable from a value (including an empty one).

use std::sync::Arc;

use serde::{Serialize, de::DeserializeOwned};

use crate::CacheError;

/// Reserved payload marking "computed and confirmed absent".
pub const NEGATIVE_SENTINEL: &[u8] = b"N_V";

/// A payload as stored in either tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Value(Arc<Vec<u8>>),
    Negative,
}

impl Payload {
    pub fn encode<V: Serialize>(value: &V) -> Result<Self, CacheError> {
        Ok(Payload::Value(Arc::new(serde_json::to_vec(value)?)))
    }

    /// `None` becomes the negative sentinel.
    pub fn encode_option<V: Serialize>(value: Option<&V>) -> Result<Self, CacheError> {
        match value {
            Some(v) => Self::encode(v),
            None => Ok(Payload::Negative),
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        if bytes == NEGATIVE_SENTINEL {
            Payload::Negative
        } else {
            Payload::Value(Arc::new(bytes))
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Value(bytes) => bytes.as_slice(),
            Payload::Negative => NEGATIVE_SENTINEL,
        }
    }

    pub fn is_negative(&self) -> bool {
        matches!(self, Payload::Negative)
    }

    /// Decode into `V`; the sentinel decodes to `None`.
    pub fn decode<V: DeserializeOwned>(&self) -> Result<Option<V>, CacheError> {
        match self {
            Payload::Value(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
            Payload::Negative => Ok(None),
        }
    }
}
