//! Row-key identity and codec
//!
//! A row key addresses one wide row of columns in the backing store:
//! (metric, tier timestamp, data type, sorted tag set).

pub mod codec;
mod spec;

pub use spec::{RowSpec, TimeUnit};

use crate::{Tags, Timestamp};
use bytes::Bytes;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

/// Sentinel data type for rows written by pre-upgrade clusters. Encoded
/// without a data-type section so old rows stay byte-identical.
pub const LEGACY_DATA_TYPE: &str = "legacy";

/// Composite identity of one wide row
#[derive(Debug, Clone)]
pub struct RowKey {
    metric: String,
    tier_timestamp: Timestamp,
    data_type: String,
    tags: Tags,
    /// Serialized form, computed once on first use. Every write and
    /// query touching this key reuses it; never a second source of
    /// truth.
    encoded: OnceLock<Bytes>,
}

impl RowKey {
    /// Create a row key. Tags are kept in lexicographic key order by the
    /// `BTreeMap`, which the byte layout depends on.
    pub fn new(
        metric: impl Into<String>,
        tier_timestamp: Timestamp,
        data_type: impl Into<String>,
        tags: Tags,
    ) -> Self {
        Self {
            metric: metric.into(),
            tier_timestamp,
            data_type: data_type.into(),
            tags,
            encoded: OnceLock::new(),
        }
    }

    /// Create a row key with the legacy sentinel data type
    pub fn legacy(metric: impl Into<String>, tier_timestamp: Timestamp, tags: Tags) -> Self {
        Self::new(metric, tier_timestamp, LEGACY_DATA_TYPE, tags)
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    pub fn tier_timestamp(&self) -> Timestamp {
        self.tier_timestamp
    }

    pub fn data_type(&self) -> &str {
        &self.data_type
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    /// The serialized byte form, computed lazily and cached
    pub fn encoded(&self) -> &Bytes {
        self.encoded.get_or_init(|| codec::encode(self))
    }

    /// Whether this row's columns use the legacy value format
    pub fn is_legacy(&self) -> bool {
        self.data_type == LEGACY_DATA_TYPE
    }
}

// Equality and hashing cover the identity fields only; the cached
// encoding is derived state.
impl PartialEq for RowKey {
    fn eq(&self, other: &Self) -> bool {
        self.metric == other.metric
            && self.tier_timestamp == other.tier_timestamp
            && self.data_type == other.data_type
            && self.tags == other.tags
    }
}

impl Eq for RowKey {}

impl Hash for RowKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.metric.hash(state);
        self.tier_timestamp.hash(state);
        self.data_type.hash(state);
        self.tags.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_encoded_is_cached_and_ignored_by_eq() {
        let a = RowKey::new("cpu", 1000, "long", tags(&[("host", "a")]));
        let b = RowKey::new("cpu", 1000, "long", tags(&[("host", "a")]));
        assert_eq!(a, b);

        // Force one side's cache; equality and hashing are unaffected
        let encoded = a.encoded().clone();
        assert_eq!(a, b);
        assert_eq!(a.encoded(), &encoded);

        let cloned = a.clone();
        assert_eq!(cloned.encoded(), &encoded);
    }

    #[test]
    fn test_legacy_constructor() {
        let key = RowKey::legacy("cpu", 0, Tags::new());
        assert!(key.is_legacy());
        assert_eq!(key.data_type(), LEGACY_DATA_TYPE);
    }
}
