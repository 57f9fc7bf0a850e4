//! Row-key lookup strategies
//!
//! A lookup strategy builds the insert/delete/query statements that
//! register and retrieve row keys for a (metric, tier). Builders are
//! pure functions over row-key data; all I/O stays with the caller.

mod flat;
mod tag_indexed;

pub use flat::FlatLookup;
pub use tag_indexed::{split_hash_column, TagIndexedLookup};

use crate::rowkey::RowKey;
use crate::store::{Deletion, Mutation, ScanRequest};
use crate::{Tags, Timestamp};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashSet;

/// Tag pair name used for the entry that indexes a row key regardless
/// of its tags. Queried when the filter set is empty.
pub const WILDCARD_PAIR: &str = "*";

/// One candidate scan produced by `create_query_statements`
#[derive(Debug, Clone)]
pub struct QueryStatement {
    pub scan: ScanRequest,
    pub candidate: CandidateKind,
}

/// Which filter tag (if any) a candidate statement serves
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateKind {
    /// The single flat-strategy scan
    Flat,
    /// A tag-indexed scan for one filter tag name
    Tag(String),
    /// The tag-indexed wildcard scan; the selectivity loser on ties
    Wildcard,
}

/// Statement builders shared by both strategies
pub trait RowKeyLookup: Send + Sync {
    /// Statements registering a row key, including its time-index entry
    fn create_insert_statements(&self, key: &RowKey, ttl: Option<u32>) -> Vec<Mutation>;

    /// Statements removing a row key's index entries
    fn create_delete_statements(&self, key: &RowKey) -> Vec<Deletion>;

    /// Candidate scans retrieving the row keys of a (metric, tier) that
    /// may match the tag filter. Tag-indexed results still need
    /// client-side filtering on the remaining tags.
    fn create_query_statements(
        &self,
        metric: &str,
        tier: Timestamp,
        filter: &Tags,
    ) -> Vec<QueryStatement>;
}

/// Hashes derived from a row key's tag set, used only by the
/// tag-indexed strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagSetHash {
    /// crc32 over the full canonical tag string. A tie-breaking sort
    /// key within an index partition, not a correctness input — and the
    /// ordered-hash property the cardinality estimator samples.
    pub collection_hash: u32,
    /// One escaped `name=value` string per tag pair
    pub pairs: Vec<String>,
}

impl TagSetHash {
    pub fn of(tags: &Tags) -> Self {
        let mut canonical = String::new();
        let mut pairs = Vec::with_capacity(tags.len());
        for (name, value) in tags {
            let pair = escape_pair(name, value);
            canonical.push_str(&pair);
            canonical.push(':');
            pairs.push(pair);
        }
        Self {
            collection_hash: crc32fast::hash(canonical.as_bytes()),
            pairs,
        }
    }
}

/// Escape a tag pair into an unambiguous `name=value` string
pub(crate) fn escape_pair(name: &str, value: &str) -> String {
    let mut out = String::with_capacity(name.len() + value.len() + 1);
    escape_part(&mut out, name);
    out.push('=');
    escape_part(&mut out, value);
    out
}

fn escape_part(out: &mut String, part: &str) {
    for c in part.chars() {
        if c == ':' || c == '=' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
}

/// (metric, tier) partition key for the flat index and the time index
pub(crate) fn tier_partition(metric: &str, tier: Timestamp) -> Bytes {
    let mut buf = BytesMut::with_capacity(metric.len() + 9);
    buf.put_slice(metric.as_bytes());
    buf.put_u8(0);
    buf.put_i64(tier);
    buf.freeze()
}

/// Which metrics use the tag-indexed strategy
#[derive(Debug, Clone, Default)]
pub enum TagIndexPolicy {
    /// Flat lookups everywhere
    #[default]
    Disabled,
    /// Tag-indexed lookups for every metric
    All,
    /// Tag-indexed lookups for the named metrics only
    Metrics(HashSet<String>),
}

impl TagIndexPolicy {
    fn applies_to(&self, metric: &str) -> bool {
        match self {
            TagIndexPolicy::Disabled => false,
            TagIndexPolicy::All => true,
            TagIndexPolicy::Metrics(metrics) => metrics.contains(metric),
        }
    }
}

/// Closed strategy variant, chosen once per metric at configuration
/// time
#[derive(Debug, Clone, Copy)]
pub enum LookupStrategy {
    Flat(FlatLookup),
    TagIndexed(TagIndexedLookup),
}

impl RowKeyLookup for LookupStrategy {
    fn create_insert_statements(&self, key: &RowKey, ttl: Option<u32>) -> Vec<Mutation> {
        match self {
            LookupStrategy::Flat(l) => l.create_insert_statements(key, ttl),
            LookupStrategy::TagIndexed(l) => l.create_insert_statements(key, ttl),
        }
    }

    fn create_delete_statements(&self, key: &RowKey) -> Vec<Deletion> {
        match self {
            LookupStrategy::Flat(l) => l.create_delete_statements(key),
            LookupStrategy::TagIndexed(l) => l.create_delete_statements(key),
        }
    }

    fn create_query_statements(
        &self,
        metric: &str,
        tier: Timestamp,
        filter: &Tags,
    ) -> Vec<QueryStatement> {
        match self {
            LookupStrategy::Flat(l) => l.create_query_statements(metric, tier, filter),
            LookupStrategy::TagIndexed(l) => l.create_query_statements(metric, tier, filter),
        }
    }
}

/// Picks the lookup strategy for a metric from the configured policy,
/// forced to flat when the store lacks the tag-indexed table
pub struct LookupSelector {
    policy: TagIndexPolicy,
    tag_index_available: bool,
}

impl LookupSelector {
    pub fn new(policy: TagIndexPolicy, tag_index_available: bool) -> Self {
        Self {
            policy,
            tag_index_available,
        }
    }

    pub fn for_metric(&self, metric: &str) -> LookupStrategy {
        if self.tag_index_available && self.policy.applies_to(metric) {
            LookupStrategy::TagIndexed(TagIndexedLookup)
        } else {
            LookupStrategy::Flat(FlatLookup)
        }
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
    fn test_tag_set_hash_is_stable_and_order_free() {
        let a = TagSetHash::of(&tags(&[("host", "a"), ("dc", "east")]));
        let b = TagSetHash::of(&tags(&[("dc", "east"), ("host", "a")]));
        assert_eq!(a, b);
        assert_eq!(a.pairs, vec!["dc=east".to_string(), "host=a".to_string()]);

        let c = TagSetHash::of(&tags(&[("host", "b")]));
        assert_ne!(a.collection_hash, c.collection_hash);
    }

    #[test]
    fn test_escape_pair() {
        assert_eq!(escape_pair("a:b", "c=d"), "a\\:b=c\\=d");
        assert_eq!(escape_pair("x", "y"), "x=y");
    }

    #[test]
    fn test_selector_honors_policy_and_capability() {
        let selector = LookupSelector::new(TagIndexPolicy::All, true);
        assert!(matches!(
            selector.for_metric("cpu"),
            LookupStrategy::TagIndexed(_)
        ));

        let selector = LookupSelector::new(TagIndexPolicy::All, false);
        assert!(matches!(selector.for_metric("cpu"), LookupStrategy::Flat(_)));

        let mut metrics = HashSet::new();
        metrics.insert("cpu".to_string());
        let selector = LookupSelector::new(TagIndexPolicy::Metrics(metrics), true);
        assert!(matches!(
            selector.for_metric("cpu"),
            LookupStrategy::TagIndexed(_)
        ));
        assert!(matches!(selector.for_metric("mem"), LookupStrategy::Flat(_)));
    }
}
