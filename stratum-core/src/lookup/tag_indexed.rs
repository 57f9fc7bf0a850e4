//! Tag-indexed row-key lookup
//!
//! Each row key gets one index entry per tag pair plus a wildcard
//! entry, partitioned by (metric, tier, tag pair). Columns are prefixed
//! with the 4-byte big-endian tag-collection hash so a partition's
//! columns sort by hash — the property the cardinality estimator
//! samples. A query with N filter tags yields N candidate statements;
//! the caller scans the most selective one and checks the remaining
//! tags client-side.

use super::{
    escape_pair, tier_partition, CandidateKind, QueryStatement, RowKeyLookup, TagSetHash,
    WILDCARD_PAIR,
};
use crate::rowkey::RowKey;
use crate::store::{Deletion, Mutation, ScanRequest, Table};
use crate::{Tags, Timestamp};
use bytes::{BufMut, Bytes, BytesMut};

#[derive(Debug, Clone, Copy, Default)]
pub struct TagIndexedLookup;

/// (metric, tier, tag pair) partition key
fn pair_partition(metric: &str, tier: Timestamp, pair: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(metric.len() + pair.len() + 10);
    buf.put_slice(metric.as_bytes());
    buf.put_u8(0);
    buf.put_i64(tier);
    buf.put_u8(0);
    buf.put_slice(pair.as_bytes());
    buf.freeze()
}

/// Hash-prefixed column for one index entry
fn hash_column(collection_hash: u32, key: &RowKey) -> Bytes {
    let encoded = key.encoded();
    let mut buf = BytesMut::with_capacity(4 + encoded.len());
    buf.put_u32(collection_hash);
    buf.put_slice(encoded);
    buf.freeze()
}

impl TagIndexedLookup {
    fn entry_partitions(key: &RowKey) -> (TagSetHash, Vec<Bytes>) {
        let hash = TagSetHash::of(key.tags());
        let mut partitions = Vec::with_capacity(hash.pairs.len() + 1);
        partitions.push(pair_partition(
            key.metric(),
            key.tier_timestamp(),
            WILDCARD_PAIR,
        ));
        for pair in &hash.pairs {
            partitions.push(pair_partition(key.metric(), key.tier_timestamp(), pair));
        }
        (hash, partitions)
    }
}

impl RowKeyLookup for TagIndexedLookup {
    fn create_insert_statements(&self, key: &RowKey, ttl: Option<u32>) -> Vec<Mutation> {
        let (hash, partitions) = Self::entry_partitions(key);
        let column = hash_column(hash.collection_hash, key);

        let mut mutations: Vec<Mutation> = partitions
            .into_iter()
            .map(|partition| Mutation {
                table: Table::TagIndexedRowKeys,
                partition,
                column: column.clone(),
                value: Bytes::new(),
                ttl,
            })
            .collect();

        mutations.push(Mutation {
            table: Table::RowKeyTimeIndex,
            partition: Bytes::copy_from_slice(key.metric().as_bytes()),
            column: Bytes::copy_from_slice(&key.tier_timestamp().to_be_bytes()),
            value: Bytes::new(),
            ttl,
        });
        mutations
    }

    fn create_delete_statements(&self, key: &RowKey) -> Vec<Deletion> {
        let (hash, partitions) = Self::entry_partitions(key);
        let column = hash_column(hash.collection_hash, key);

        partitions
            .into_iter()
            .map(|partition| Deletion {
                table: Table::TagIndexedRowKeys,
                partition,
                column: Some(column.clone()),
            })
            .collect()
    }

    fn create_query_statements(
        &self,
        metric: &str,
        tier: Timestamp,
        filter: &Tags,
    ) -> Vec<QueryStatement> {
        if filter.is_empty() {
            return vec![QueryStatement {
                scan: ScanRequest::full(
                    Table::TagIndexedRowKeys,
                    pair_partition(metric, tier, WILDCARD_PAIR),
                ),
                candidate: CandidateKind::Wildcard,
            }];
        }

        filter
            .iter()
            .map(|(name, value)| QueryStatement {
                scan: ScanRequest::full(
                    Table::TagIndexedRowKeys,
                    pair_partition(metric, tier, &escape_pair(name, value)),
                ),
                candidate: CandidateKind::Tag(name.clone()),
            })
            .collect()
    }
}

/// Strip the 4-byte collection-hash prefix from an index column,
/// returning (hash, encoded row key)
pub fn split_hash_column(column: &[u8]) -> Option<(u32, &[u8])> {
    if column.len() < 4 {
        return None;
    }
    let hash = u32::from_be_bytes(column[..4].try_into().unwrap());
    Some((hash, &column[4..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rowkey::codec;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_insert_emits_wildcard_pairs_and_time_index() {
        let key = RowKey::new("cpu", 0, "long", tags(&[("dc", "east"), ("host", "a")]));
        let muts = TagIndexedLookup.create_insert_statements(&key, None);

        // wildcard + two pairs + time index
        assert_eq!(muts.len(), 4);
        assert_eq!(muts[0].partition, pair_partition("cpu", 0, "*"));
        assert_eq!(muts[1].partition, pair_partition("cpu", 0, "dc=east"));
        assert_eq!(muts[2].partition, pair_partition("cpu", 0, "host=a"));
        assert_eq!(muts[3].table, Table::RowKeyTimeIndex);

        // every index column decodes back to the row key
        for m in &muts[..3] {
            let (hash, encoded) = split_hash_column(&m.column).unwrap();
            assert_eq!(hash, TagSetHash::of(key.tags()).collection_hash);
            assert_eq!(codec::decode(encoded).unwrap(), key);
        }
    }

    #[test]
    fn test_query_one_candidate_per_filter_tag() {
        let filter = tags(&[("dc", "east"), ("host", "a")]);
        let stmts = TagIndexedLookup.create_query_statements("cpu", 0, &filter);

        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0].candidate, CandidateKind::Tag("dc".to_string()));
        assert_eq!(stmts[0].scan.partition, pair_partition("cpu", 0, "dc=east"));
        assert_eq!(stmts[1].candidate, CandidateKind::Tag("host".to_string()));
    }

    #[test]
    fn test_empty_filter_queries_the_wildcard_entry() {
        let stmts = TagIndexedLookup.create_query_statements("cpu", 0, &Tags::new());
        assert_eq!(stmts.len(), 1);
        assert_eq!(stmts[0].candidate, CandidateKind::Wildcard);
        assert_eq!(stmts[0].scan.partition, pair_partition("cpu", 0, "*"));
    }

    #[test]
    fn test_delete_mirrors_insert_entries() {
        let key = RowKey::new("cpu", 0, "long", tags(&[("host", "a")]));
        let dels = TagIndexedLookup.create_delete_statements(&key);
        let muts = TagIndexedLookup.create_insert_statements(&key, None);
        // every index entry (not the time index) has a matching delete
        assert_eq!(dels.len(), muts.len() - 1);
        for (d, m) in dels.iter().zip(&muts) {
            assert_eq!(d.partition, m.partition);
            assert_eq!(d.column.as_ref(), Some(&m.column));
        }
    }
}
