//! Flat row-key lookup
//!
//! One partition per (metric, tier) holds every data-type/tag-set
//! combination; a tier query is a single scan.

use super::{tier_partition, CandidateKind, QueryStatement, RowKeyLookup};
use crate::rowkey::RowKey;
use crate::store::{Deletion, Mutation, ScanRequest, Table};
use crate::{Tags, Timestamp};
use bytes::Bytes;

#[derive(Debug, Clone, Copy, Default)]
pub struct FlatLookup;

impl RowKeyLookup for FlatLookup {
    fn create_insert_statements(&self, key: &RowKey, ttl: Option<u32>) -> Vec<Mutation> {
        let tier = key.tier_timestamp();
        vec![
            Mutation {
                table: Table::RowKeys,
                partition: tier_partition(key.metric(), tier),
                column: key.encoded().clone(),
                value: Bytes::new(),
                ttl,
            },
            Mutation {
                table: Table::RowKeyTimeIndex,
                partition: Bytes::copy_from_slice(key.metric().as_bytes()),
                column: Bytes::copy_from_slice(&tier.to_be_bytes()),
                value: Bytes::new(),
                ttl,
            },
        ]
    }

    fn create_delete_statements(&self, key: &RowKey) -> Vec<Deletion> {
        // The time-index entry stays: other row keys may share the tier
        vec![Deletion {
            table: Table::RowKeys,
            partition: tier_partition(key.metric(), key.tier_timestamp()),
            column: Some(key.encoded().clone()),
        }]
    }

    fn create_query_statements(
        &self,
        metric: &str,
        tier: Timestamp,
        _filter: &Tags,
    ) -> Vec<QueryStatement> {
        vec![QueryStatement {
            scan: ScanRequest::full(Table::RowKeys, tier_partition(metric, tier)),
            candidate: CandidateKind::Flat,
        }]
    }
}
