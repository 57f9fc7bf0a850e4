//! Backing column-family store abstraction
//!
//! The engine only constructs and interprets rows; the wire protocol of
//! the store behind this trait is out of scope. Statements are plain
//! data so the lookup strategies stay pure.

pub mod memory;
pub mod schema;

pub use memory::MemoryStore;
pub use schema::ClusterSchema;

use crate::{QueryOrder, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::future::Future;

/// Logical tables the engine owns in the backing store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Table {
    /// `data_points(key, offset, value)` — partitioned by serialized row
    /// key, TTL-bearing
    DataPoints,
    /// Flat row-key index, partitioned by (metric, tier)
    RowKeys,
    /// Tag-indexed row-key index, partitioned by (metric, tier, tag pair)
    TagIndexedRowKeys,
    /// Tier timestamps known per metric
    RowKeyTimeIndex,
    /// Flat set-membership index (metric names, tag names)
    StringIndex,
    /// Single-row cluster configuration
    Spec,
}

impl Table {
    pub fn name(&self) -> &'static str {
        match self {
            Table::DataPoints => "data_points",
            Table::RowKeys => "row_keys",
            Table::TagIndexedRowKeys => "tag_indexed_row_keys",
            Table::RowKeyTimeIndex => "row_key_time_index",
            Table::StringIndex => "string_index",
            Table::Spec => "spec",
        }
    }
}

/// Consistency level for reads and writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Consistency {
    One,
    #[default]
    Quorum,
    All,
}

/// Identifies one replica of the cluster
pub type ReplicaId = usize;

/// A single column upsert
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub table: Table,
    pub partition: Bytes,
    pub column: Bytes,
    pub value: Bytes,
    /// Time-to-live in seconds
    pub ttl: Option<u32>,
}

/// A column or whole-partition delete
#[derive(Debug, Clone, PartialEq)]
pub struct Deletion {
    pub table: Table,
    pub partition: Bytes,
    /// Delete one column, or the whole partition when `None`
    pub column: Option<Bytes>,
}

/// A range scan over one partition's columns. Bounds are inclusive on
/// both ends; `None` means unbounded.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub table: Table,
    pub partition: Bytes,
    pub start: Option<Bytes>,
    pub end: Option<Bytes>,
    pub order: QueryOrder,
    pub limit: Option<usize>,
}

impl ScanRequest {
    /// Unbounded ascending scan over a partition
    pub fn full(table: Table, partition: Bytes) -> Self {
        Self {
            table,
            partition,
            start: None,
            end: None,
            order: QueryOrder::Ascending,
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// One returned column
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnEntry {
    pub column: Bytes,
    pub value: Bytes,
}

/// The backing store. Futures are `Send` so scans can be spawned onto
/// the runtime behind the query semaphore.
pub trait ColumnStore: Send + Sync + 'static {
    /// Number of replicas a request can be retried against
    fn replica_count(&self) -> usize;

    /// The replica owning a partition, used to co-locate point batches
    fn replica_for(&self, partition: &[u8]) -> ReplicaId;

    /// Whether the store has a logical table. Older stores may lack the
    /// newer ones; callers degrade rather than fail.
    fn has_table(&self, table: Table) -> bool;

    /// Apply a batch of mutations atomically per partition
    fn apply(
        &self,
        mutations: &[Mutation],
        consistency: Consistency,
        replica: ReplicaId,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Apply a batch of deletions
    fn delete(
        &self,
        deletions: &[Deletion],
        consistency: Consistency,
        replica: ReplicaId,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Scan one partition's columns in order
    fn scan(
        &self,
        request: &ScanRequest,
        consistency: Consistency,
        replica: ReplicaId,
    ) -> impl Future<Output = Result<Vec<ColumnEntry>>> + Send;
}
