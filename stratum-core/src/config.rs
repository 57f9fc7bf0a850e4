//! Default configuration values and the datastore configuration struct

use crate::lookup::TagIndexPolicy;
use crate::rowkey::RowSpec;
use crate::store::Consistency;
use std::path::PathBuf;
use std::time::Duration;

/// Legacy row width: three weeks of milliseconds
pub const LEGACY_ROW_WIDTH_MS: i64 = 1_814_400_000;

/// Row-key dedup cache capacity
pub const ROW_KEY_CACHE_SIZE: usize = 50_000;

/// Metric/tag-name dedup cache capacity
pub const STRING_CACHE_SIZE: usize = 5_000;

/// Smallest sub-batch the splitter will attempt before abandoning the
/// remainder to the replay log
pub const MIN_BATCH_SIZE: usize = 10;

/// Retries per logical store request on transient failures
pub const MAX_RETRIES: usize = 2;

/// Linear backoff step between retry attempts
pub const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Concurrent row scans per query executor
pub const SIMULTANEOUS_QUERIES: usize = 20;

/// Hard ceiling on points counted by a single query
pub const QUERY_POINT_LIMIT: u64 = 10_000_000;

/// Ingestion worker tasks
pub const INGEST_WORKERS: usize = 4;

/// Queued ingestion batches before submitters block
pub const INGEST_QUEUE_DEPTH: usize = 64;

/// Datastore configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Row layout written back when the cluster has no spec row yet
    pub default_spec: RowSpec,
    /// Which metrics use tag-indexed row-key lookups
    pub tag_index: TagIndexPolicy,
    /// Consistency level for writes
    pub write_consistency: Consistency,
    /// Consistency level for reads
    pub read_consistency: Consistency,
    /// TTL applied to points that carry none
    pub default_ttl: Option<u32>,
    /// Row-key dedup cache capacity
    pub row_key_cache_size: usize,
    /// Metric/tag-name dedup cache capacity
    pub string_cache_size: usize,
    /// Batch-splitting floor
    pub min_batch_size: usize,
    /// Directory for the abandoned-batch replay log; `None` disables it
    pub replay_dir: Option<PathBuf>,
    /// Retries per logical store request
    pub max_retries: usize,
    /// Backoff step between retry attempts
    pub retry_backoff: Duration,
    /// Concurrent row scans per query
    pub simultaneous_queries: usize,
    /// Hard per-query point ceiling
    pub query_point_limit: u64,
    /// Ingestion worker tasks
    pub ingest_workers: usize,
    /// Queued ingestion batches before submitters block
    pub ingest_queue_depth: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            default_spec: RowSpec::legacy_default(),
            tag_index: TagIndexPolicy::default(),
            write_consistency: Consistency::Quorum,
            read_consistency: Consistency::Quorum,
            default_ttl: None,
            row_key_cache_size: ROW_KEY_CACHE_SIZE,
            string_cache_size: STRING_CACHE_SIZE,
            min_batch_size: MIN_BATCH_SIZE,
            replay_dir: None,
            max_retries: MAX_RETRIES,
            retry_backoff: RETRY_BACKOFF,
            simultaneous_queries: SIMULTANEOUS_QUERIES,
            query_point_limit: QUERY_POINT_LIMIT,
            ingest_workers: INGEST_WORKERS,
            ingest_queue_depth: INGEST_QUEUE_DEPTH,
        }
    }
}
