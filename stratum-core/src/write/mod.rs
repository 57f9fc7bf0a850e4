//! Write-batching pipeline
//!
//! Groups incoming points into per-replica sub-batches, consults the
//! dedup caches before emitting index mutations, and submits everything
//! with tracked statistics, bounded retry and batch splitting.

mod batch;
mod replay;

pub use batch::{BatchBuilder, BatchParts};
pub use replay::ReplayLog;

use crate::cache::DedupCache;
use crate::config::StoreConfig;
use crate::lookup::{LookupSelector, RowKeyLookup};
use crate::retry::RetryPolicy;
use crate::rowkey::{RowKey, RowSpec};
use crate::store::{ColumnStore, Consistency, Mutation, ReplicaId, Table};
use crate::value::PointFactoryRegistry;
use crate::{PointEvent, Result, StratumError};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// String-index partition for known metric names
pub(crate) const METRIC_NAMES: &[u8] = b"metric_names";
/// String-index partition for known tag names
pub(crate) const TAG_NAMES: &[u8] = b"tag_names";

/// Sink for row-key-created notifications, consumed by unrelated
/// subsystems (e.g. caches elsewhere)
pub trait RowKeyListener: Send + Sync {
    fn row_key_created(&self, key: &RowKey);
}

#[derive(Default)]
struct Counters {
    points_written: AtomicU64,
    row_keys_written: AtomicU64,
    string_entries_written: AtomicU64,
    batches_submitted: AtomicU64,
    batch_splits: AtomicU64,
    mutations_dropped: AtomicU64,
}

/// Point-in-time view of the pipeline counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub points_written: u64,
    pub row_keys_written: u64,
    pub string_entries_written: u64,
    pub batches_submitted: u64,
    pub batch_splits: u64,
    pub mutations_dropped: u64,
    pub row_key_dedup_hits: u64,
    pub string_dedup_hits: u64,
}

/// The write path. Batch builders are call-local; the dedup caches are
/// the only state shared across workers, and every touch of them is a
/// single atomic check-and-insert.
pub struct WriteBatchPipeline<S> {
    store: Arc<S>,
    spec: RowSpec,
    selector: Arc<LookupSelector>,
    factories: Arc<PointFactoryRegistry>,
    retry: RetryPolicy,
    row_key_cache: DedupCache<RowKey>,
    string_cache: DedupCache<String>,
    listeners: Vec<Arc<dyn RowKeyListener>>,
    replay: Option<ReplayLog>,
    write_consistency: Consistency,
    default_ttl: Option<u32>,
    min_batch_size: usize,
    counters: Counters,
}

impl<S: ColumnStore> WriteBatchPipeline<S> {
    pub fn new(
        store: Arc<S>,
        spec: RowSpec,
        selector: Arc<LookupSelector>,
        factories: Arc<PointFactoryRegistry>,
        retry: RetryPolicy,
        config: &StoreConfig,
    ) -> Result<Self> {
        let replay = match &config.replay_dir {
            Some(dir) => Some(ReplayLog::open(dir)?),
            None => None,
        };
        Ok(Self {
            store,
            spec,
            selector,
            factories,
            retry,
            row_key_cache: DedupCache::new(config.row_key_cache_size),
            string_cache: DedupCache::new(config.string_cache_size),
            listeners: Vec::new(),
            replay,
            write_consistency: config.write_consistency,
            default_ttl: config.default_ttl,
            min_batch_size: config.min_batch_size,
            counters: Counters::default(),
        })
    }

    /// Register a row-key-created listener
    pub fn add_listener(&mut self, listener: Arc<dyn RowKeyListener>) {
        self.listeners.push(listener);
    }

    /// Drop a row key from the dedup cache so a later write registers
    /// its index entries again. Called after the key's rows are deleted.
    pub fn forget_row_key(&self, key: &RowKey) {
        self.row_key_cache.remove(key);
    }

    /// Submit one ingestion batch. Index mutations for unseen row keys
    /// and names go first; every point's column mutation always goes.
    pub async fn submit(&self, points: &[PointEvent]) -> Result<()> {
        let mut batch = BatchBuilder::new();
        for point in points {
            self.stage_point(&mut batch, point)?;
        }
        if batch.is_empty() {
            return Ok(());
        }
        self.submit_batch(batch).await
    }

    fn stage_point(&self, batch: &mut BatchBuilder, point: &PointEvent) -> Result<()> {
        let data_type = self.factories.data_type_for(&point.value, self.spec.legacy);
        let tier = self.spec.tier_timestamp(point.timestamp);
        let row_key = RowKey::new(&point.metric, tier, data_type, point.tags.clone());

        let ttl = point.ttl.or(self.default_ttl);
        // The index entry must outlive every point it indexes
        let row_key_ttl = ttl.map(|t| {
            t.saturating_add(self.spec.time_unit.to_seconds(self.spec.row_width).min(u32::MAX as i64) as u32)
        });

        if !self.row_key_cache.check_and_insert(&row_key) {
            let lookup = self.selector.for_metric(&point.metric);
            let mutations = lookup.create_insert_statements(&row_key, row_key_ttl);
            batch.add_row_key(row_key.clone(), mutations);
        }

        self.stage_string(batch, METRIC_NAMES, &point.metric);
        for tag_name in point.tags.keys() {
            self.stage_string(batch, TAG_NAMES, tag_name);
        }

        let (value, double_bit) = self.factories.encode(data_type, &point.value)?;
        let offset = self
            .spec
            .column_offset(tier, point.timestamp, double_bit);
        let partition = row_key.encoded().clone();
        let replica = self.store.replica_for(&partition);
        batch.add_point(
            replica,
            Mutation {
                table: Table::DataPoints,
                partition,
                column: Bytes::copy_from_slice(&offset.to_be_bytes()),
                value: Bytes::from(value),
                ttl,
            },
        );
        Ok(())
    }

    fn stage_string(&self, batch: &mut BatchBuilder, index: &'static [u8], name: &str) {
        let dedup_key = format!("{}\0{}", String::from_utf8_lossy(index), name);
        if !self.string_cache.check_and_insert(&dedup_key) {
            batch.add_string(
                dedup_key,
                Mutation {
                    table: Table::StringIndex,
                    partition: Bytes::from_static(index),
                    column: Bytes::copy_from_slice(name.as_bytes()),
                    value: Bytes::new(),
                    ttl: None,
                },
            );
        }
    }

    async fn submit_batch(&self, batch: BatchBuilder) -> Result<()> {
        let points = batch.point_count() as u64;
        let row_keys = batch.row_key_count() as u64;
        let strings = batch.string_count() as u64;
        let parts = batch.into_parts();

        // Index entries go first so a row key is never registered after
        // its points become visible
        if !parts.row_key_mutations.is_empty() {
            if let Err(error) = self.apply_split(&parts.row_key_mutations, 0).await {
                // Roll back so the cache never claims an un-issued insert
                for key in &parts.pending_row_keys {
                    self.row_key_cache.remove(key);
                }
                for name in &parts.pending_strings {
                    self.string_cache.remove(name);
                }
                return Err(error);
            }
            for key in &parts.pending_row_keys {
                for listener in &self.listeners {
                    listener.row_key_created(key);
                }
            }
        }

        if !parts.string_mutations.is_empty() {
            if let Err(error) = self.apply_split(&parts.string_mutations, 0).await {
                for name in &parts.pending_strings {
                    self.string_cache.remove(name);
                }
                return Err(error);
            }
        }

        for (replica, mutations) in &parts.point_mutations {
            self.apply_split(mutations, *replica).await?;
        }

        self.counters.points_written.fetch_add(points, Ordering::Relaxed);
        self.counters.row_keys_written.fetch_add(row_keys, Ordering::Relaxed);
        self.counters
            .string_entries_written
            .fetch_add(strings, Ordering::Relaxed);
        self.counters.batches_submitted.fetch_add(1, Ordering::Relaxed);
        debug!(points, row_keys, strings, "submitted ingestion batch");
        Ok(())
    }

    /// Apply a sub-batch, splitting it on `BatchTooLarge`: each
    /// consecutive rejection divides the chunk size by an increasing
    /// divisor, down to a floor below which the remainder is logged for
    /// replay and dropped. Transient errors propagate (after the retry
    /// ceiling) so callers can apply backpressure.
    async fn apply_split(&self, mutations: &[Mutation], replica: ReplicaId) -> Result<()> {
        let mut pending = mutations;
        let mut chunk_size = mutations.len();
        let mut divisor = 2;

        while !pending.is_empty() {
            let take = chunk_size.min(pending.len());
            let chunk = &pending[..take];
            let result = self
                .retry
                .execute(self.store.replica_count(), replica, |r| {
                    self.store.apply(chunk, self.write_consistency, r)
                })
                .await;

            match result {
                Ok(()) => {
                    pending = &pending[take..];
                }
                Err(StratumError::BatchTooLarge { size }) => {
                    self.counters.batch_splits.fetch_add(1, Ordering::Relaxed);
                    let smaller = chunk_size / divisor;
                    divisor += 1;
                    if smaller < self.min_batch_size {
                        warn!(
                            rejected = size,
                            remaining = pending.len(),
                            "batch would shrink below the floor; abandoning remainder"
                        );
                        if let Some(replay) = &self.replay {
                            replay.append(pending)?;
                        }
                        self.counters
                            .mutations_dropped
                            .fetch_add(pending.len() as u64, Ordering::Relaxed);
                        return Ok(());
                    }
                    debug!(from = chunk_size, to = smaller, "splitting rejected batch");
                    chunk_size = smaller;
                }
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }

    /// Current pipeline counters
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            points_written: self.counters.points_written.load(Ordering::Relaxed),
            row_keys_written: self.counters.row_keys_written.load(Ordering::Relaxed),
            string_entries_written: self.counters.string_entries_written.load(Ordering::Relaxed),
            batches_submitted: self.counters.batches_submitted.load(Ordering::Relaxed),
            batch_splits: self.counters.batch_splits.load(Ordering::Relaxed),
            mutations_dropped: self.counters.mutations_dropped.load(Ordering::Relaxed),
            row_key_dedup_hits: self.row_key_cache.hits(),
            string_dedup_hits: self.string_cache.hits(),
        }
    }
}

/// Fixed pool of ingestion workers. Each worker owns one in-flight
/// batch at a time; the bounded queue is the backpressure boundary.
pub struct IngestPool {
    sender: mpsc::Sender<Vec<PointEvent>>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl IngestPool {
    pub fn spawn<S: ColumnStore>(
        pipeline: Arc<WriteBatchPipeline<S>>,
        workers: usize,
        queue_depth: usize,
    ) -> Self {
        let (sender, receiver) = mpsc::channel::<Vec<PointEvent>>(queue_depth.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let workers = (0..workers.max(1))
            .map(|worker| {
                let pipeline = pipeline.clone();
                let receiver = receiver.clone();
                tokio::spawn(async move {
                    loop {
                        let points = { receiver.lock().await.recv().await };
                        let Some(points) = points else { break };
                        if let Err(error) = pipeline.submit(&points).await {
                            warn!(worker, %error, "ingestion batch failed");
                        }
                    }
                })
            })
            .collect();

        Self { sender, workers }
    }

    /// Queue a batch, waiting when every worker is busy
    pub async fn submit(&self, points: Vec<PointEvent>) -> Result<()> {
        self.sender
            .send(points)
            .await
            .map_err(|_| StratumError::Unavailable("ingest pool shut down".to_string()))
    }

    /// Close the queue and wait for the workers to drain it
    pub async fn shutdown(self) {
        drop(self.sender);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::TagIndexPolicy;
    use crate::rowkey::TimeUnit;
    use crate::store::MemoryStore;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn pipeline(store: Arc<MemoryStore>, config: &StoreConfig) -> WriteBatchPipeline<MemoryStore> {
        let spec = RowSpec::new(1000, TimeUnit::Milliseconds, false).unwrap();
        WriteBatchPipeline::new(
            store,
            spec,
            Arc::new(LookupSelector::new(TagIndexPolicy::Disabled, true)),
            Arc::new(PointFactoryRegistry::default()),
            RetryPolicy::new(1).with_backoff(Duration::ZERO),
            config,
        )
        .unwrap()
    }

    fn point(metric: &str, ts: i64, value: i64) -> PointEvent {
        PointEvent::new(metric, ts, value).with_tag("host", "a")
    }

    #[tokio::test]
    async fn test_submit_writes_points_and_indexes_once() {
        let store = Arc::new(MemoryStore::new());
        let p = pipeline(store.clone(), &StoreConfig::default());

        p.submit(&[point("cpu", 1, 10), point("cpu", 2, 20)]).await.unwrap();

        let stats = p.stats();
        assert_eq!(stats.points_written, 2);
        assert_eq!(stats.row_keys_written, 1);
        // metric name + tag name
        assert_eq!(stats.string_entries_written, 2);
        assert_eq!(store.column_count(Table::DataPoints), 2);
        assert_eq!(store.column_count(Table::RowKeys), 1);
        assert_eq!(store.column_count(Table::RowKeyTimeIndex), 1);
        assert_eq!(store.column_count(Table::StringIndex), 2);

        // Second submission of the same point: dedup hit, no new index
        p.submit(&[point("cpu", 1, 10)]).await.unwrap();
        let stats = p.stats();
        assert_eq!(stats.row_keys_written, 1);
        assert_eq!(stats.row_key_dedup_hits, 1);
    }

    #[tokio::test]
    async fn test_split_sizes_shrink_by_increasing_divisor() {
        let store = Arc::new(MemoryStore::new().with_batch_limit(4));
        let mut config = StoreConfig::default();
        config.min_batch_size = 1;
        let p = pipeline(store.clone(), &config);

        // 24 distinct points in one row: one 24-mutation point sub-batch
        let points: Vec<PointEvent> =
            (0..24).map(|i| point("cpu", i, i)).collect();
        p.submit(&points).await.unwrap();

        // The point sub-batch is attempted at 24, then 24/2=12, then
        // 12/3=4 which fits; index sub-batches were small enough
        let sizes = store.apply_batch_sizes();
        assert!(sizes.windows(3).any(|w| w == [24, 12, 4]));
        assert_eq!(p.stats().batch_splits, 2);
        assert_eq!(store.column_count(Table::DataPoints), 24);
    }

    #[tokio::test]
    async fn test_floor_abandons_to_replay_log() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new().with_batch_limit(0));
        let mut config = StoreConfig::default();
        config.min_batch_size = 8;
        config.replay_dir = Some(dir.path().to_path_buf());
        let p = pipeline(store.clone(), &config);

        p.submit(&[point("cpu", 1, 10)]).await.unwrap();
        assert!(p.stats().mutations_dropped > 0);
        assert_eq!(store.column_count(Table::DataPoints), 0);

        let log = ReplayLog::open(dir.path()).unwrap();
        assert!(!log.read_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_rolls_back_dedup_entries() {
        let store = Arc::new(MemoryStore::new());
        let p = pipeline(store.clone(), &StoreConfig::default());

        // Exhaust the retry ceiling (1 retry => 2 attempts)
        store.inject_fault(StratumError::Timeout("t".into()));
        store.inject_fault(StratumError::Timeout("t".into()));
        assert!(p.submit(&[point("cpu", 1, 10)]).await.is_err());

        // The row key was rolled back: resubmitting registers it
        p.submit(&[point("cpu", 1, 10)]).await.unwrap();
        assert_eq!(p.stats().row_keys_written, 1);
        assert_eq!(p.stats().row_key_dedup_hits, 0);
        assert_eq!(store.column_count(Table::RowKeys), 1);
    }

    #[tokio::test]
    async fn test_listener_notified_once_per_row_key() {
        struct Recorder(Mutex<Vec<String>>);
        impl RowKeyListener for Recorder {
            fn row_key_created(&self, key: &RowKey) {
                self.0.lock().push(key.metric().to_string());
            }
        }

        let store = Arc::new(MemoryStore::new());
        let mut p = pipeline(store, &StoreConfig::default());
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        p.add_listener(recorder.clone());

        p.submit(&[point("cpu", 1, 10), point("cpu", 2, 20), point("mem", 1, 5)])
            .await
            .unwrap();
        let mut seen = recorder.0.lock().clone();
        seen.sort();
        assert_eq!(seen, vec!["cpu".to_string(), "mem".to_string()]);
    }

    #[tokio::test]
    async fn test_ingest_pool_drains_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let p = Arc::new(pipeline(store.clone(), &StoreConfig::default()));
        let pool = IngestPool::spawn(p.clone(), 2, 4);

        for i in 0..8 {
            pool.submit(vec![point("cpu", i, i)]).await.unwrap();
        }
        pool.shutdown().await;
        assert_eq!(p.stats().points_written, 8);
    }
}
