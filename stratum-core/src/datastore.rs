//! Datastore facade
//!
//! Wires the schema bootstrap, write pipeline, lookup strategies,
//! cardinality estimator and query executor into one entry point. Query
//! planning happens here: find the tiers a range touches, run the
//! per-metric strategy's candidate scans, pick the most selective
//! candidate, filter the remaining tags client-side, then hand the row
//! keys to the executor.

use crate::cardinality::{estimate, most_selective, DEFAULT_SAMPLE_SIZE};
use crate::config::StoreConfig;
use crate::lookup::{split_hash_column, CandidateKind, LookupSelector, RowKeyLookup};
use crate::query::{ChannelCallback, QueryCallback, QueryEvent, QueryExecutor};
use crate::retry::{RetryPolicy, RetryStatsSnapshot};
use crate::rowkey::{codec, RowKey, RowSpec};
use crate::store::{
    schema, ColumnEntry, ColumnStore, Consistency, Deletion, ScanRequest, Table,
};
use crate::value::PointFactoryRegistry;
use crate::write::{self, PipelineStats, RowKeyListener, WriteBatchPipeline};
use crate::{PointEvent, QueryOrder, Result, Tags, TimeRange, Timestamp};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// One metric query
#[derive(Debug, Clone)]
pub struct MetricQuery {
    pub metric: String,
    /// Tags a matching row key must carry. Row keys may carry more.
    pub filter: Tags,
    pub range: TimeRange,
    pub order: QueryOrder,
    /// Per-row point cap, passed through to the row scans
    pub limit: Option<usize>,
}

impl MetricQuery {
    pub fn new(metric: impl Into<String>, range: TimeRange) -> Self {
        Self {
            metric: metric.into(),
            filter: Tags::new(),
            range,
            order: QueryOrder::Ascending,
            limit: None,
        }
    }

    pub fn with_tag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.filter.insert(name.into(), value.into());
        self
    }

    pub fn with_order(mut self, order: QueryOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Aggregate datastore statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct DatastoreStats {
    pub write: PipelineStats,
    pub retries: RetryStatsSnapshot,
}

/// The storage engine entry point
pub struct Datastore<S> {
    store: Arc<S>,
    spec: RowSpec,
    selector: Arc<LookupSelector>,
    pipeline: WriteBatchPipeline<S>,
    executor: QueryExecutor<S>,
    retry: RetryPolicy,
    read_consistency: Consistency,
    write_consistency: Consistency,
    sample_size: usize,
}

impl<S: ColumnStore> Datastore<S> {
    /// Open a datastore over a backing store: load or initialize the
    /// cluster spec row, probe table capabilities, and build the write
    /// and read paths.
    pub async fn open(store: Arc<S>, config: StoreConfig) -> Result<Self> {
        let schema =
            schema::load_or_init(&*store, config.default_spec, config.write_consistency).await?;
        let selector = Arc::new(LookupSelector::new(
            config.tag_index.clone(),
            schema.tag_index_available,
        ));
        let factories = Arc::new(PointFactoryRegistry::default());
        let retry = RetryPolicy::new(config.max_retries).with_backoff(config.retry_backoff);

        let pipeline = WriteBatchPipeline::new(
            store.clone(),
            schema.spec,
            selector.clone(),
            factories.clone(),
            retry.clone(),
            &config,
        )?;
        let executor = QueryExecutor::new(
            store.clone(),
            schema.spec,
            factories,
            retry.clone(),
            config.simultaneous_queries,
            config.read_consistency,
            config.query_point_limit,
        );

        info!(
            row_width = schema.spec.row_width,
            legacy = schema.spec.legacy,
            tag_index = schema.tag_index_available,
            "datastore opened"
        );
        Ok(Self {
            store,
            spec: schema.spec,
            selector,
            pipeline,
            executor,
            retry,
            read_consistency: config.read_consistency,
            write_consistency: config.write_consistency,
            sample_size: DEFAULT_SAMPLE_SIZE,
        })
    }

    /// The cluster's row layout
    pub fn spec(&self) -> RowSpec {
        self.spec
    }

    /// Register a row-key-created listener. Must be called before the
    /// datastore is shared.
    pub fn add_row_key_listener(&mut self, listener: Arc<dyn RowKeyListener>) {
        self.pipeline.add_listener(listener);
    }

    /// Write a batch of points
    pub async fn put_points(&self, points: &[PointEvent]) -> Result<()> {
        self.pipeline.submit(points).await
    }

    /// Run a query, streaming results to the callback. Returns the
    /// number of points delivered.
    pub async fn query<C: QueryCallback>(
        &self,
        query: &MetricQuery,
        callback: &mut C,
    ) -> Result<u64> {
        let keys = self.plan(query).await?;
        self.executor
            .query(&keys, query.range, query.order, query.limit, callback)
            .await
    }

    /// Run a query on a background task, returning a receiver of its
    /// event stream. A planning or execution failure closes the channel
    /// after a warning; consumers treat a close before `End` as an
    /// aborted stream.
    pub fn query_stream(self: &Arc<Self>, query: MetricQuery) -> mpsc::UnboundedReceiver<QueryEvent> {
        let (mut callback, receiver) = ChannelCallback::new();
        let datastore = self.clone();
        tokio::spawn(async move {
            if let Err(error) = datastore.query(&query, &mut callback).await {
                warn!(metric = %query.metric, %error, "streamed query failed");
            }
        });
        receiver
    }

    /// Delete the points of every matching row key within the range.
    /// Rows fully covered by the range are dropped whole, index entries
    /// included; partially covered rows lose only the columns in range.
    /// Returns the number of row keys touched.
    pub async fn delete_points(
        &self,
        metric: &str,
        filter: &Tags,
        range: TimeRange,
    ) -> Result<u64> {
        let mut rows = 0u64;
        for tier in self.tiers_in_range(metric, &range).await? {
            for key in self.row_keys_for_tier(metric, tier, filter).await? {
                let whole_row =
                    range.start <= tier && range.end >= tier + self.spec.row_width - 1;
                let mut deletions = Vec::new();
                if whole_row {
                    deletions.push(Deletion {
                        table: Table::DataPoints,
                        partition: key.encoded().clone(),
                        column: None,
                    });
                    deletions.extend(
                        self.selector.for_metric(metric).create_delete_statements(&key),
                    );
                } else {
                    let (lo, hi) = self.spec.offset_range(tier, &range);
                    let request = ScanRequest {
                        table: Table::DataPoints,
                        partition: key.encoded().clone(),
                        start: Some(Bytes::copy_from_slice(&lo.to_be_bytes())),
                        end: Some(Bytes::copy_from_slice(&hi.to_be_bytes())),
                        order: QueryOrder::Ascending,
                        limit: None,
                    };
                    for entry in self.scan_with_retry(request).await? {
                        deletions.push(Deletion {
                            table: Table::DataPoints,
                            partition: key.encoded().clone(),
                            column: Some(entry.column),
                        });
                    }
                }
                if deletions.is_empty() {
                    continue;
                }
                let replica = self.store.replica_for(key.encoded());
                self.retry
                    .execute(self.store.replica_count(), replica, |r| {
                        self.store.delete(&deletions, self.write_consistency, r)
                    })
                    .await?;
                if whole_row {
                    // Let a later write register the key's index again
                    self.pipeline.forget_row_key(&key);
                }
                rows += 1;
            }
        }
        Ok(rows)
    }

    /// Every metric name the string index knows, in byte order
    pub async fn metric_names(&self) -> Result<Vec<String>> {
        self.string_index(write::METRIC_NAMES).await
    }

    /// Every tag name the string index knows, in byte order
    pub async fn tag_names(&self) -> Result<Vec<String>> {
        self.string_index(write::TAG_NAMES).await
    }

    async fn string_index(&self, index: &'static [u8]) -> Result<Vec<String>> {
        let request = ScanRequest::full(Table::StringIndex, Bytes::from_static(index));
        let entries = self.scan_with_retry(request).await?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| String::from_utf8(entry.column.to_vec()).ok())
            .collect())
    }

    /// Aggregate counters across the write and retry paths
    pub fn stats(&self) -> DatastoreStats {
        DatastoreStats {
            write: self.pipeline.stats(),
            retries: self.retry.stats(),
        }
    }

    /// Resolve the row keys a query touches, in tier order
    async fn plan(&self, query: &MetricQuery) -> Result<Vec<RowKey>> {
        let mut keys = Vec::new();
        for tier in self.tiers_in_range(&query.metric, &query.range).await? {
            keys.extend(
                self.row_keys_for_tier(&query.metric, tier, &query.filter)
                    .await?,
            );
        }
        if query.order == QueryOrder::Descending {
            keys.reverse();
        }
        Ok(keys)
    }

    /// Tiers of a metric whose rows overlap the range, ascending. The
    /// time index is one partition per metric; tier columns are decoded
    /// and filtered numerically (big-endian i64 bytes missort around the
    /// sign bit, so byte bounds cannot be trusted here).
    async fn tiers_in_range(&self, metric: &str, range: &TimeRange) -> Result<Vec<Timestamp>> {
        let request = ScanRequest::full(
            Table::RowKeyTimeIndex,
            Bytes::copy_from_slice(metric.as_bytes()),
        );
        let entries = self.scan_with_retry(request).await?;

        let mut tiers = Vec::new();
        for entry in entries {
            let Ok(bytes) = <[u8; 8]>::try_from(entry.column.as_ref()) else {
                warn!(metric, "skipping malformed time-index column");
                continue;
            };
            let tier = i64::from_be_bytes(bytes);
            if tier <= range.end && tier + self.spec.row_width - 1 >= range.start {
                tiers.push(tier);
            }
        }
        tiers.sort_unstable();
        Ok(tiers)
    }

    /// Row keys of one (metric, tier) matching the tag filter. With
    /// several candidate index scans, each is sampled and the most
    /// selective one scanned fully; the remaining filter tags are
    /// checked client-side.
    async fn row_keys_for_tier(
        &self,
        metric: &str,
        tier: Timestamp,
        filter: &Tags,
    ) -> Result<Vec<RowKey>> {
        let statements = self
            .selector
            .for_metric(metric)
            .create_query_statements(metric, tier, filter);
        debug_assert!(!statements.is_empty());

        let chosen = if statements.len() == 1 {
            &statements[0]
        } else {
            let mut candidates = Vec::with_capacity(statements.len());
            for statement in &statements {
                let sample = self
                    .scan_with_retry(statement.scan.clone().with_limit(self.sample_size))
                    .await?;
                let hashes: Vec<u32> = sample
                    .iter()
                    .filter_map(|entry| split_hash_column(&entry.column))
                    .map(|(hash, _)| hash)
                    .collect();
                candidates.push((
                    estimate(&hashes, self.sample_size),
                    statement.candidate == CandidateKind::Wildcard,
                ));
            }
            let winner = match most_selective(&candidates) {
                Some(index) => index,
                None => return Ok(Vec::new()),
            };
            &statements[winner]
        };

        let entries = self.scan_with_retry(chosen.scan.clone()).await?;
        let mut keys = Vec::with_capacity(entries.len());
        for entry in entries {
            let encoded = match chosen.candidate {
                CandidateKind::Flat => entry.column.as_ref(),
                _ => match split_hash_column(&entry.column) {
                    Some((_, encoded)) => encoded,
                    None => {
                        warn!(metric, "skipping malformed index column");
                        continue;
                    }
                },
            };
            match codec::decode(encoded) {
                Ok(key) if tags_match(key.tags(), filter) => keys.push(key),
                Ok(_) => {}
                Err(error) => {
                    warn!(metric, %error, "skipping undecodable row key");
                }
            }
        }
        Ok(keys)
    }

    async fn scan_with_retry(&self, request: ScanRequest) -> Result<Vec<ColumnEntry>> {
        let replica = self.store.replica_for(&request.partition);
        self.retry
            .execute(self.store.replica_count(), replica, |r| {
                self.store.scan(&request, self.read_consistency, r)
            })
            .await
    }
}

/// Whether a row key's tags satisfy a filter (every filter pair present)
fn tags_match(tags: &Tags, filter: &Tags) -> bool {
    filter
        .iter()
        .all(|(name, value)| tags.get(name) == Some(value))
}
