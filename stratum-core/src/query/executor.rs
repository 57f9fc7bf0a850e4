//! Concurrent row-key query executor
//!
//! Fans reads out across row keys behind a counting semaphore sized to
//! the simultaneous-query limit (acquire before issuing, release on
//! completion), then merges results back to the caller's callback in
//! the order the row-key list was supplied. Ordering across row keys
//! beyond that is the caller's problem; within one row key points
//! arrive in the store's native column order.

use super::{QueryCallback, QueryMonitor};
use crate::retry::RetryPolicy;
use crate::rowkey::{RowKey, RowSpec};
use crate::store::{ColumnEntry, ColumnStore, Consistency, ScanRequest, Table};
use crate::value::PointFactoryRegistry;
use crate::{DataPoint, QueryOrder, Result, StratumError, TimeRange};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::warn;

pub struct QueryExecutor<S> {
    store: Arc<S>,
    spec: RowSpec,
    factories: Arc<PointFactoryRegistry>,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
    read_consistency: Consistency,
    point_limit: u64,
}

impl<S: ColumnStore> QueryExecutor<S> {
    pub fn new(
        store: Arc<S>,
        spec: RowSpec,
        factories: Arc<PointFactoryRegistry>,
        retry: RetryPolicy,
        simultaneous_queries: usize,
        read_consistency: Consistency,
        point_limit: u64,
    ) -> Self {
        Self {
            store,
            spec,
            factories,
            retry,
            permits: Arc::new(Semaphore::new(simultaneous_queries.max(1))),
            read_consistency,
            point_limit,
        }
    }

    /// Scan every row key over the time range and stream decoded points
    /// to the callback. Returns the number of points delivered.
    pub async fn query<C: QueryCallback>(
        &self,
        row_keys: &[RowKey],
        range: TimeRange,
        order: QueryOrder,
        limit: Option<usize>,
        callback: &mut C,
    ) -> Result<u64> {
        let monitor = Arc::new(QueryMonitor::new(self.point_limit));

        let handles: Vec<_> = row_keys
            .iter()
            .map(|key| {
                let scan = self.row_scan(key, &range, order, limit);
                let replica = self.store.replica_for(&scan.partition);
                let store = self.store.clone();
                let retry = self.retry.clone();
                let permits = self.permits.clone();
                let monitor = monitor.clone();
                let consistency = self.read_consistency;
                tokio::spawn(async move {
                    // The permit is the only admission control: at most
                    // `simultaneous_queries` scans are in flight per
                    // executor, however many row keys matched.
                    let _permit = permits
                        .acquire_owned()
                        .await
                        .map_err(|_| StratumError::Unavailable("executor shut down".to_string()))?;
                    if monitor.is_stopped() {
                        return Ok(Vec::new());
                    }
                    retry
                        .execute(store.replica_count(), replica, |r| {
                            store.scan(&scan, consistency, r)
                        })
                        .await
                })
            })
            .collect();

        // Await in supplied row-key order. By the time the last handle
        // resolves every permit has been released, so completion never
        // outruns an in-flight scan.
        let mut delivered = 0u64;
        for (key, handle) in row_keys.iter().zip(handles) {
            let entries = handle
                .await
                .map_err(|e| StratumError::Coordinator(format!("scan task failed: {e}")))??;

            callback.start_data_point_set(key)?;
            for entry in &entries {
                monitor.count(1)?;
                match self.decode_column(key, entry) {
                    Ok(point) => {
                        callback.add_data_point(point)?;
                        delivered += 1;
                    }
                    Err(error) if error.is_decode() => {
                        // Fatal for this point only
                        warn!(metric = key.metric(), %error, "skipping undecodable column");
                    }
                    Err(error) => return Err(error),
                }
            }
            callback.end_data_point_set()?;
        }
        Ok(delivered)
    }

    fn row_scan(
        &self,
        key: &RowKey,
        range: &TimeRange,
        order: QueryOrder,
        limit: Option<usize>,
    ) -> ScanRequest {
        let (lo, hi) = self.spec.offset_range(key.tier_timestamp(), range);
        ScanRequest {
            table: Table::DataPoints,
            partition: key.encoded().clone(),
            start: Some(Bytes::copy_from_slice(&lo.to_be_bytes())),
            end: Some(Bytes::copy_from_slice(&hi.to_be_bytes())),
            order,
            limit,
        }
    }

    fn decode_column(&self, key: &RowKey, entry: &ColumnEntry) -> Result<DataPoint> {
        let offset_bytes: [u8; 4] = entry
            .column
            .as_ref()
            .try_into()
            .map_err(|_| StratumError::Decode("column offset is not 4 bytes".to_string()))?;
        let offset = u32::from_be_bytes(offset_bytes);
        let timestamp = self.spec.timestamp_for(key.tier_timestamp(), offset);
        let double_bit = self.spec.is_legacy_double(offset);
        let value = self
            .factories
            .decode(key.data_type(), &entry.value, double_bit)?;
        Ok(DataPoint { timestamp, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::CollectingCallback;
    use crate::rowkey::TimeUnit;
    use crate::store::{MemoryStore, Mutation};
    use crate::value::encode_varlong;
    use crate::Tags;
    use std::time::Duration;

    fn spec() -> RowSpec {
        RowSpec::new(1000, TimeUnit::Milliseconds, false).unwrap()
    }

    fn executor(store: Arc<MemoryStore>, simultaneous: usize, point_limit: u64) -> QueryExecutor<MemoryStore> {
        QueryExecutor::new(
            store,
            spec(),
            Arc::new(PointFactoryRegistry::default()),
            RetryPolicy::new(1).with_backoff(Duration::ZERO),
            simultaneous,
            Consistency::Quorum,
            point_limit,
        )
    }

    async fn seed_row(store: &MemoryStore, key: &RowKey, points: &[(i64, i64)]) {
        let s = spec();
        let muts: Vec<Mutation> = points
            .iter()
            .map(|(ts, v)| Mutation {
                table: Table::DataPoints,
                partition: key.encoded().clone(),
                column: Bytes::copy_from_slice(
                    &s.column_offset(key.tier_timestamp(), *ts, false).to_be_bytes(),
                ),
                value: Bytes::from(encode_varlong(*v)),
                ttl: None,
            })
            .collect();
        store.apply(&muts, Consistency::Quorum, 0).await.unwrap();
    }

    fn key(metric: &str, tier: i64) -> RowKey {
        RowKey::new(metric, tier, "long", Tags::new())
    }

    #[tokio::test]
    async fn test_streams_rows_in_supplied_order() {
        let store = Arc::new(MemoryStore::new());
        let k1 = key("cpu", 0);
        let k2 = key("cpu", 1000);
        seed_row(&store, &k1, &[(1, 10), (2, 20)]).await;
        seed_row(&store, &k2, &[(1500, 30)]).await;

        let exec = executor(store, 4, 1_000_000);
        let mut callback = CollectingCallback::default();
        let delivered = exec
            .query(
                &[k2.clone(), k1.clone()],
                TimeRange::new(0, 5000),
                QueryOrder::Ascending,
                None,
                &mut callback,
            )
            .await
            .unwrap();

        assert_eq!(delivered, 3);
        // one start/end bracket per row key, in supplied order
        assert_eq!(callback.sets.len(), 2);
        assert_eq!(callback.sets[0].0, k2);
        assert_eq!(callback.sets[1].0, k1);
        assert_eq!(
            callback.sets[1].1,
            vec![DataPoint::new(1, 10i64), DataPoint::new(2, 20i64)]
        );
    }

    #[tokio::test]
    async fn test_range_clamps_to_row() {
        let store = Arc::new(MemoryStore::new());
        let k = key("cpu", 0);
        seed_row(&store, &k, &[(1, 10), (500, 50), (999, 99)]).await;

        let exec = executor(store, 4, 1_000_000);
        let mut callback = CollectingCallback::default();
        exec.query(
            &[k],
            TimeRange::new(400, 600),
            QueryOrder::Ascending,
            None,
            &mut callback,
        )
        .await
        .unwrap();
        assert_eq!(callback.points(), vec![DataPoint::new(500, 50i64)]);
    }

    #[tokio::test]
    async fn test_descending_order() {
        let store = Arc::new(MemoryStore::new());
        let k = key("cpu", 0);
        seed_row(&store, &k, &[(1, 10), (2, 20)]).await;

        let exec = executor(store, 4, 1_000_000);
        let mut callback = CollectingCallback::default();
        exec.query(
            &[k],
            TimeRange::new(0, 999),
            QueryOrder::Descending,
            None,
            &mut callback,
        )
        .await
        .unwrap();
        let times: Vec<i64> = callback.points().iter().map(|p| p.timestamp).collect();
        assert_eq!(times, vec![2, 1]);
    }

    #[tokio::test]
    async fn test_semaphore_bounds_concurrent_scans() {
        let store = Arc::new(
            MemoryStore::new().with_scan_latency(Duration::from_millis(10)),
        );
        let keys: Vec<RowKey> = (0..20).map(|i| key("cpu", i * 1000)).collect();
        for k in &keys {
            seed_row(&store, k, &[(k.tier_timestamp() + 1, 1)]).await;
        }

        let exec = executor(store.clone(), 3, 1_000_000);
        let mut callback = CollectingCallback::default();
        exec.query(
            &keys,
            TimeRange::new(0, 30_000),
            QueryOrder::Ascending,
            None,
            &mut callback,
        )
        .await
        .unwrap();

        assert!(
            store.max_concurrent_scans() <= 3,
            "observed {} concurrent scans",
            store.max_concurrent_scans()
        );
        // exactly one end marker (= one set) per row key
        assert_eq!(callback.sets.len(), keys.len());
    }

    #[tokio::test]
    async fn test_point_limit_surfaces_typed_failure() {
        let store = Arc::new(MemoryStore::new());
        let k = key("cpu", 0);
        seed_row(&store, &k, &[(1, 1), (2, 2), (3, 3), (4, 4)]).await;

        let exec = executor(store, 4, 2);
        let mut callback = CollectingCallback::default();
        let result = exec
            .query(
                &[k],
                TimeRange::new(0, 999),
                QueryOrder::Ascending,
                None,
                &mut callback,
            )
            .await;
        assert!(matches!(
            result,
            Err(StratumError::QueryLimitExceeded { limit: 2 })
        ));
    }

    #[tokio::test]
    async fn test_undecodable_column_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let k = key("cpu", 0);
        seed_row(&store, &k, &[(1, 10)]).await;
        // A column whose name is not a 4-byte offset
        store
            .apply(
                &[Mutation {
                    table: Table::DataPoints,
                    partition: k.encoded().clone(),
                    column: Bytes::from_static(&[0, 0, 1]),
                    value: Bytes::from_static(&[1]),
                    ttl: None,
                }],
                Consistency::Quorum,
                0,
            )
            .await
            .unwrap();

        let exec = executor(store, 4, 1_000_000);
        let mut callback = CollectingCallback::default();
        let delivered = exec
            .query(
                &[k],
                TimeRange::new(0, 999),
                QueryOrder::Ascending,
                None,
                &mut callback,
            )
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(callback.points(), vec![DataPoint::new(1, 10i64)]);
    }
}
