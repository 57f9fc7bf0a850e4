//! In-memory column store
//!
//! Backs tests and embedded use. Partitions are ordered maps so column
//! scans see the store's native byte order, matching what a real
//! column-family cluster returns. Fault injection, a batch-size
//! ceiling, missing-table simulation and scan-concurrency accounting
//! exist so the retry, split, degrade and semaphore paths can be
//! exercised.

use super::{ColumnEntry, Consistency, Deletion, Mutation, ReplicaId, ScanRequest, Table};
use crate::{QueryOrder, Result, StratumError};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[derive(Clone)]
struct Cell {
    value: Bytes,
    expires_at: Option<Instant>,
}

type Partition = BTreeMap<Bytes, Cell>;

/// In-memory implementation of [`super::ColumnStore`]
pub struct MemoryStore {
    tables: RwLock<HashMap<Table, BTreeMap<Bytes, Partition>>>,
    missing: HashSet<Table>,
    replicas: usize,
    batch_limit: Option<usize>,
    scan_latency: Option<Duration>,
    faults: Mutex<VecDeque<StratumError>>,
    apply_sizes: Mutex<Vec<usize>>,
    scans_in_flight: AtomicUsize,
    max_scans_in_flight: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            missing: HashSet::new(),
            replicas: 3,
            batch_limit: None,
            scan_latency: None,
            faults: Mutex::new(VecDeque::new()),
            apply_sizes: Mutex::new(Vec::new()),
            scans_in_flight: AtomicUsize::new(0),
            max_scans_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_replicas(mut self, replicas: usize) -> Self {
        assert!(replicas > 0);
        self.replicas = replicas;
        self
    }

    /// Reject mutation batches larger than `limit` with `BatchTooLarge`
    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = Some(limit);
        self
    }

    /// Simulate an older store without the given table
    pub fn with_missing_table(mut self, table: Table) -> Self {
        self.missing.insert(table);
        self
    }

    /// Delay every scan, so concurrent scans overlap observably
    pub fn with_scan_latency(mut self, latency: Duration) -> Self {
        self.scan_latency = Some(latency);
        self
    }

    /// Queue an error to be returned by the next store operation
    pub fn inject_fault(&self, error: StratumError) {
        self.faults.lock().push_back(error);
    }

    /// Sizes of the mutation batches handed to `apply`, in order,
    /// including rejected ones
    pub fn apply_batch_sizes(&self) -> Vec<usize> {
        self.apply_sizes.lock().clone()
    }

    /// Highest number of scans observed in flight at once
    pub fn max_concurrent_scans(&self) -> usize {
        self.max_scans_in_flight.load(Ordering::Relaxed)
    }

    /// Number of live columns in a table, expired cells included
    pub fn column_count(&self, table: Table) -> usize {
        self.tables
            .read()
            .get(&table)
            .map(|partitions| partitions.values().map(|p| p.len()).sum())
            .unwrap_or(0)
    }

    fn take_fault(&self) -> Option<StratumError> {
        self.faults.lock().pop_front()
    }

    fn check_table(&self, table: Table) -> Result<()> {
        if self.missing.contains(&table) {
            return Err(StratumError::Schema(format!(
                "table {} does not exist",
                table.name()
            )));
        }
        Ok(())
    }
}

impl super::ColumnStore for MemoryStore {
    fn replica_count(&self) -> usize {
        self.replicas
    }

    fn replica_for(&self, partition: &[u8]) -> ReplicaId {
        crc32fast::hash(partition) as usize % self.replicas
    }

    fn has_table(&self, table: Table) -> bool {
        !self.missing.contains(&table)
    }

    async fn apply(
        &self,
        mutations: &[Mutation],
        _consistency: Consistency,
        _replica: ReplicaId,
    ) -> Result<()> {
        self.apply_sizes.lock().push(mutations.len());
        if let Some(fault) = self.take_fault() {
            return Err(fault);
        }
        if let Some(limit) = self.batch_limit {
            if mutations.len() > limit {
                return Err(StratumError::BatchTooLarge {
                    size: mutations.len(),
                });
            }
        }
        for m in mutations {
            self.check_table(m.table)?;
        }

        let now = Instant::now();
        let mut tables = self.tables.write();
        for m in mutations {
            let cell = Cell {
                value: m.value.clone(),
                expires_at: m.ttl.map(|secs| now + Duration::from_secs(secs.into())),
            };
            tables
                .entry(m.table)
                .or_default()
                .entry(m.partition.clone())
                .or_default()
                .insert(m.column.clone(), cell);
        }
        Ok(())
    }

    async fn delete(
        &self,
        deletions: &[Deletion],
        _consistency: Consistency,
        _replica: ReplicaId,
    ) -> Result<()> {
        if let Some(fault) = self.take_fault() {
            return Err(fault);
        }
        let mut tables = self.tables.write();
        for d in deletions {
            self.check_table(d.table)?;
            if let Some(partitions) = tables.get_mut(&d.table) {
                match &d.column {
                    Some(column) => {
                        if let Some(partition) = partitions.get_mut(&d.partition) {
                            partition.remove(column);
                        }
                    }
                    None => {
                        partitions.remove(&d.partition);
                    }
                }
            }
        }
        Ok(())
    }

    async fn scan(
        &self,
        request: &ScanRequest,
        _consistency: Consistency,
        _replica: ReplicaId,
    ) -> Result<Vec<ColumnEntry>> {
        if let Some(fault) = self.take_fault() {
            return Err(fault);
        }
        self.check_table(request.table)?;

        let in_flight = self.scans_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_scans_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);
        if let Some(latency) = self.scan_latency {
            tokio::time::sleep(latency).await;
        }

        let now = Instant::now();
        let entries = {
            let tables = self.tables.read();
            let partition = tables
                .get(&request.table)
                .and_then(|partitions| partitions.get(&request.partition));

            let mut entries: Vec<ColumnEntry> = match partition {
                None => Vec::new(),
                Some(partition) => {
                    let in_bounds = |column: &Bytes| {
                        request.start.as_ref().map_or(true, |s| column >= s)
                            && request.end.as_ref().map_or(true, |e| column <= e)
                    };
                    partition
                        .iter()
                        .filter(|(column, _)| in_bounds(column))
                        .filter(|(_, cell)| cell.expires_at.map_or(true, |at| at > now))
                        .map(|(column, cell)| ColumnEntry {
                            column: column.clone(),
                            value: cell.value.clone(),
                        })
                        .collect()
                }
            };
            if request.order == QueryOrder::Descending {
                entries.reverse();
            }
            if let Some(limit) = request.limit {
                entries.truncate(limit);
            }
            entries
        };

        self.scans_in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ColumnStore;

    fn mutation(table: Table, partition: &[u8], column: &[u8], value: &[u8]) -> Mutation {
        Mutation {
            table,
            partition: Bytes::copy_from_slice(partition),
            column: Bytes::copy_from_slice(column),
            value: Bytes::copy_from_slice(value),
            ttl: None,
        }
    }

    #[tokio::test]
    async fn test_scan_orders_and_bounds() {
        let store = MemoryStore::new();
        let muts: Vec<_> = [3u8, 1, 2, 5]
            .iter()
            .map(|i| mutation(Table::DataPoints, b"p", &[*i], &[*i]))
            .collect();
        store.apply(&muts, Consistency::Quorum, 0).await.unwrap();

        let mut req = ScanRequest::full(Table::DataPoints, Bytes::from_static(b"p"));
        req.start = Some(Bytes::from_static(&[2]));
        req.end = Some(Bytes::from_static(&[3]));
        let asc = store.scan(&req, Consistency::Quorum, 0).await.unwrap();
        assert_eq!(
            asc.iter().map(|e| e.column[0]).collect::<Vec<_>>(),
            vec![2, 3]
        );

        req.order = QueryOrder::Descending;
        let desc = store.scan(&req, Consistency::Quorum, 0).await.unwrap();
        assert_eq!(
            desc.iter().map(|e| e.column[0]).collect::<Vec<_>>(),
            vec![3, 2]
        );
    }

    #[tokio::test]
    async fn test_batch_limit() {
        let store = MemoryStore::new().with_batch_limit(2);
        let muts: Vec<_> = (0..3)
            .map(|i| mutation(Table::RowKeys, b"p", &[i], b""))
            .collect();
        let err = store.apply(&muts, Consistency::Quorum, 0).await.unwrap_err();
        assert!(matches!(err, StratumError::BatchTooLarge { size: 3 }));
    }

    #[tokio::test]
    async fn test_fault_injection_is_one_shot() {
        let store = MemoryStore::new();
        store.inject_fault(StratumError::Timeout("injected".into()));
        let req = ScanRequest::full(Table::RowKeys, Bytes::from_static(b"p"));
        assert!(store.scan(&req, Consistency::Quorum, 0).await.is_err());
        assert!(store.scan(&req, Consistency::Quorum, 0).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_table() {
        let store = MemoryStore::new().with_missing_table(Table::TagIndexedRowKeys);
        assert!(!store.has_table(Table::TagIndexedRowKeys));
        let req = ScanRequest::full(Table::TagIndexedRowKeys, Bytes::from_static(b"p"));
        assert!(matches!(
            store.scan(&req, Consistency::Quorum, 0).await,
            Err(StratumError::Schema(_))
        ));
    }
}
