//! Query streaming contract and limit monitor
//!
//! Results stream to the caller per row key, bracketed by start/end
//! markers. The callback trait is the primary contract; a channel
//! adapter produces the same event stream for consumers that prefer a
//! receiver over inversion of control.

mod executor;

pub use executor::QueryExecutor;

use crate::rowkey::RowKey;
use crate::{DataPoint, Result, StratumError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Streaming consumer of query results. For every queried row key the
/// executor calls `start_data_point_set`, then `add_data_point` per
/// point in the store's native column order, then exactly one
/// `end_data_point_set`. Returning an error aborts the stream.
pub trait QueryCallback {
    fn start_data_point_set(&mut self, key: &RowKey) -> Result<()>;
    fn add_data_point(&mut self, point: DataPoint) -> Result<()>;
    fn end_data_point_set(&mut self) -> Result<()>;
}

/// One event of the channel-based stream
#[derive(Debug, Clone, PartialEq)]
pub enum QueryEvent {
    Start(RowKey),
    Point(DataPoint),
    End,
}

/// Adapter forwarding callback calls into an unbounded channel
pub struct ChannelCallback {
    sender: mpsc::UnboundedSender<QueryEvent>,
}

impl ChannelCallback {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<QueryEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    fn send(&self, event: QueryEvent) -> Result<()> {
        self.sender
            .send(event)
            .map_err(|_| StratumError::Unavailable("query consumer dropped".to_string()))
    }
}

impl QueryCallback for ChannelCallback {
    fn start_data_point_set(&mut self, key: &RowKey) -> Result<()> {
        self.send(QueryEvent::Start(key.clone()))
    }

    fn add_data_point(&mut self, point: DataPoint) -> Result<()> {
        self.send(QueryEvent::Point(point))
    }

    fn end_data_point_set(&mut self) -> Result<()> {
        self.send(QueryEvent::End)
    }
}

/// Callback collecting everything in memory
#[derive(Default)]
pub struct CollectingCallback {
    pub sets: Vec<(RowKey, Vec<DataPoint>)>,
}

impl QueryCallback for CollectingCallback {
    fn start_data_point_set(&mut self, key: &RowKey) -> Result<()> {
        self.sets.push((key.clone(), Vec::new()));
        Ok(())
    }

    fn add_data_point(&mut self, point: DataPoint) -> Result<()> {
        match self.sets.last_mut() {
            Some((_, points)) => {
                points.push(point);
                Ok(())
            }
            None => Err(StratumError::Coordinator(
                "data point before start marker".to_string(),
            )),
        }
    }

    fn end_data_point_set(&mut self) -> Result<()> {
        Ok(())
    }
}

impl CollectingCallback {
    /// All points across row keys, in delivery order
    pub fn points(&self) -> Vec<DataPoint> {
        self.sets
            .iter()
            .flat_map(|(_, points)| points.iter().cloned())
            .collect()
    }
}

/// Running point counter with a hard ceiling. Once the ceiling is
/// crossed the monitor stays stopped: in-flight scans stop issuing and
/// the delivery loop stops decoding. Already-issued network requests
/// are not cancelled.
pub struct QueryMonitor {
    counted: AtomicU64,
    limit: u64,
    stopped: AtomicBool,
}

impl QueryMonitor {
    pub fn new(limit: u64) -> Self {
        Self {
            counted: AtomicU64::new(0),
            limit,
            stopped: AtomicBool::new(false),
        }
    }

    /// Record `n` more points, failing once the ceiling is exceeded
    pub fn count(&self, n: u64) -> Result<()> {
        let total = self.counted.fetch_add(n, Ordering::Relaxed) + n;
        if total > self.limit {
            self.stopped.store(true, Ordering::Relaxed);
            return Err(StratumError::QueryLimitExceeded { limit: self.limit });
        }
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    pub fn counted(&self) -> u64 {
        self.counted.load(Ordering::Relaxed)
    }
}
