//! Bounded next-replica retry for transient store failures
//!
//! Timeouts, unavailable replicas and coordinator errors are retried
//! against the next replica up to a ceiling, then rethrown unchanged.
//! The policy is stateless across requests and does not know whether an
//! operation is idempotent; callers only apply it to operations that
//! are (point and index writes here are).

use crate::store::ReplicaId;
use crate::{Result, StratumError};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Retry policy shared by the read and write paths
#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: usize,
    backoff: Duration,
    stats: Arc<RetryStats>,
}

#[derive(Default)]
struct RetryStats {
    timeouts: AtomicU64,
    unavailable: AtomicU64,
    coordinator: AtomicU64,
}

/// Point-in-time view of the retry counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryStatsSnapshot {
    pub timeouts: u64,
    pub unavailable: u64,
    pub coordinator: u64,
}

impl RetryPolicy {
    pub fn new(max_retries: usize) -> Self {
        Self {
            max_retries,
            backoff: Duration::from_millis(50),
            stats: Arc::new(RetryStats::default()),
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run `op` starting at `start` among `replicas` replicas, moving to
    /// the next replica after each transient failure. A fresh attempt
    /// counter per logical call.
    pub async fn execute<T, F, Fut>(
        &self,
        replicas: usize,
        start: ReplicaId,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut(ReplicaId) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        debug_assert!(replicas > 0);
        let mut replica = start % replicas.max(1);
        let mut attempt = 0;
        loop {
            match op(replica).await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempt < self.max_retries => {
                    self.record(&error);
                    warn!(
                        attempt,
                        replica,
                        %error,
                        "transient store failure, retrying on next replica"
                    );
                    replica = (replica + 1) % replicas.max(1);
                    attempt += 1;
                    if !self.backoff.is_zero() {
                        tokio::time::sleep(self.backoff * attempt as u32).await;
                    }
                }
                Err(error) => {
                    if error.is_transient() {
                        self.record(&error);
                    }
                    return Err(error);
                }
            }
        }
    }

    fn record(&self, error: &StratumError) {
        let counter = match error {
            StratumError::Timeout(_) => &self.stats.timeouts,
            StratumError::Unavailable(_) => &self.stats.unavailable,
            StratumError::Coordinator(_) => &self.stats.coordinator,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> RetryStatsSnapshot {
        RetryStatsSnapshot {
            timeouts: self.stats.timeouts.load(Ordering::Relaxed),
            unavailable: self.stats.unavailable.load(Ordering::Relaxed),
            coordinator: self.stats.coordinator.load(Ordering::Relaxed),
        }
    }
}
