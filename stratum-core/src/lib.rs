//! Stratum Core - Tier-Bucketed Time-Series Storage Engine
//!
//! A storage engine that fronts a distributed column-family store,
//! mapping metrics onto fixed-width time tiers:
//!
//! - **Row keys**: one wide row per (metric, tier, data type, tag set),
//!   with a byte-comparable binary codec
//! - **Write pipeline**: dedup-cached index registration, per-replica
//!   batching, batch splitting with a durable replay log
//! - **Lookup strategies**: flat or tag-indexed row-key indexes, picked
//!   per metric, with a gap-sampling cardinality estimator choosing the
//!   most selective index scan
//! - **Query executor**: semaphore-bounded concurrent row scans with a
//!   streaming callback contract and a hard point ceiling
//!
//! The backing store sits behind the [`store::ColumnStore`] trait; an
//! instrumented in-memory implementation backs tests and embedded use.

pub mod cache;
pub mod cardinality;
pub mod config;
pub mod datastore;
pub mod lookup;
pub mod query;
pub mod retry;
pub mod rowkey;
pub mod store;
pub mod value;
pub mod write;

mod error;
mod types;

pub use datastore::{Datastore, MetricQuery};
pub use error::{Result, StratumError};
pub use rowkey::RowKey;
pub use types::*;

/// Stratum version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
