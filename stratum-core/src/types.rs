//! Core types for Stratum

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Timestamp in the cluster's configured time unit (milliseconds or
/// seconds since Unix epoch)
pub type Timestamp = i64;

/// Sorted tag map. `BTreeMap` keeps tag keys in total lexicographic
/// order, which the row-key byte layout depends on.
pub type Tags = BTreeMap<String, String>;

/// A single incoming point from the ingestion side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointEvent {
    /// Metric name (e.g. "cpu_usage")
    pub metric: String,
    /// Sorted tags
    pub tags: Tags,
    /// Timestamp in the cluster time unit
    pub timestamp: Timestamp,
    /// The point's value
    pub value: PointValue,
    /// Optional time-to-live in seconds
    pub ttl: Option<u32>,
}

impl PointEvent {
    /// Create a new point with no tags and no TTL
    pub fn new(metric: impl Into<String>, timestamp: Timestamp, value: impl Into<PointValue>) -> Self {
        Self {
            metric: metric.into(),
            tags: BTreeMap::new(),
            timestamp,
            value: value.into(),
            ttl: None,
        }
    }

    /// Add a tag
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Set the TTL in seconds
    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Possible point value types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PointValue {
    /// 64-bit signed integer
    Long(i64),
    /// 64-bit float
    Double(f64),
    /// UTF-8 string
    Text(String),
}

impl PointValue {
    /// Get as f64 if numeric
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PointValue::Long(v) => Some(*v as f64),
            PointValue::Double(v) => Some(*v),
            PointValue::Text(_) => None,
        }
    }

    /// Get as i64 if numeric
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PointValue::Long(v) => Some(*v),
            PointValue::Double(v) => Some(*v as i64),
            PointValue::Text(_) => None,
        }
    }
}

impl From<i64> for PointValue {
    fn from(v: i64) -> Self {
        PointValue::Long(v)
    }
}

impl From<f64> for PointValue {
    fn from(v: f64) -> Self {
        PointValue::Double(v)
    }
}

impl From<&str> for PointValue {
    fn from(v: &str) -> Self {
        PointValue::Text(v.to_string())
    }
}

impl From<String> for PointValue {
    fn from(v: String) -> Self {
        PointValue::Text(v)
    }
}

/// A decoded point returned to query callers
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    /// Timestamp in the cluster time unit
    pub timestamp: Timestamp,
    /// Decoded value
    pub value: PointValue,
}

impl DataPoint {
    /// Create a new data point
    pub fn new(timestamp: Timestamp, value: impl Into<PointValue>) -> Self {
        Self {
            timestamp,
            value: value.into(),
        }
    }
}

/// Time range for queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub start: Timestamp,
    /// End timestamp (inclusive)
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Check if a timestamp is within the range
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts <= self.end
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Result ordering for queries. Maps to the store's native column
/// ordering within one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryOrder {
    #[default]
    Ascending,
    Descending,
}
