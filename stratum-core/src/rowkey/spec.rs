//! Row width and tier math
//!
//! A tier is a fixed-width time bucket; every timestamp maps to exactly
//! one tier, and a point's position inside its row is the distance from
//! the tier start. Legacy clusters reserve the low bit of the stored
//! offset as a long/double flag, shifting real offsets left by one bit.

use crate::{Result, StratumError, Timestamp, TimeRange};
use serde::{Deserialize, Serialize};

/// Time unit the cluster's timestamps are expressed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeUnit {
    Milliseconds,
    Seconds,
}

impl TimeUnit {
    /// Convert a duration expressed in this unit to whole seconds,
    /// rounding up. Used when extending TTLs by a row width.
    pub fn to_seconds(&self, duration: i64) -> i64 {
        match self {
            TimeUnit::Milliseconds => (duration + 999) / 1000,
            TimeUnit::Seconds => duration,
        }
    }
}

/// Immutable per-cluster row layout configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowSpec {
    /// Width of one row in the cluster time unit
    pub row_width: i64,
    /// Unit timestamps are expressed in
    pub time_unit: TimeUnit,
    /// Legacy offset bit-packing compatibility mode. A fixed
    /// migration-time choice, never inferred from stored data.
    pub legacy: bool,
}

impl RowSpec {
    /// Create a spec, validating the row width
    pub fn new(row_width: i64, time_unit: TimeUnit, legacy: bool) -> Result<Self> {
        if row_width <= 0 {
            return Err(StratumError::Config(format!(
                "row width must be positive, got {row_width}"
            )));
        }
        // Stored offsets are 32-bit; a legacy row loses one bit to the
        // type flag.
        let max_width = if legacy { 1i64 << 31 } else { 1i64 << 32 };
        if row_width > max_width {
            return Err(StratumError::Config(format!(
                "row width {row_width} does not fit a 32-bit column offset"
            )));
        }
        Ok(Self {
            row_width,
            time_unit,
            legacy,
        })
    }

    /// Legacy-compatible defaults: three-week millisecond rows
    pub fn legacy_default() -> Self {
        Self {
            row_width: crate::config::LEGACY_ROW_WIDTH_MS,
            time_unit: TimeUnit::Milliseconds,
            legacy: true,
        }
    }

    /// The tier (row start) timestamp a point timestamp falls into:
    /// `ts - (|ts| mod row_width)`
    pub fn tier_timestamp(&self, ts: Timestamp) -> Timestamp {
        ts - (ts.abs() % self.row_width)
    }

    /// Stored column offset for a timestamp inside the given tier.
    /// `double_bit` is only consulted in legacy mode.
    pub fn column_offset(&self, tier: Timestamp, ts: Timestamp, double_bit: bool) -> u32 {
        debug_assert!(ts >= tier && ts < tier + self.row_width);
        let delta = (ts - tier) as u32;
        if self.legacy {
            (delta << 1) | u32::from(double_bit)
        } else {
            delta
        }
    }

    /// Recover the absolute timestamp from a stored offset
    pub fn timestamp_for(&self, tier: Timestamp, stored_offset: u32) -> Timestamp {
        let delta = if self.legacy {
            stored_offset >> 1
        } else {
            stored_offset
        };
        tier + delta as i64
    }

    /// Whether a stored offset carries the legacy double flag. Always
    /// false outside legacy mode.
    pub fn is_legacy_double(&self, stored_offset: u32) -> bool {
        self.legacy && (stored_offset & 1) == 1
    }

    /// Inclusive stored-offset bounds covering the intersection of the
    /// global time range with this tier's row. In legacy mode the bounds
    /// span both type-bit values so longs and doubles are both covered.
    pub fn offset_range(&self, tier: Timestamp, range: &TimeRange) -> (u32, u32) {
        let start_ts = range.start.max(tier);
        let end_ts = range.end.min(tier + self.row_width - 1);
        let start_delta = (start_ts - tier).max(0) as u32;
        let end_delta = (end_ts - tier).max(0) as u32;
        if self.legacy {
            (start_delta << 1, (end_delta << 1) | 1)
        } else {
            (start_delta, end_delta)
        }
    }
}
