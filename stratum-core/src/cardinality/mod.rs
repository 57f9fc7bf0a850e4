//! Cardinality estimation from ordered hash samples
//!
//! Tag-indexed partitions sort their columns by a quasi-uniform 32-bit
//! collection hash. Reading a small prefix of such a stream and
//! measuring the mean gap between successive hashes estimates the full
//! count as `2^32 / mean_gap`, which is enough to pick the most
//! selective of several candidate tag filters without scanning any of
//! them fully.

/// How many leading hashes a candidate stream is sampled for
pub const DEFAULT_SAMPLE_SIZE: usize = 50;

const HASH_SPACE: u64 = 1 << 32;

/// Result-set size estimate for one candidate stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardinalityEstimate {
    pub count: u64,
    /// True when the stream was exhausted inside the sample, making the
    /// count an observation rather than an estimate
    pub exact: bool,
}

impl CardinalityEstimate {
    pub fn exact(count: u64) -> Self {
        Self { count, exact: true }
    }
}

/// Estimate the total stream size from its leading hashes. `hashes`
/// must be the first `sample_size` (or fewer) values of a hash-ordered
/// stream; fewer means the stream ended and the count is exact.
pub fn estimate(hashes: &[u32], sample_size: usize) -> CardinalityEstimate {
    if hashes.len() < sample_size {
        return CardinalityEstimate::exact(hashes.len() as u64);
    }

    debug_assert!(hashes.windows(2).all(|w| w[0] <= w[1]));
    // The successive gaps telescope to last - first
    let span = u64::from(hashes[hashes.len() - 1]) - u64::from(hashes[0]);
    if span == 0 {
        // Degenerate sample (all hashes equal); the best lower bound is
        // what was observed
        return CardinalityEstimate {
            count: hashes.len() as u64,
            exact: false,
        };
    }
    let mean_gap = span / (hashes.len() as u64 - 1);
    CardinalityEstimate {
        count: HASH_SPACE / mean_gap.max(1),
        exact: false,
    }
}

/// Pick the most selective candidate: exact counts beat estimates, then
/// lower counts win, and a wildcard candidate loses any comparison
/// unless it is the only one. Returns the winning index.
pub fn most_selective(candidates: &[(CardinalityEstimate, bool)]) -> Option<usize> {
    let non_wildcard = candidates
        .iter()
        .enumerate()
        .filter(|(_, (_, wildcard))| !wildcard)
        .min_by_key(|(_, (est, _))| (!est.exact, est.count))
        .map(|(i, _)| i);

    non_wildcard.or_else(|| (!candidates.is_empty()).then_some(0))
}
