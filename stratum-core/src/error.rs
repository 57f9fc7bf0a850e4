//! Error types for Stratum

use thiserror::Error;

/// Result type alias for Stratum operations
pub type Result<T> = std::result::Result<T, StratumError>;

/// Stratum error types
#[derive(Error, Debug)]
pub enum StratumError {
    /// Read or write against the backing store timed out
    #[error("store timeout: {0}")]
    Timeout(String),

    /// Not enough replicas were available to satisfy the consistency level
    #[error("replicas unavailable: {0}")]
    Unavailable(String),

    /// The coordinating node failed mid-request
    #[error("coordinator error: {0}")]
    Coordinator(String),

    /// The store rejected a mutation batch for being too large
    #[error("batch too large: {size} mutations")]
    BatchTooLarge { size: usize },

    /// A query touched more data points than the configured ceiling
    #[error("query exceeded limit of {limit} data points")]
    QueryLimitExceeded { limit: u64 },

    /// No point factory is registered for this data type
    #[error("unknown data type: {0}")]
    UnknownDataType(String),

    /// A stored row key could not be decoded
    #[error("malformed row key: {0}")]
    MalformedRowKey(String),

    /// A stored column value could not be decoded
    #[error("decode error: {0}")]
    Decode(String),

    /// The backing store is missing a table or its spec row is unreadable
    #[error("schema error: {0}")]
    Schema(String),

    /// IO operation failed (replay log)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl StratumError {
    /// Check if the error is a transient store failure worth retrying
    /// against another replica
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StratumError::Timeout(_)
                | StratumError::Unavailable(_)
                | StratumError::Coordinator(_)
        )
    }

    /// Check if the error came from decoding stored data
    pub fn is_decode(&self) -> bool {
        matches!(
            self,
            StratumError::UnknownDataType(_)
                | StratumError::MalformedRowKey(_)
                | StratumError::Decode(_)
        )
    }
}
