//! Error types for the shard index.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur in the shard index.
#[derive(Debug, Error)]
pub enum IndexError {
    /// A search was requested with `to` before `from`.
    #[error("time to ({to}) must not be before time from ({from})")]
    InvalidTimeRange {
        /// Start of the requested range.
        from: DateTime<Utc>,
        /// End of the requested range.
        to: DateTime<Utc>,
    },

    /// The index or archive configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A write or search hit a shard that has already been closed.
    #[error("shard is closed")]
    ShardClosed,

    /// A directory name could not be parsed as a shard identifier.
    #[error("invalid shard id: {0}")]
    InvalidShardId(String),

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation was cancelled via its cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// A count-bounded search delivered its full quota.
    ///
    /// Internal control signal: shard searches return this to stop the
    /// fan-out early; it is swallowed before reaching the caller.
    #[error("search result limit reached")]
    LimitReached,
}

/// Result type alias for index operations.
pub type Result<T> = std::result::Result<T, IndexError>;
