//! # shardlog
//!
//! Time-sharded log storage with a queryable index and archive.
//!
//! This crate provides:
//!
//! - [`Indexer`] — Owns the single writable shard and the rotation policy
//! - [`MessageWriter`] — Per-source write session bound to a partition key
//! - [`Archive`] — Retired shards, retention pruning, history search
//! - [`Shard`] / [`ShardStore`] — The storage-engine seam for one time window
//! - [`FileShardStore`] — JSON-lines file engine behind that seam
//! - [`Message`] / [`Matcher`] / [`MessageSink`] — The search data path
//!
//! Writes land in the shard covering the current time window; the first
//! write in a new window rotates the active shard and retires the old one
//! to the archive, where retention pruning eventually deletes it.
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//! use shardlog::{IndexerConfig, Message, WriteFormat};
//! use chrono::Utc;
//!
//! // Shards cover five-minute windows, kept for a week.
//! let config = IndexerConfig::new("/var/lib/shardlog")
//!     .with_shard_duration(Duration::from_secs(300))
//!     .with_retention(Some(Duration::from_secs(7 * 24 * 3600)))
//!     .with_shard_labels(vec!["job".to_string(), "instance".to_string()]);
//!
//! let message = Message::new(Utc::now(), "request handled")
//!     .with_label("status", "200");
//! assert_eq!(message.labels.get("status").map(String::as_str), Some("200"));
//! assert!(config.format == WriteFormat::default());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod archive;
pub mod clock;
pub mod error;
pub mod file_shard;
pub mod id;
pub mod indexer;
pub mod shard;
pub mod types;

// Re-export main types
pub use archive::{Archive, ArchiveConfig, RemoteArchiveConfig, DEFAULT_SEARCH_GRACE};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{IndexError, Result};
pub use file_shard::{FileShardFactory, FileShardStore};
pub use id::{IdGenerator, RandomIdGenerator, ShardId};
pub use indexer::{Indexer, IndexerConfig, MessageWriter, DEFAULT_SHARD_DURATION};
pub use shard::{Shard, ShardFactory, ShardStore};
pub use types::{match_all, Matcher, Message, MessageSink, WriteFormat};
