//! Time-sortable shard identifiers.
//!
//! This module provides:
//! - [`ShardId`] — Globally unique identifier with an embedded generation
//!   timestamp, sortable in time order
//! - [`IdGenerator`] — Injectable identity-generation service
//!
//! A shard's directory is named by its id, so a cold start can recover the
//! shard's window start from the directory name alone.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use uuid::{NoContext, Timestamp, Uuid};

use crate::error::IndexError;

/// Globally unique, time-sortable shard identifier.
///
/// Backed by a UUIDv7: the leading bits carry the shard's window-start
/// timestamp at millisecond precision, the rest is random. Byte order (and
/// therefore the derived `Ord`) equals time order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShardId(Uuid);

impl ShardId {
    /// Creates an id embedding the given window-start timestamp, with fresh
    /// randomness in the remaining bits.
    #[must_use]
    pub fn generate(shard_start: DateTime<Utc>) -> Self {
        let secs = u64::try_from(shard_start.timestamp()).unwrap_or(0);
        let nanos = shard_start.timestamp_subsec_nanos();
        Self(Uuid::new_v7(Timestamp::from_unix(NoContext, secs, nanos)))
    }

    /// Returns the window-start timestamp embedded in this id.
    ///
    /// Millisecond precision: sub-millisecond components of the original
    /// timestamp are not preserved.
    #[must_use]
    pub fn shard_start(&self) -> DateTime<Utc> {
        self.0
            .get_timestamp()
            .and_then(|ts| {
                let (secs, nanos) = ts.to_unix();
                DateTime::from_timestamp(i64::try_from(secs).ok()?, nanos)
            })
            .unwrap_or(DateTime::UNIX_EPOCH)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ShardId {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::parse_str(s).map_err(|_| IndexError::InvalidShardId(s.to_string()))?;
        if uuid.get_version_num() != 7 {
            return Err(IndexError::InvalidShardId(s.to_string()));
        }
        Ok(Self(uuid))
    }
}

/// Injectable identity-generation service.
///
/// Production code uses [`RandomIdGenerator`]; tests can substitute a
/// deterministic implementation.
pub trait IdGenerator: Send + Sync {
    /// Generates a new shard id embedding the given window start.
    fn shard_id(&self, shard_start: DateTime<Utc>) -> ShardId;
}

/// Default generator: fresh randomness per id.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIdGenerator;

impl IdGenerator for RandomIdGenerator {
    fn shard_id(&self, shard_start: DateTime<Utc>) -> ShardId {
        ShardId::generate(shard_start)
    }
}
