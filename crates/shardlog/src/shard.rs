//! The shard collaborator contract.
//!
//! A shard is a single time-bounded, independently-searchable storage unit.
//! The storage engine behind it is out of scope for the index core and is
//! consumed through [`ShardStore`]; [`ShardFactory`] creates live shards and
//! reopens archived ones during startup recovery.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::id::ShardId;
use crate::types::{Matcher, Message, MessageSink, WriteFormat};

/// Storage-engine contract for a single shard.
///
/// Implementations must be safe under concurrent writers and searchers.
/// Long-running calls observe the cancellation token and stop promptly,
/// returning [`IndexError::Cancelled`](crate::error::IndexError::Cancelled).
pub trait ShardStore: Send + Sync {
    /// Writes one message, addressed by the writer's partition key and
    /// source label set.
    ///
    /// # Errors
    ///
    /// Returns an error if the shard is closed or the write fails.
    fn write(
        &self,
        ctx: &CancellationToken,
        message: &Message,
        shard_key: &str,
        labels: &HashMap<String, String>,
    ) -> Result<()>;

    /// Flushes and finalizes the shard. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if finalization fails; a second call after success
    /// or failure is a no-op.
    fn close(&self) -> Result<()>;

    /// Streams messages matching the predicate within `[from, to]`
    /// (inclusive) to `sink`, ascending by timestamp, or descending when
    /// `reverse` is set.
    ///
    /// # Errors
    ///
    /// Returns the first sink or storage error; partial results already
    /// streamed stand.
    fn search(
        &self,
        ctx: &CancellationToken,
        sink: &mut dyn MessageSink,
        matcher: &Matcher,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        reverse: bool,
    ) -> Result<()>;

    /// Returns the label names known to this shard.
    fn label_names(&self) -> Vec<String>;

    /// Returns the known values for a label in this shard.
    fn label_values(&self, name: &str) -> Vec<String>;
}

/// A time-bounded, independently-searchable storage unit.
///
/// The handle carries the shard's identity, window start, and exclusively
/// owned data directory; all storage behavior lives behind [`ShardStore`].
/// A shard's `shard_start` never changes after creation.
pub struct Shard {
    id: ShardId,
    shard_start: DateTime<Utc>,
    data_dir: PathBuf,
    store: Box<dyn ShardStore>,
}

impl Shard {
    /// Creates a shard handle over the given store.
    #[must_use]
    pub fn new(
        id: ShardId,
        shard_start: DateTime<Utc>,
        data_dir: impl Into<PathBuf>,
        store: Box<dyn ShardStore>,
    ) -> Self {
        Self {
            id,
            shard_start,
            data_dir: data_dir.into(),
            store,
        }
    }

    /// This shard's unique identifier.
    #[must_use]
    pub fn id(&self) -> ShardId {
        self.id
    }

    /// Start of the time window this shard covers.
    #[must_use]
    pub fn shard_start(&self) -> DateTime<Utc> {
        self.shard_start
    }

    /// Filesystem directory exclusively owned by this shard.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Writes one message to this shard.
    ///
    /// # Errors
    ///
    /// Returns whatever error the underlying store reports.
    pub fn write(
        &self,
        ctx: &CancellationToken,
        message: &Message,
        shard_key: &str,
        labels: &HashMap<String, String>,
    ) -> Result<()> {
        self.store.write(ctx, message, shard_key, labels)
    }

    /// Flushes and finalizes this shard. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if finalization fails.
    pub fn close(&self) -> Result<()> {
        self.store.close()
    }

    /// Streams matching messages in time order to `sink`.
    ///
    /// # Errors
    ///
    /// Returns the first sink or storage error.
    pub fn search(
        &self,
        ctx: &CancellationToken,
        sink: &mut dyn MessageSink,
        matcher: &Matcher,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        reverse: bool,
    ) -> Result<()> {
        self.store.search(ctx, sink, matcher, from, to, reverse)
    }

    /// Label names known to this shard.
    #[must_use]
    pub fn label_names(&self) -> Vec<String> {
        self.store.label_names()
    }

    /// Known values for a label in this shard.
    #[must_use]
    pub fn label_values(&self, name: &str) -> Vec<String> {
        self.store.label_values(name)
    }
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("id", &self.id)
            .field("shard_start", &self.shard_start)
            .field("data_dir", &self.data_dir)
            .finish_non_exhaustive()
    }
}

/// Creates live shards and reopens archived ones.
pub trait ShardFactory: Send + Sync {
    /// Creates a new shard for the given window start under `base_dir`.
    ///
    /// The shard's directory is derived from its freshly generated id, so
    /// no two shards ever share a directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the shard cannot be created; the caller's
    /// previously active shard is unaffected.
    fn create(
        &self,
        shard_start: DateTime<Utc>,
        base_dir: &Path,
        writer_id: &str,
        format: WriteFormat,
    ) -> Result<Arc<Shard>>;

    /// Reopens an existing shard directory during startup recovery.
    ///
    /// The window start is recovered from the id's embedded timestamp.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be opened as a shard.
    fn open(&self, id: ShardId, data_dir: &Path) -> Result<Arc<Shard>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStore {
        writes: AtomicUsize,
        closes: AtomicUsize,
    }

    impl CountingStore {
        fn new() -> Self {
            Self {
                writes: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
            }
        }
    }

    impl ShardStore for CountingStore {
        fn write(
            &self,
            _ctx: &CancellationToken,
            _message: &Message,
            _shard_key: &str,
            _labels: &HashMap<String, String>,
        ) -> Result<()> {
            self.writes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn search(
            &self,
            _ctx: &CancellationToken,
            sink: &mut dyn MessageSink,
            _matcher: &Matcher,
            _from: DateTime<Utc>,
            _to: DateTime<Utc>,
            _reverse: bool,
        ) -> Result<()> {
            sink.send(&Message::new(Utc::now(), "stub"))
        }

        fn label_names(&self) -> Vec<String> {
            vec!["job".to_string()]
        }

        fn label_values(&self, _name: &str) -> Vec<String> {
            vec!["api".to_string()]
        }
    }

    fn make_shard(store: CountingStore) -> Shard {
        let start = DateTime::from_timestamp(1_700_000_000, 0).unwrap_or(DateTime::UNIX_EPOCH);
        let id = ShardId::generate(start);
        Shard::new(id, start, format!("/tmp/{id}"), Box::new(store))
    }

    #[test]
    fn shard_delegates_to_store() {
        let shard = make_shard(CountingStore::new());
        let ctx = CancellationToken::new();

        let msg = Message::new(Utc::now(), "hello");
        assert!(shard.write(&ctx, &msg, "api", &HashMap::new()).is_ok());
        assert!(shard.close().is_ok());
        assert!(shard.close().is_ok());

        assert_eq!(shard.label_names(), vec!["job".to_string()]);
        assert_eq!(shard.label_values("job"), vec!["api".to_string()]);
    }

    #[test]
    fn shard_search_streams_to_sink() {
        let shard = make_shard(CountingStore::new());
        let ctx = CancellationToken::new();
        let now = Utc::now();

        let mut got = 0_usize;
        let mut sink = |_: &Message| {
            got += 1;
            Ok(())
        };
        let result = shard.search(&ctx, &mut sink, &crate::types::match_all(), now, now, false);
        assert!(result.is_ok());
        assert_eq!(got, 1);
    }

    #[test]
    fn shard_start_is_fixed_at_creation() {
        let shard = make_shard(CountingStore::new());
        assert_eq!(shard.shard_start(), shard.id().shard_start());
    }
}
