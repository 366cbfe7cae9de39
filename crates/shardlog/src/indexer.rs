//! The queryable index owning the single writable shard.
//!
//! This module provides:
//! - [`Indexer`] — Owns the active shard, the rotation policy, and the
//!   archive of retired shards
//! - [`IndexerConfig`] — Window duration, partition-key labels, formats
//! - [`MessageWriter`] — Per-source write session bound to a partition key
//!
//! Every write checks whether wall-clock time has entered a new window; the
//! first write in a new window rotates the active shard and hands the old
//! one to the archive on a background task.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, DurationRound, Utc};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::archive::{Archive, ArchiveConfig, DEFAULT_SEARCH_GRACE};
use crate::clock::{Clock, SystemClock};
use crate::error::{IndexError, Result};
use crate::shard::{Shard, ShardFactory};
use crate::types::{Matcher, Message, MessageSink, WriteFormat};

/// Substituted for partition-key labels a source does not carry.
const UNKNOWN_LABEL_VALUE: &str = "unknown";

/// Default time window covered by one shard.
pub const DEFAULT_SHARD_DURATION: Duration = Duration::from_secs(60);

/// Configuration for the indexer.
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Base directory that shard directories are created under.
    pub data_dir: PathBuf,
    /// Time window covered by one shard before rotation.
    pub shard_duration: Duration,
    /// Ordered label names whose values form the partition key.
    pub shard_labels: Vec<String>,
    /// Batch size hint for the storage engine (carried configuration; the
    /// core write path writes message-at-a-time).
    pub batch_size: usize,
    /// Write format toggles passed to shard creation.
    pub format: WriteFormat,
    /// Retention for retired shards. `None` retains forever.
    pub retention: Option<Duration>,
    /// Search grace applied by the archive.
    pub search_grace: Duration,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            shard_duration: DEFAULT_SHARD_DURATION,
            shard_labels: vec!["job".to_string()],
            batch_size: 250,
            format: WriteFormat::default(),
            retention: None,
            search_grace: DEFAULT_SEARCH_GRACE,
        }
    }
}

impl IndexerConfig {
    /// Creates a config rooted at the given base directory.
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Sets the shard window duration.
    #[must_use]
    pub const fn with_shard_duration(mut self, duration: Duration) -> Self {
        self.shard_duration = duration;
        self
    }

    /// Sets the ordered label names that form the partition key.
    #[must_use]
    pub fn with_shard_labels(mut self, labels: Vec<String>) -> Self {
        self.shard_labels = labels;
        self
    }

    /// Sets the storage-engine batch size hint.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the write format toggles.
    #[must_use]
    pub const fn with_format(mut self, format: WriteFormat) -> Self {
        self.format = format;
        self
    }

    /// Sets the retention duration for retired shards.
    #[must_use]
    pub const fn with_retention(mut self, retention: Option<Duration>) -> Self {
        self.retention = retention;
        self
    }

    /// Sets the archive's search grace duration.
    #[must_use]
    pub const fn with_search_grace(mut self, grace: Duration) -> Self {
        self.search_grace = grace;
        self
    }
}

/// A queryable, time-sharded index for log messages.
///
/// Owns at most one writable shard at any instant. Writers obtained via
/// [`add_source`](Indexer::add_source) route every message to the current
/// shard, rotating it when the wall clock enters a new window. Retired
/// shards move to the [`Archive`]; searches over history go through
/// [`Indexer::archive`] while [`Indexer::search`] covers the live window.
pub struct Indexer {
    config: IndexerConfig,
    /// Writer identity passed to shard creation.
    id: String,
    clock: Arc<dyn Clock>,
    factory: Arc<dyn ShardFactory>,
    /// The single writable shard, if any write has happened yet.
    active: RwLock<Option<Arc<Shard>>>,
    archive: Arc<Archive>,
    tasks: TaskTracker,
    runtime: tokio::runtime::Handle,
}

impl Indexer {
    /// Creates an indexer, reconstructing archive history from the data
    /// directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the data
    /// directory cannot be prepared.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime context.
    pub fn new(config: IndexerConfig, factory: Arc<dyn ShardFactory>) -> Result<Arc<Self>> {
        Self::with_clock(config, factory, Arc::new(SystemClock))
    }

    /// Creates an indexer with an injected clock.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the data
    /// directory cannot be prepared.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime context.
    pub fn with_clock(
        config: IndexerConfig,
        factory: Arc<dyn ShardFactory>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        window_delta(config.shard_duration)?;

        let archive_config = ArchiveConfig::new(&config.data_dir)
            .with_retention(config.retention)
            .with_search_grace(config.search_grace);
        let archive = Archive::open(archive_config, factory.as_ref(), Arc::clone(&clock))?;

        Ok(Arc::new(Self {
            config,
            id: Uuid::new_v4().to_string(),
            clock,
            factory,
            active: RwLock::new(None),
            archive,
            tasks: TaskTracker::new(),
            runtime: tokio::runtime::Handle::current(),
        }))
    }

    /// Registers a log source, returning a writer bound to its partition
    /// key.
    ///
    /// The partition key joins the source's values for the configured
    /// label names, in order, substituting `"unknown"` for labels the
    /// source does not carry. Pure; performs no I/O.
    #[must_use]
    pub fn add_source(self: &Arc<Self>, labels: &HashMap<String, String>) -> MessageWriter {
        let shard_key = self
            .config
            .shard_labels
            .iter()
            .map(|name| labels.get(name).map_or(UNKNOWN_LABEL_VALUE, String::as_str))
            .collect::<Vec<_>>()
            .join("/");

        MessageWriter {
            indexer: Arc::clone(self),
            shard_key,
            labels: labels.clone(),
        }
    }

    /// The archive holding this indexer's retired shards.
    #[must_use]
    pub fn archive(&self) -> &Arc<Archive> {
        &self.archive
    }

    /// This indexer's writer identity.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The indexer's configuration.
    #[must_use]
    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    /// Start of the window the active shard covers, if one is installed.
    #[must_use]
    pub fn active_shard_start(&self) -> Option<DateTime<Utc>> {
        self.active.read().as_ref().map(|shard| shard.shard_start())
    }

    /// Label names known to the active shard.
    ///
    /// Archived shards are not consulted: label discovery reflects only
    /// the live window.
    #[must_use]
    pub fn labels(&self, _from: DateTime<Utc>, _to: DateTime<Utc>) -> Vec<String> {
        let shard = self.active.read().clone();
        shard.map(|shard| shard.label_names()).unwrap_or_default()
    }

    /// Known values for a label in the active shard, plus the total count.
    ///
    /// When `count` is nonzero the returned list is capped at `count`
    /// values; the second element always reports the total number known.
    /// Archived shards are not consulted.
    #[must_use]
    pub fn label_values(
        &self,
        name: &str,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
        count: usize,
    ) -> (Vec<String>, usize) {
        let shard = self.active.read().clone();
        let mut values = shard.map(|shard| shard.label_values(name)).unwrap_or_default();
        let total = values.len();
        if count > 0 {
            values.truncate(count);
        }
        (values, total)
    }

    /// Searches the active shard for messages in `[from, to]`.
    ///
    /// `count` bounds the number of delivered results (0 = unlimited)
    /// after skipping `offset` matches. History is not consulted here;
    /// range queries over retired shards go through
    /// [`archive`](Indexer::archive), and callers merge the two streams by
    /// message timestamp themselves.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::InvalidTimeRange`] when `to` precedes `from`,
    /// otherwise whatever the shard search reports.
    pub fn search(
        &self,
        ctx: &CancellationToken,
        sink: &mut dyn MessageSink,
        matcher: &Matcher,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        count: u64,
        offset: u64,
        reverse: bool,
    ) -> Result<()> {
        if to < from {
            return Err(IndexError::InvalidTimeRange { from, to });
        }

        let shard = self.active.read().clone();
        let Some(shard) = shard else {
            return Ok(());
        };

        let mut window = WindowedSink {
            inner: sink,
            count,
            offset,
            skipped: 0,
            sent: 0,
        };
        match shard.search(ctx, &mut window, matcher, from, to, reverse) {
            Err(IndexError::LimitReached) => Ok(()),
            other => other,
        }
    }

    /// Closes the active shard, hands it to the archive, and waits for
    /// background work to settle.
    ///
    /// # Errors
    ///
    /// Returns the close error, if any; the shard is archived regardless.
    pub async fn shutdown(self: &Arc<Self>) -> Result<()> {
        let retired = self.active.write().take();
        let mut close_result = Ok(());
        if let Some(shard) = retired {
            close_result = shard.close();
            self.archive.add([shard]);
        }
        self.quiesce().await;
        close_result
    }

    /// Waits for in-flight archival tasks and the archive's own background
    /// work. Test support; production callers normally never wait.
    pub async fn quiesce(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
        self.archive.quiesce().await;
    }

    /// Resolves the shard for the current window, rotating if the window
    /// has advanced.
    fn current_shard(self: &Arc<Self>) -> Result<Arc<Shard>> {
        let shard_start = self.window_start()?;

        {
            let active = self.active.read();
            if let Some(shard) = active.as_ref() {
                if shard.shard_start() >= shard_start {
                    return Ok(Arc::clone(shard));
                }
            }
        }

        self.rotate(shard_start)
    }

    /// Installs a fresh shard for `shard_start`, retiring the previous one.
    ///
    /// Tolerates a concurrent rotation: whoever wins the exclusive lock
    /// creates the shard, later arrivals see it installed and use it. A
    /// creation failure is returned to this caller alone; the previously
    /// active shard stays installed.
    fn rotate(self: &Arc<Self>, shard_start: DateTime<Utc>) -> Result<Arc<Shard>> {
        let (shard, retired) = {
            let mut active = self.active.write();
            if let Some(current) = active.as_ref() {
                if current.shard_start() >= shard_start {
                    return Ok(Arc::clone(current));
                }
            }

            let shard = self.factory.create(
                shard_start,
                &self.config.data_dir,
                &self.id,
                self.config.format,
            )?;
            let retired = active.replace(Arc::clone(&shard));
            (shard, retired)
        };

        debug!(shard = %shard.id(), start = %shard_start, "rotated active shard");

        if let Some(old) = retired {
            let archive = Arc::clone(&self.archive);
            self.tasks.spawn_on(
                async move {
                    let closed = tokio::task::spawn_blocking(move || {
                        if let Err(err) = old.close() {
                            warn!(shard = %old.id(), error = %err, "failed to close retired shard");
                        }
                        old
                    })
                    .await;
                    match closed {
                        Ok(old) => archive.add([old]),
                        Err(err) => warn!(error = %err, "retired shard close task failed"),
                    }
                },
                &self.runtime,
            );
        }

        Ok(shard)
    }

    /// Truncates the current wall-clock time to the window duration.
    fn window_start(&self) -> Result<DateTime<Utc>> {
        let delta = window_delta(self.config.shard_duration)?;
        self.clock
            .now()
            .duration_trunc(delta)
            .map_err(|err| IndexError::InvalidConfig(format!("shard duration: {err}")))
    }
}

/// Validates and converts the window duration for truncation.
fn window_delta(duration: Duration) -> Result<chrono::Duration> {
    if duration.is_zero() {
        return Err(IndexError::InvalidConfig(
            "shard duration must be nonzero".to_string(),
        ));
    }
    chrono::Duration::from_std(duration)
        .map_err(|err| IndexError::InvalidConfig(format!("shard duration: {err}")))
}

/// A per-source write session.
///
/// Bound once to a partition key and label set; always resolves the
/// current active shard at write time, so it stays valid across
/// rotations.
pub struct MessageWriter {
    indexer: Arc<Indexer>,
    shard_key: String,
    labels: HashMap<String, String>,
}

impl MessageWriter {
    /// Writes one message, rotating the active shard first if the wall
    /// clock has entered a new window.
    ///
    /// # Errors
    ///
    /// Returns a rotation failure (shard creation) or whatever the shard
    /// write reports; no retry is attempted.
    pub fn write_message(&self, ctx: &CancellationToken, message: &Message) -> Result<()> {
        let shard = self.indexer.current_shard()?;
        shard.write(ctx, message, &self.shard_key, &self.labels)
    }

    /// The partition key this writer is bound to.
    #[must_use]
    pub fn shard_key(&self) -> &str {
        &self.shard_key
    }

    /// The source label set this writer was registered with.
    #[must_use]
    pub fn labels(&self) -> &HashMap<String, String> {
        &self.labels
    }
}

/// Applies `offset`/`count` windowing in front of a caller sink.
///
/// Once `count` results have been delivered the next send reports
/// [`IndexError::LimitReached`], stopping the shard search early; the
/// caller maps that signal to success.
struct WindowedSink<'a> {
    inner: &'a mut dyn MessageSink,
    count: u64,
    offset: u64,
    skipped: u64,
    sent: u64,
}

impl MessageSink for WindowedSink<'_> {
    fn send(&mut self, message: &Message) -> Result<()> {
        if self.skipped < self.offset {
            self.skipped += 1;
            return Ok(());
        }
        if self.count > 0 && self.sent >= self.count {
            return Err(IndexError::LimitReached);
        }
        self.inner.send(message)?;
        self.sent += 1;
        Ok(())
    }
}
