//! Durable history of retired shards.
//!
//! This module provides:
//! - [`Archive`] — Time-indexed history of retired shards with retention
//!   pruning and multi-shard search fan-out
//! - [`ArchiveConfig`] — Retention, search grace, and optional offline
//!   archival settings
//!
//! The history is a single ordered map from window start to the shards
//! retired under that start, so the ascending time index is the map's key
//! set by construction. Pruning and on-disk deletion run as background
//! tasks that never block the caller that triggered them.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::id::ShardId;
use crate::shard::{Shard, ShardFactory};
use crate::types::{Matcher, MessageSink};

/// Default extra margin applied to search ranges to tolerate clock skew
/// near shard boundaries.
pub const DEFAULT_SEARCH_GRACE: Duration = Duration::from_secs(15 * 60);

/// Remote archival target for retired shards.
///
/// Carried configuration for an external archival collaborator; the archive
/// itself does not upload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteArchiveConfig {
    /// Backend kind (e.g. "s3", "gcs", "local").
    pub kind: String,
    /// Backend-specific parameters (bucket, region, credentials reference).
    pub params: HashMap<String, String>,
}

/// Configuration for the shard archive.
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// Base directory holding one subdirectory per shard.
    pub data_dir: PathBuf,
    /// Maximum age of a retired shard before pruning. `None` retains
    /// forever.
    pub retention: Option<Duration>,
    /// Extra margin added to search ranges for clock-skew tolerance.
    pub search_grace: Duration,
    /// Optional remote archival target for retired shards.
    pub remote: Option<RemoteArchiveConfig>,
    /// Optional encryption recipients for offline archival.
    pub encrypt_to: Vec<String>,
    /// Optional compression level for offline archival.
    pub compression_level: Option<u32>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            retention: None,
            search_grace: DEFAULT_SEARCH_GRACE,
            remote: None,
            encrypt_to: Vec::new(),
            compression_level: None,
        }
    }
}

impl ArchiveConfig {
    /// Creates a config rooted at the given base directory.
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Sets the retention duration. `None` retains forever.
    #[must_use]
    pub const fn with_retention(mut self, retention: Option<Duration>) -> Self {
        self.retention = retention;
        self
    }

    /// Sets the search grace duration.
    #[must_use]
    pub const fn with_search_grace(mut self, grace: Duration) -> Self {
        self.search_grace = grace;
        self
    }

    /// Sets the remote archival target.
    #[must_use]
    pub fn with_remote(mut self, remote: RemoteArchiveConfig) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Sets the encryption recipients for offline archival.
    #[must_use]
    pub fn with_encrypt_to(mut self, recipients: Vec<String>) -> Self {
        self.encrypt_to = recipients;
        self
    }

    /// Sets the compression level for offline archival.
    #[must_use]
    pub const fn with_compression_level(mut self, level: u32) -> Self {
        self.compression_level = Some(level);
        self
    }
}

/// Time-indexed history of retired shards.
///
/// Shards retired under the same window start accumulate in insertion order
/// (a restart creates a fresh shard for a window without observing prior
/// ones). Background pruning and deletion are spawned onto the ambient
/// Tokio runtime; [`Archive::add`] and [`Archive::prune`] must therefore be
/// called within a runtime context.
pub struct Archive {
    config: ArchiveConfig,
    clock: Arc<dyn Clock>,
    /// Window start → retired shards, ascending by key.
    history: RwLock<BTreeMap<DateTime<Utc>, Vec<Arc<Shard>>>>,
    tasks: TaskTracker,
    /// Runtime that background tasks are spawned onto, captured at
    /// construction so writers on non-runtime threads can trigger them.
    runtime: tokio::runtime::Handle,
}

impl Archive {
    /// Creates an empty archive without scanning the data directory.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime context.
    #[must_use]
    pub fn new(config: ArchiveConfig) -> Arc<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates an empty archive with an injected clock.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime context.
    #[must_use]
    pub fn with_clock(config: ArchiveConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            config,
            clock,
            history: RwLock::new(BTreeMap::new()),
            tasks: TaskTracker::new(),
            runtime: tokio::runtime::Handle::current(),
        })
    }

    /// Opens the archive, reconstructing history from the data directory.
    ///
    /// Each immediate subdirectory whose name parses as a [`ShardId`] is
    /// reopened via the factory, recovering its window start from the id's
    /// embedded timestamp. Non-directories, unparseable names, and shards
    /// that fail to reopen are skipped with a warning; they never abort the
    /// scan and are not recursed into.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory cannot be created or read.
    pub fn open(
        config: ArchiveConfig,
        factory: &dyn ShardFactory,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        fs::create_dir_all(&config.data_dir)?;

        let mut recovered = Vec::new();
        for entry in fs::read_dir(&config.data_dir)? {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Ok(id) = name.parse::<ShardId>() else {
                warn!(entry = %name, "skipping unrecognized entry in archive directory");
                continue;
            };
            match factory.open(id, &path) {
                Ok(shard) => {
                    debug!(shard = %id, start = %shard.shard_start(), "recovered archived shard");
                    recovered.push(shard);
                }
                Err(err) => {
                    warn!(shard = %id, error = %err, "failed to reopen archived shard, skipping");
                }
            }
        }

        let archive = Self::with_clock(config, clock);
        {
            let mut history = archive.history.write();
            for shard in recovered {
                history.entry(shard.shard_start()).or_default().push(shard);
            }
        }
        Ok(archive)
    }

    /// Moves retired shards into the history and schedules a prune pass.
    ///
    /// Never blocks on shard deletion; the prune runs as a background task.
    pub fn add(self: &Arc<Self>, shards: impl IntoIterator<Item = Arc<Shard>>) {
        {
            let mut history = self.history.write();
            for shard in shards {
                debug!(shard = %shard.id(), start = %shard.shard_start(), "adding shard to archive history");
                history.entry(shard.shard_start()).or_default().push(shard);
            }
        }

        let archive = Arc::clone(self);
        self.tasks
            .spawn_on(async move { archive.prune() }, &self.runtime);
    }

    /// Returns the shard sets whose window start falls in `[from, to]`,
    /// ascending, including the first set strictly after `to`.
    fn find_shards(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<Vec<Arc<Shard>>> {
        debug!(%from, %to, "searching for archived shards");
        let history = self.history.read();

        let mut sets = Vec::new();
        for (start, set) in history.iter() {
            if *start < from {
                continue;
            }
            sets.push(set.clone());
            if *start > to {
                break;
            }
        }
        sets
    }

    /// Searches the archived history for messages in `[from, to]`.
    ///
    /// Shard discovery widens the range to `[from - 2*grace, to + grace]`
    /// (clamped to the representable time extremes) to catch shards whose
    /// start drifted across the window boundary through clock skew; each
    /// shard is then searched with the original range. Shard sets are visited ascending by window start, shards
    /// within a set in insertion order; `reverse` only affects ordering
    /// within a single shard.
    ///
    /// Fail-fast: the first shard error aborts the fan-out and is returned.
    /// Results already streamed to the sink stand.
    ///
    /// # Errors
    ///
    /// Returns the first per-shard search error, or [`IndexError::Cancelled`]
    /// (via the shard) when the token is cancelled.
    ///
    /// [`IndexError::Cancelled`]: crate::error::IndexError::Cancelled
    pub fn search(
        &self,
        ctx: &CancellationToken,
        sink: &mut dyn MessageSink,
        matcher: &Matcher,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        reverse: bool,
    ) -> Result<()> {
        let grace = chrono::Duration::from_std(self.config.search_grace)
            .unwrap_or_else(|_| chrono::Duration::zero());
        // Clamp at the representable extremes so widening never overflows.
        let widened_from = from
            .checked_sub_signed(grace)
            .and_then(|t| t.checked_sub_signed(grace))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let widened_to = to
            .checked_add_signed(grace)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let sets = self.find_shards(widened_from, widened_to);
        debug!(sets = sets.len(), "found archived shard sets");

        for set in &sets {
            for shard in set {
                shard.search(ctx, sink, matcher, from, to, reverse)?;
            }
        }
        Ok(())
    }

    /// Prunes shards older than the retention horizon.
    ///
    /// No-op when retention is unset. Every shard whose window start is at
    /// or before `now - retention` is removed from the index; its on-disk
    /// data is deleted by a background task, best-effort. Deletion failures
    /// are logged and never reinstate the shard.
    pub fn prune(&self) {
        let Some(retention) = self.config.retention else {
            debug!("shard pruning is disabled");
            return;
        };
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            warn!("retention duration out of range, skipping prune");
            return;
        };

        // A horizon before representable time means nothing can be stale.
        let Some(pivot) = self.clock.now().checked_sub_signed(retention) else {
            debug!("retention horizon precedes representable time, skipping prune");
            return;
        };
        let removed: Vec<Arc<Shard>> = {
            let mut history = self.history.write();
            let old_keys: Vec<DateTime<Utc>> =
                history.range(..=pivot).map(|(start, _)| *start).collect();
            old_keys
                .into_iter()
                .filter_map(|start| history.remove(&start))
                .flatten()
                .collect()
        };

        if removed.is_empty() {
            return;
        }
        debug!(count = removed.len(), %pivot, "pruning shards past retention");
        self.tasks
            .spawn_blocking_on(move || delete_shards(&removed), &self.runtime);
    }

    /// Window starts currently present in the history, ascending.
    #[must_use]
    pub fn shard_starts(&self) -> Vec<DateTime<Utc>> {
        self.history.read().keys().copied().collect()
    }

    /// Total number of shards across all window starts.
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.history.read().values().map(Vec::len).sum()
    }

    /// Returns true if no shards are archived.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.history.read().is_empty()
    }

    /// The shards retired under the given window start, insertion order.
    #[must_use]
    pub fn shards_at(&self, start: DateTime<Utc>) -> Vec<Arc<Shard>> {
        self.history.read().get(&start).cloned().unwrap_or_default()
    }

    /// The archive's configuration.
    #[must_use]
    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    /// Waits for all in-flight background tasks (pruning, deletion).
    ///
    /// Test support for the fire-and-forget task model; production callers
    /// normally never wait.
    pub async fn quiesce(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }
}

/// Deletes retired shard directories, best-effort.
fn delete_shards(shards: &[Arc<Shard>]) {
    for shard in shards {
        match fs::remove_dir_all(shard.data_dir()) {
            Ok(()) => debug!(shard = %shard.id(), "deleted pruned shard data"),
            Err(err) => {
                warn!(shard = %shard.id(), dir = %shard.data_dir().display(), error = %err,
                    "failed to delete pruned shard data");
            }
        }
    }
}
