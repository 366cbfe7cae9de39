//! Reference file-backed shard engine.
//!
//! This module provides:
//! - [`FileShardStore`] — JSON-lines storage for one shard
//! - [`FileShardFactory`] — Creates and reopens file-backed shards
//!
//! Each partition key maps to a subdirectory of the shard directory holding
//! `messages.jsonl` (structured records) and/or `raw.log` (plain text),
//! per the shard's [`WriteFormat`]. Search scans the JSON-lines files,
//! filters by time range and predicate, and streams in timestamp order.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{IndexError, Result};
use crate::id::{IdGenerator, RandomIdGenerator, ShardId};
use crate::shard::{Shard, ShardFactory, ShardStore};
use crate::types::{Matcher, Message, MessageSink, WriteFormat};

/// File name for structured message records within a partition directory.
const MESSAGES_FILE: &str = "messages.jsonl";
/// File name for raw text lines within a partition directory.
const RAW_FILE: &str = "raw.log";

/// JSON-lines storage engine for a single shard.
pub struct FileShardStore {
    data_dir: PathBuf,
    writer_id: String,
    format: WriteFormat,
    /// Label name → known values, built from writes to this shard.
    labels: RwLock<BTreeMap<String, BTreeSet<String>>>,
    closed: AtomicBool,
}

impl FileShardStore {
    /// Creates the store for a freshly created shard directory.
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>, writer_id: impl Into<String>, format: WriteFormat) -> Self {
        Self {
            data_dir: data_dir.into(),
            writer_id: writer_id.into(),
            format,
            labels: RwLock::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Reopens an archived shard directory.
    ///
    /// Reopened shards are read-only: the write path reports the shard as
    /// closed, while search remains available.
    #[must_use]
    pub fn open(data_dir: impl Into<PathBuf>) -> Self {
        let store = Self::new(data_dir, String::new(), WriteFormat::default());
        store.closed.store(true, Ordering::Release);
        store
    }

    fn append_line(path: &Path, line: &str) -> Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    /// Collects every `messages.jsonl` under the shard directory.
    fn message_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut pending = vec![self.data_dir.clone()];
        while let Some(dir) = pending.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            for entry in entries.filter_map(std::result::Result::ok) {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                } else if path.file_name().is_some_and(|n| n == MESSAGES_FILE) {
                    files.push(path);
                }
            }
        }
        files.sort();
        Ok(files)
    }
}

impl ShardStore for FileShardStore {
    fn write(
        &self,
        ctx: &CancellationToken,
        message: &Message,
        shard_key: &str,
        labels: &HashMap<String, String>,
    ) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(IndexError::ShardClosed);
        }
        if ctx.is_cancelled() {
            return Err(IndexError::Cancelled);
        }

        let partition_dir = self.data_dir.join(shard_key);
        fs::create_dir_all(&partition_dir)?;

        if self.format.structured {
            let json = serde_json::to_string(message)?;
            Self::append_line(&partition_dir.join(MESSAGES_FILE), &json)?;
        }
        if self.format.raw {
            Self::append_line(&partition_dir.join(RAW_FILE), &message.text)?;
        }

        let mut index = self.labels.write();
        for (name, value) in labels.iter().chain(message.labels.iter()) {
            index
                .entry(name.clone())
                .or_default()
                .insert(value.clone());
        }

        Ok(())
    }

    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(dir = %self.data_dir.display(), writer = %self.writer_id, "closed shard store");
        }
        Ok(())
    }

    fn search(
        &self,
        ctx: &CancellationToken,
        sink: &mut dyn MessageSink,
        matcher: &Matcher,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        reverse: bool,
    ) -> Result<()> {
        let mut matches = Vec::new();

        for path in self.message_files()? {
            if ctx.is_cancelled() {
                return Err(IndexError::Cancelled);
            }
            let file = fs::File::open(&path)?;
            for line in BufReader::new(file).lines() {
                let line = line?;
                let Ok(message) = serde_json::from_str::<Message>(&line) else {
                    debug!(path = %path.display(), "skipping malformed message record");
                    continue;
                };
                if message.timestamp >= from && message.timestamp <= to && matcher(&message) {
                    matches.push(message);
                }
            }
        }

        matches.sort_by_key(|m| m.timestamp);
        if reverse {
            matches.reverse();
        }

        for message in &matches {
            if ctx.is_cancelled() {
                return Err(IndexError::Cancelled);
            }
            sink.send(message)?;
        }

        Ok(())
    }

    fn label_names(&self) -> Vec<String> {
        self.labels.read().keys().cloned().collect()
    }

    fn label_values(&self, name: &str) -> Vec<String> {
        self.labels
            .read()
            .get(name)
            .map(|values| values.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Factory for file-backed shards.
pub struct FileShardFactory {
    ids: Arc<dyn IdGenerator>,
}

impl Default for FileShardFactory {
    fn default() -> Self {
        Self::new(Arc::new(RandomIdGenerator))
    }
}

impl FileShardFactory {
    /// Creates a factory using the given identity generator.
    #[must_use]
    pub fn new(ids: Arc<dyn IdGenerator>) -> Self {
        Self { ids }
    }
}

impl ShardFactory for FileShardFactory {
    fn create(
        &self,
        shard_start: DateTime<Utc>,
        base_dir: &Path,
        writer_id: &str,
        format: WriteFormat,
    ) -> Result<Arc<Shard>> {
        let id = self.ids.shard_id(shard_start);
        let data_dir = base_dir.join(id.to_string());
        fs::create_dir_all(&data_dir)?;
        debug!(shard = %id, start = %shard_start, dir = %data_dir.display(), "created shard");

        let store = FileShardStore::new(&data_dir, writer_id, format);
        Ok(Arc::new(Shard::new(id, shard_start, data_dir, Box::new(store))))
    }

    fn open(&self, id: ShardId, data_dir: &Path) -> Result<Arc<Shard>> {
        if !data_dir.is_dir() {
            return Err(IndexError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("shard directory missing: {}", data_dir.display()),
            )));
        }
        let store = FileShardStore::open(data_dir);
        Ok(Arc::new(Shard::new(
            id,
            id.shard_start(),
            data_dir,
            Box::new(store),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::match_all;
    use test_case::test_case;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::UNIX_EPOCH)
    }

    fn collect(
        store: &FileShardStore,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        reverse: bool,
    ) -> Result<Vec<String>> {
        let ctx = CancellationToken::new();
        let mut texts = Vec::new();
        let mut sink = |m: &Message| {
            texts.push(m.text.clone());
            Ok(())
        };
        store.search(&ctx, &mut sink, &match_all(), from, to, reverse)?;
        drop(sink);
        Ok(texts)
    }

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn write_then_search_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileShardStore::new(dir.path(), "writer-1", WriteFormat::default());
        let ctx = CancellationToken::new();

        for (secs, text) in [(100, "first"), (200, "second"), (150, "middle")] {
            let msg = Message::new(ts(secs), text);
            store
                .write(&ctx, &msg, "api", &labels(&[("job", "api")]))
                .expect("write");
        }

        let texts = collect(&store, ts(0), ts(1000), false).expect("search");
        assert_eq!(texts, vec!["first", "middle", "second"]);

        let texts = collect(&store, ts(0), ts(1000), true).expect("search");
        assert_eq!(texts, vec!["second", "middle", "first"]);
    }

    #[test]
    fn search_range_is_inclusive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileShardStore::new(dir.path(), "writer-1", WriteFormat::default());
        let ctx = CancellationToken::new();

        for secs in [100, 200, 300] {
            let msg = Message::new(ts(secs), format!("m{secs}"));
            store.write(&ctx, &msg, "api", &HashMap::new()).expect("write");
        }

        let texts = collect(&store, ts(100), ts(200), false).expect("search");
        assert_eq!(texts, vec!["m100", "m200"]);

        // Point query at an exact timestamp.
        let texts = collect(&store, ts(200), ts(200), false).expect("search");
        assert_eq!(texts, vec!["m200"]);
    }

    #[test]
    fn search_applies_matcher() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileShardStore::new(dir.path(), "writer-1", WriteFormat::default());
        let ctx = CancellationToken::new();

        for text in ["keep this", "drop that"] {
            let msg = Message::new(ts(100), text);
            store.write(&ctx, &msg, "api", &HashMap::new()).expect("write");
        }

        let matcher: Matcher = Arc::new(|m: &Message| m.text.starts_with("keep"));
        let mut texts = Vec::new();
        let mut sink = |m: &Message| {
            texts.push(m.text.clone());
            Ok(())
        };
        store
            .search(&ctx, &mut sink, &matcher, ts(0), ts(1000), false)
            .expect("search");
        drop(sink);
        assert_eq!(texts, vec!["keep this"]);
    }

    #[test_case(true, true ; "raw and structured")]
    #[test_case(true, false ; "raw only")]
    #[test_case(false, true ; "structured only")]
    #[test_case(false, false ; "neither")]
    fn format_controls_which_files_are_written(raw: bool, structured: bool) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileShardStore::new(dir.path(), "writer-1", WriteFormat { raw, structured });
        let ctx = CancellationToken::new();

        let msg = Message::new(ts(100), "payload");
        store.write(&ctx, &msg, "api", &HashMap::new()).expect("write");

        assert_eq!(dir.path().join("api").join(RAW_FILE).exists(), raw);
        assert_eq!(
            dir.path().join("api").join(MESSAGES_FILE).exists(),
            structured
        );

        // Only structured records are searchable.
        let texts = collect(&store, ts(0), ts(1000), false).expect("search");
        assert_eq!(!texts.is_empty(), structured);
    }

    #[test]
    fn partition_key_maps_to_nested_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileShardStore::new(dir.path(), "writer-1", WriteFormat::default());
        let ctx = CancellationToken::new();

        let msg = Message::new(ts(100), "nested");
        store
            .write(&ctx, &msg, "api/us-east/pod-1", &HashMap::new())
            .expect("write");

        assert!(dir
            .path()
            .join("api")
            .join("us-east")
            .join("pod-1")
            .join(MESSAGES_FILE)
            .exists());

        let texts = collect(&store, ts(0), ts(1000), false).expect("search");
        assert_eq!(texts, vec!["nested"]);
    }

    #[test]
    fn labels_track_source_and_message_labels() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileShardStore::new(dir.path(), "writer-1", WriteFormat::default());
        let ctx = CancellationToken::new();

        let msg = Message::new(ts(100), "hello").with_label("level", "info");
        store
            .write(&ctx, &msg, "api", &labels(&[("job", "api"), ("instance", "api-0")]))
            .expect("write");

        let mut names = store.label_names();
        names.sort();
        assert_eq!(names, vec!["instance", "job", "level"]);
        assert_eq!(store.label_values("job"), vec!["api"]);
        assert!(store.label_values("missing").is_empty());
    }

    #[test]
    fn closed_store_rejects_writes_but_still_searches() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileShardStore::new(dir.path(), "writer-1", WriteFormat::default());
        let ctx = CancellationToken::new();

        let msg = Message::new(ts(100), "before close");
        store.write(&ctx, &msg, "api", &HashMap::new()).expect("write");

        store.close().expect("close");
        store.close().expect("close is idempotent");

        let late = Message::new(ts(200), "after close");
        let result = store.write(&ctx, &late, "api", &HashMap::new());
        assert!(matches!(result, Err(IndexError::ShardClosed)));

        let texts = collect(&store, ts(0), ts(1000), false).expect("search");
        assert_eq!(texts, vec!["before close"]);
    }

    #[test]
    fn cancelled_context_stops_search() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileShardStore::new(dir.path(), "writer-1", WriteFormat::default());
        let ctx = CancellationToken::new();

        let msg = Message::new(ts(100), "unreachable");
        store.write(&ctx, &msg, "api", &HashMap::new()).expect("write");

        ctx.cancel();
        let mut sink = |_: &Message| Ok(());
        let result = store.search(&ctx, &mut sink, &match_all(), ts(0), ts(1000), false);
        assert!(matches!(result, Err(IndexError::Cancelled)));
    }

    #[test]
    fn factory_create_then_open_recovers_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        let factory = FileShardFactory::default();
        let start = ts(1_700_000_000);

        let shard = factory
            .create(start, dir.path(), "writer-1", WriteFormat::default())
            .expect("create");
        assert_eq!(shard.shard_start(), start);
        assert!(shard.data_dir().is_dir());

        let reopened = factory.open(shard.id(), shard.data_dir()).expect("open");
        assert_eq!(reopened.shard_start(), start);
        assert_eq!(reopened.id(), shard.id());

        // Reopened shards are read-only.
        let ctx = CancellationToken::new();
        let msg = Message::new(start, "too late");
        let result = reopened.write(&ctx, &msg, "api", &HashMap::new());
        assert!(matches!(result, Err(IndexError::ShardClosed)));
    }

    #[test]
    fn factory_open_missing_directory_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let factory = FileShardFactory::default();
        let id = ShardId::generate(ts(1_700_000_000));

        let result = factory.open(id, &dir.path().join("nope"));
        assert!(result.is_err());
    }
}
