//! Core types for the shard index.
//!
//! This module provides:
//! - [`Message`] — A structured log message with labels
//! - [`Matcher`] — Opaque search predicate
//! - [`MessageSink`] — Streaming receiver for search results
//! - [`WriteFormat`] — Per-shard write format toggles

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A structured log message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// When the message was produced at the source.
    pub timestamp: DateTime<Utc>,
    /// The raw message text.
    pub text: String,
    /// Labels attached to this individual message (on top of the
    /// source-level label set it was written with).
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl Message {
    /// Creates a new message with no labels.
    #[must_use]
    pub fn new(timestamp: DateTime<Utc>, text: impl Into<String>) -> Self {
        Self {
            timestamp,
            text: text.into(),
            labels: HashMap::new(),
        }
    }

    /// Adds a label to this message.
    #[must_use]
    pub fn with_label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(name.into(), value.into());
        self
    }
}

/// Opaque search predicate over messages.
///
/// Query-language parsing happens upstream; the index only ever evaluates
/// the compiled predicate.
pub type Matcher = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// Returns a matcher that accepts every message.
#[must_use]
pub fn match_all() -> Matcher {
    Arc::new(|_| true)
}

/// Streaming receiver for search results.
///
/// Search calls deliver matches one at a time, in time order. Returning an
/// error from [`send`](MessageSink::send) aborts the search and propagates
/// the error to the search caller.
pub trait MessageSink: Send {
    /// Receives one matching message.
    ///
    /// # Errors
    ///
    /// Returns an error to abort the search.
    fn send(&mut self, message: &Message) -> Result<()>;
}

impl<F> MessageSink for F
where
    F: FnMut(&Message) -> Result<()> + Send,
{
    fn send(&mut self, message: &Message) -> Result<()> {
        self(message)
    }
}

/// Write format toggles passed to shard creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteFormat {
    /// Write raw text log lines.
    pub raw: bool,
    /// Write structured (JSON) message records.
    pub structured: bool,
}

impl Default for WriteFormat {
    fn default() -> Self {
        Self {
            raw: true,
            structured: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_builder_labels() {
        let msg = Message::new(Utc::now(), "hello")
            .with_label("job", "api")
            .with_label("instance", "api-0");

        assert_eq!(msg.text, "hello");
        assert_eq!(msg.labels.get("job").map(String::as_str), Some("api"));
        assert_eq!(msg.labels.len(), 2);
    }

    #[test]
    fn message_serde_round_trip() {
        let msg = Message::new(Utc::now(), "payload").with_label("job", "worker");
        let json = serde_json::to_string(&msg).map_err(|e| e.to_string());
        assert!(json.is_ok());

        if let Ok(json) = json {
            let back: std::result::Result<Message, _> = serde_json::from_str(&json);
            assert_eq!(back.ok(), Some(msg));
        }
    }

    #[test]
    fn message_labels_default_when_absent() {
        let json = r#"{"timestamp":"2024-01-01T00:00:00Z","text":"bare"}"#;
        let msg: std::result::Result<Message, _> = serde_json::from_str(json);
        assert!(msg.is_ok());
        if let Ok(msg) = msg {
            assert!(msg.labels.is_empty());
        }
    }

    #[test]
    fn match_all_accepts_everything() {
        let matcher = match_all();
        assert!(matcher(&Message::new(Utc::now(), "")));
        assert!(matcher(&Message::new(Utc::now(), "anything")));
    }

    #[test]
    fn closure_is_a_sink() {
        let mut seen = Vec::new();
        let mut sink = |m: &Message| {
            seen.push(m.text.clone());
            Ok(())
        };

        let msg = Message::new(Utc::now(), "one");
        assert!(MessageSink::send(&mut sink, &msg).is_ok());
        drop(sink);
        assert_eq!(seen, vec!["one".to_string()]);
    }

    #[test]
    fn write_format_defaults_to_both() {
        let format = WriteFormat::default();
        assert!(format.raw);
        assert!(format.structured);
    }
}
