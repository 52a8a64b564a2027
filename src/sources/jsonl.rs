//! JSON-lines inbox export as a [`MessageSource`].
//!
//! One message per line: `{"body": "...", "date": <epoch millis>}`.
//! Blank lines are ignored and malformed lines are skipped with a warning.
//! Messages are returned newest first.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::SourceError;
use crate::pipeline::types::{MessageSource, RawMessage};

/// One exported message.
#[derive(Debug, Deserialize)]
struct InboxLine {
    body: String,
    date: i64,
}

/// Reads raw messages from a JSON-lines export file.
pub struct JsonlFileSource {
    path: PathBuf,
}

impl JsonlFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Parse an export, skipping lines that are not valid messages.
pub fn parse_inbox(contents: &str) -> Vec<RawMessage> {
    let mut messages: Vec<RawMessage> = contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .filter_map(|(idx, line)| match serde_json::from_str::<InboxLine>(line) {
            Ok(entry) => Some(RawMessage::from_millis(entry.body, entry.date)),
            Err(e) => {
                warn!(line = idx + 1, "Skipping malformed inbox line: {e}");
                None
            }
        })
        .collect();

    messages.sort_by(|a, b| b.received_at.cmp(&a.received_at));
    messages
}

#[async_trait]
impl MessageSource for JsonlFileSource {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn fetch_raw(&self) -> Result<Vec<RawMessage>, SourceError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Inbox export missing, nothing to read");
                return Ok(Vec::new());
            }
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                return Err(SourceError::PermissionDenied(format!(
                    "{}: {e}",
                    self.path.display()
                )));
            }
            Err(e) => return Err(SourceError::Io(e)),
        };

        let messages = parse_inbox(&contents);
        debug!(path = %self.path.display(), count = messages.len(), "Read inbox export");
        Ok(messages)
    }
}
