//! Append-only change log for the history panel.
//!
//! Entries are kept in receipt order. The log is diagnostic: it is never used
//! to rebuild a buffer authoritatively, and receipt order is not a causal
//! order across authors.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use crate::change::{replay, ChangeRecord};
use crate::now_millis;

/// One row of the change log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Room sequence number assigned by the relay; `None` for local edits.
    pub relay_seq: Option<u64>,
    /// Milliseconds since the Unix epoch at which the entry was recorded.
    pub received_at: u64,
    pub change: ChangeRecord,
}

impl LogEntry {
    /// Entry for an edit made in this client.
    pub fn local(change: ChangeRecord) -> Self {
        Self {
            relay_seq: None,
            received_at: now_millis(),
            change,
        }
    }

    /// Entry stamped by the relay.
    pub fn relayed(relay_seq: u64, change: ChangeRecord) -> Self {
        Self {
            relay_seq: Some(relay_seq),
            received_at: now_millis(),
            change,
        }
    }

    fn key(&self) -> (Uuid, Uuid, u64) {
        (self.change.file_id, self.change.author_id, self.change.timestamp)
    }
}

/// Client-side history of applied change records.
#[derive(Debug, Default)]
pub struct ChangeLog {
    entries: Vec<LogEntry>,
    seen: HashSet<(Uuid, Uuid, u64)>,
}

impl ChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one entry at the end.
    pub fn append(&mut self, entry: LogEntry) {
        self.seen.insert(entry.key());
        self.entries.push(entry);
    }

    /// Append fetched entries that are not already present.
    ///
    /// An entry is identified by (file, author, timestamp), which is unique
    /// because author timestamps are strictly increasing. Returns how many
    /// entries were added.
    pub fn extend_missing(&mut self, entries: impl IntoIterator<Item = LogEntry>) -> usize {
        let mut added = 0;
        for entry in entries {
            if self.seen.insert(entry.key()) {
                self.entries.push(entry);
                added += 1;
            }
        }
        added
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&LogEntry> {
        self.entries.last()
    }

    pub fn for_file(&self, file_id: Uuid) -> impl Iterator<Item = &LogEntry> + '_ {
        self.entries.iter().filter(move |e| e.change.file_id == file_id)
    }

    pub fn by_author(&self, author_id: Uuid) -> impl Iterator<Item = &LogEntry> + '_ {
        self.entries.iter().filter(move |e| e.change.author_id == author_id)
    }

    /// Re-apply every logged change for `file_id` on top of `base`.
    pub fn replay(&self, file_id: Uuid, base: &str) -> String {
        replay(base, self.for_file(file_id).map(|e| &e.change))
    }
}
