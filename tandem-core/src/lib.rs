//! # tandem-core: Text model for collaborative editing
//!
//! Plain, transport-agnostic types shared by every tandem component:
//!
//! - [`Position`]: `(line, ch)` coordinates inside a file
//! - [`TextBuffer`]: line-oriented text with range replacement
//! - [`ChangeRecord`]: the wire/storage shape of one local edit
//! - [`ChangeLog`]: append-only history of applied changes
//!
//! ```text
//! keystroke ──► TextBuffer::replace_range ──► BufferChange
//!                                                │
//!                                                ▼
//!                                  ChangeRecord::from_buffer_change
//!                                                │
//!                         ┌──────────────────────┴─────────┐
//!                         ▼                                ▼
//!                 ChangeLog::append                 relay (peers)
//!                                                          │
//!                                                          ▼
//!                                          ChangeRecord::apply_to(peer buffer)
//! ```
//!
//! Changes are replayed verbatim in delivery order. There is no merge step:
//! overlapping concurrent edits diverge until the buffer is reloaded.

pub mod buffer;
pub mod change;
pub mod history;

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

pub use buffer::{BufferChange, TextBuffer};
pub use change::{ChangeRecord, Origin};
pub use history::{ChangeLog, LogEntry};

/// Zero-based coordinates inside a text buffer.
///
/// `ch` counts Unicode scalar values within the line, not bytes.
/// Ordering is by line first, then column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub ch: u32,
}

impl Position {
    pub const ZERO: Position = Position { line: 0, ch: 0 };

    pub fn new(line: u32, ch: u32) -> Self {
        Self { line, ch }
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.ch)
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
