//! Change records: one local edit expressed as a range replacement.
//!
//! A record is built from the [`BufferChange`] the author's buffer emitted,
//! so `from`/`to` are already clipped and ordered in the author's
//! coordinates. Peers replay it with [`ChangeRecord::apply_to`], which tags
//! the resulting mutation with [`Origin::RemoteApply`] so the receiving
//! editor never turns it back into a new record.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::buffer::{end_of_insert, BufferChange, TextBuffer};
use crate::Position;

/// What caused a buffer mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    #[serde(rename = "+input")]
    Input,
    #[serde(rename = "+delete")]
    Delete,
    #[serde(rename = "paste")]
    Paste,
    #[serde(rename = "cut")]
    Cut,
    #[serde(rename = "drag")]
    Drag,
    #[serde(rename = "undo")]
    Undo,
    #[serde(rename = "redo")]
    Redo,
    #[serde(rename = "setValue")]
    SetValue,
    /// Marker for patches applied on behalf of a peer.
    #[serde(rename = "remote-apply")]
    RemoteApply,
}

impl Origin {
    pub fn is_remote_apply(self) -> bool {
        matches!(self, Origin::RemoteApply)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Origin::Input => "+input",
            Origin::Delete => "+delete",
            Origin::Paste => "paste",
            Origin::Cut => "cut",
            Origin::Drag => "drag",
            Origin::Undo => "undo",
            Origin::Redo => "redo",
            Origin::SetValue => "setValue",
            Origin::RemoteApply => "remote-apply",
        }
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One local edit, as sent to peers and kept in the change log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub file_id: Uuid,
    pub author_id: Uuid,
    pub origin: Origin,
    pub from: Position,
    pub to: Position,
    pub removed_text: String,
    pub inserted_text: String,
    /// Milliseconds since the Unix epoch, strictly increasing per author.
    pub timestamp: u64,
}

impl ChangeRecord {
    /// Build a record from the notification a local mutation produced.
    pub fn from_buffer_change(
        file_id: Uuid,
        author_id: Uuid,
        change: &BufferChange,
        timestamp: u64,
    ) -> Self {
        Self {
            file_id,
            author_id,
            origin: change.origin,
            from: change.from,
            to: change.to,
            removed_text: change.removed.clone(),
            inserted_text: change.inserted.clone(),
            timestamp,
        }
    }

    /// Replay this record on a buffer, verbatim.
    pub fn apply_to(&self, buffer: &mut TextBuffer) -> BufferChange {
        buffer.replace_range(self.from, self.to, &self.inserted_text, Origin::RemoteApply)
    }

    /// Where the inserted text ends once applied.
    pub fn inserted_end(&self) -> Position {
        end_of_insert(self.from, &self.inserted_text)
    }

    pub fn is_pure_insert(&self) -> bool {
        self.from == self.to && !self.inserted_text.is_empty()
    }

    pub fn is_pure_delete(&self) -> bool {
        self.inserted_text.is_empty() && !self.removed_text.is_empty()
    }
}

/// Apply `records` in order to `base` and return the resulting text.
pub fn replay<'a>(base: &str, records: impl IntoIterator<Item = &'a ChangeRecord>) -> String {
    let mut buffer = TextBuffer::from_text(base);
    for record in records {
        record.apply_to(&mut buffer);
    }
    buffer.text()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record(from: Position, to: Position, text: &str) -> ChangeRecord {
        ChangeRecord {
            file_id: Uuid::nil(),
            author_id: Uuid::nil(),
            origin: Origin::Input,
            from,
            to,
            removed_text: String::new(),
            inserted_text: text.to_owned(),
            timestamp: 1,
        }
    }

    #[test]
    fn test_apply_hi_to_empty_buffer() {
        let mut buf = TextBuffer::new();
        let change = record(Position::ZERO, Position::ZERO, "hi").apply_to(&mut buf);
        assert_eq!(buf.text(), "hi");
        assert_eq!(change.origin, Origin::RemoteApply);
    }

    #[test]
    fn test_from_buffer_change_copies_range() {
        let file = Uuid::new_v4();
        let author = Uuid::new_v4();
        let mut buf = TextBuffer::from_text("abc");
        let change = buf.replace_range(Position::new(0, 1), Position::new(0, 2), "XY", Origin::Paste);

        let rec = ChangeRecord::from_buffer_change(file, author, &change, 42);
        assert_eq!(rec.file_id, file);
        assert_eq!(rec.author_id, author);
        assert_eq!(rec.origin, Origin::Paste);
        assert_eq!(rec.removed_text, "b");
        assert_eq!(rec.inserted_text, "XY");
        assert_eq!(rec.timestamp, 42);
        assert_eq!(rec.inserted_end(), Position::new(0, 3));
    }

    #[test]
    fn test_insert_and_delete_classification() {
        let ins = record(Position::new(0, 1), Position::new(0, 1), "a");
        assert!(ins.is_pure_insert());
        assert!(!ins.is_pure_delete());

        let mut del = record(Position::new(0, 0), Position::new(0, 1), "");
        del.removed_text = "a".into();
        assert!(del.is_pure_delete());
        assert!(!del.is_pure_insert());
    }

    #[test]
    fn test_overlapping_concurrent_edits_diverge() {
        // Both peers start from "abc" and replace the same range concurrently.
        let mut alice = TextBuffer::from_text("abc");
        let mut bob = TextBuffer::from_text("abc");

        let a = alice.replace_range(Position::new(0, 0), Position::new(0, 2), "X", Origin::Input);
        let b = bob.replace_range(Position::new(0, 1), Position::new(0, 3), "Y", Origin::Input);
        let a = ChangeRecord::from_buffer_change(Uuid::nil(), Uuid::nil(), &a, 1);
        let b = ChangeRecord::from_buffer_change(Uuid::nil(), Uuid::nil(), &b, 1);

        b.apply_to(&mut alice);
        a.apply_to(&mut bob);
        assert_ne!(alice.text(), bob.text());
    }

    #[test]
    fn test_serializes_with_wire_field_names() {
        let rec = record(Position::new(1, 2), Position::new(1, 2), "x");
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["insertedText"], "x");
        assert_eq!(json["origin"], "+input");
        assert_eq!(json["from"]["line"], 1);
        assert!(json.get("fileId").is_some());

        let back: ChangeRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn test_origin_display() {
        assert_eq!(Origin::RemoteApply.to_string(), "remote-apply");
        assert!(Origin::RemoteApply.is_remote_apply());
        assert!(!Origin::Undo.is_remote_apply());
    }

    proptest! {
        #[test]
        fn prop_replay_reconstructs_final_text(
            base in "[a-c\n]{0,24}",
            edits in prop::collection::vec(
                (0u32..5, 0u32..9, 0u32..5, 0u32..9, "[x-z\n]{0,4}"),
                0..24,
            ),
        ) {
            let file = Uuid::new_v4();
            let author = Uuid::new_v4();
            let mut live = TextBuffer::from_text(&base);
            let mut records = Vec::new();

            for (i, (l1, c1, l2, c2, text)) in edits.iter().enumerate() {
                let change = live.replace_range(
                    Position::new(*l1, *c1),
                    Position::new(*l2, *c2),
                    text,
                    Origin::Input,
                );
                records.push(ChangeRecord::from_buffer_change(file, author, &change, i as u64));
            }

            prop_assert_eq!(replay(&base, &records), live.text());
        }
    }
}
