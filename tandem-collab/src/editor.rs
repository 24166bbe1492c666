//! Per-file editor adapter: turns local buffer mutations into change records
//! and applies peers' records without echoing them back.

use uuid::Uuid;

use tandem_core::{now_millis, BufferChange, ChangeRecord, Origin, Position, TextBuffer};

/// One open file on one client.
pub struct FileEditor {
    file_id: Uuid,
    author_id: Uuid,
    buffer: TextBuffer,
    /// Set while a remote record is being applied
    applying_remote: bool,
    last_timestamp: u64,
    last_relay_seq: Option<u64>,
    /// Own changes sent to the relay. Each takes a change number this
    /// client never sees echoed.
    unseen_own: u64,
    missed_changes: u64,
}

impl FileEditor {
    pub fn new(file_id: Uuid, author_id: Uuid, initial: &str) -> Self {
        Self {
            file_id,
            author_id,
            buffer: TextBuffer::from_text(initial),
            applying_remote: false,
            last_timestamp: 0,
            last_relay_seq: None,
            unseen_own: 0,
            missed_changes: 0,
        }
    }

    pub fn file_id(&self) -> Uuid {
        self.file_id
    }

    /// Apply a local edit. Returns the record to broadcast, or `None` when
    /// the mutation must not produce one.
    pub fn edit(
        &mut self,
        from: Position,
        to: Position,
        text: &str,
        origin: Origin,
    ) -> Option<ChangeRecord> {
        let change = self.buffer.replace_range(from, to, text, origin);
        self.capture(&change)
    }

    /// Replay a peer's record verbatim at its (clipped) coordinates.
    pub fn apply_remote(&mut self, record: &ChangeRecord) -> BufferChange {
        self.applying_remote = true;
        let change = record.apply_to(&mut self.buffer);
        let echoed = self.capture(&change);
        self.applying_remote = false;
        debug_assert!(echoed.is_none());
        change
    }

    /// Buffer-change listener. Produces a record only for genuine local
    /// mutations.
    fn capture(&mut self, change: &BufferChange) -> Option<ChangeRecord> {
        if self.applying_remote || change.origin.is_remote_apply() {
            return None;
        }
        let timestamp = self.next_timestamp();
        Some(ChangeRecord::from_buffer_change(
            self.file_id,
            self.author_id,
            change,
            timestamp,
        ))
    }

    /// Milliseconds since the epoch, bumped to stay strictly increasing.
    fn next_timestamp(&mut self) -> u64 {
        let ts = now_millis().max(self.last_timestamp + 1);
        self.last_timestamp = ts;
        ts
    }

    /// Count a change of ours that went to the relay.
    pub fn note_sent_change(&mut self) {
        self.unseen_own += 1;
    }

    /// Note the relay's change number on a peer's change. Returns the number
    /// of peer changes missed.
    ///
    /// Numbers skipped over are first credited to our own sent changes.
    pub fn observe_seq(&mut self, seq: u64) -> u64 {
        let skipped = match self.last_relay_seq {
            Some(last) if seq > last + 1 => seq - last - 1,
            _ => 0,
        };
        let own = skipped.min(self.unseen_own);
        self.unseen_own -= own;
        let missed = skipped - own;
        if missed > 0 {
            self.missed_changes += missed;
            log::warn!(
                "File {}: relay change seq jumped to {seq}, {missed} change(s) missed",
                self.file_id
            );
        }
        self.last_relay_seq = Some(self.last_relay_seq.map_or(seq, |last| last.max(seq)));
        missed
    }

    pub fn last_relay_seq(&self) -> Option<u64> {
        self.last_relay_seq
    }

    /// Peer changes reported missed since the file was opened.
    pub fn missed_changes(&self) -> u64 {
        self.missed_changes
    }

    pub fn text(&self) -> String {
        self.buffer.text()
    }

    pub fn buffer(&self) -> &TextBuffer {
        &self.buffer
    }
}
