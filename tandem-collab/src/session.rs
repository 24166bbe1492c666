//! Client session: the single owner of one user's collaborative state.
//!
//! ```text
//!                 ┌──────────────────── ClientSession ────────────────────┐
//! keystroke ────► │ FileEditor ─► ChangeLog                               │
//!                 │     │                                                 │ ──► RelaySink
//!                 │     └──────► PersistenceDebouncer ──► ContentStore    │
//! relay frame ──► │ handle_envelope ─► FileEditor / TabRegistry /         │
//!                 │                    CursorBoard                        │
//!                 └───────────────────────────────────────────────────────┘
//! ```
//!
//! A session is driven by one task through `&mut self`. Relay failures are
//! logged and never reach the caller of an edit.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use tandem_core::{ChangeLog, ChangeRecord, LogEntry, Origin, Position};

use crate::client::RelaySink;
use crate::cursor::{CursorBoard, CursorMarker};
use crate::debounce::{DebounceConfig, PersistenceDebouncer, SaveNotice};
use crate::editor::FileEditor;
use crate::presence::{PresenceError, PresenceRoster, TabRegistry, UserIdentity};
use crate::protocol::{Envelope, Topic};
use crate::storage::{ContentStore, StoreError};

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub debounce: DebounceConfig,
}

impl SessionConfig {
    pub fn for_testing() -> Self {
        Self {
            debounce: DebounceConfig::for_testing(),
        }
    }
}

pub struct ClientSession<R: RelaySink, S: ContentStore> {
    project_id: Uuid,
    relay: R,
    store: Arc<S>,
    editors: HashMap<Uuid, FileEditor>,
    /// Open files whose room the relay refused to let us into
    refused: HashSet<Uuid>,
    presence: TabRegistry,
    cursors: CursorBoard,
    log: ChangeLog,
    debouncer: PersistenceDebouncer<S>,
}

impl<R: RelaySink, S: ContentStore> ClientSession<R, S> {
    pub fn new(
        identity: UserIdentity,
        project_id: Uuid,
        relay: R,
        store: Arc<S>,
        config: SessionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SaveNotice>) {
        let (debouncer, notices) =
            PersistenceDebouncer::new(Arc::clone(&store), project_id, config.debounce);
        let session = Self {
            project_id,
            relay,
            store,
            editors: HashMap::new(),
            refused: HashSet::new(),
            cursors: CursorBoard::new(identity.user_id),
            presence: TabRegistry::new(identity),
            log: ChangeLog::new(),
            debouncer,
        };
        (session, notices)
    }

    /// Load a file, join its room and focus it.
    ///
    /// A failed fetch opens an empty buffer so editing can proceed.
    /// Opening a file that is already open only switches to its tab.
    pub async fn open_file(&mut self, file_id: Uuid) -> Result<(), SessionError> {
        if self.editors.contains_key(&file_id) {
            return self.switch_tab(file_id);
        }

        let initial = match self.store.fetch_content(self.project_id, file_id).await {
            Ok(text) => text,
            Err(StoreError::NotFound(_)) => {
                log::debug!("File {file_id} has no stored content yet");
                String::new()
            }
            Err(e) => {
                log::warn!("Fetching file {file_id} failed, opening empty buffer: {e}");
                String::new()
            }
        };
        let user_id = self.user_id();
        self.editors
            .insert(file_id, FileEditor::new(file_id, user_id, &initial));

        match Envelope::join_file(user_id, file_id, self.project_id) {
            Ok(join) => self.emit(join),
            Err(e) => log::warn!("Failed to encode join for {file_id}: {e}"),
        }
        let announcements = self.presence.join_file(file_id)?;
        self.emit_all(announcements);
        self.switch_tab(file_id)
    }

    /// Focus an open file; every other file goes to the background.
    pub fn switch_tab(&mut self, file_id: Uuid) -> Result<(), SessionError> {
        self.ensure_open(file_id)?;
        let deltas = self.presence.activate(file_id)?;
        self.emit_all(deltas);
        Ok(())
    }

    /// Apply a local edit, broadcast it and schedule a save.
    pub fn local_edit(
        &mut self,
        file_id: Uuid,
        from: Position,
        to: Position,
        text: &str,
        origin: Origin,
    ) -> Result<Option<ChangeRecord>, SessionError> {
        let editor = self
            .editors
            .get_mut(&file_id)
            .ok_or(SessionError::FileNotOpen(file_id))?;
        let Some(record) = editor.edit(from, to, text, origin) else {
            return Ok(None);
        };
        let snapshot = editor.text();

        self.log.append(LogEntry::local(record.clone()));
        if self.refused.contains(&file_id) {
            log::debug!("Change in {file_id} kept local, relay refused the room");
        } else {
            match Envelope::send_change(&record) {
                Ok(env) => {
                    if let Some(editor) = self.editors.get_mut(&file_id) {
                        editor.note_sent_change();
                    }
                    self.emit(env);
                }
                Err(e) => log::warn!("Failed to encode change for {file_id}: {e}"),
            }
        }
        self.debouncer.arm(file_id, snapshot);
        Ok(Some(record))
    }

    /// Move the local caret. The position is clipped to the buffer.
    pub fn move_cursor(&mut self, file_id: Uuid, at: Position) -> Result<(), SessionError> {
        let editor = self
            .editors
            .get(&file_id)
            .ok_or(SessionError::FileNotOpen(file_id))?;
        let at = editor.buffer().clip(at);
        match self.cursors.update_local(file_id, at) {
            Ok(env) if !self.refused.contains(&file_id) => self.emit(env),
            Ok(_) => {}
            Err(e) => log::warn!("Failed to encode cursor for {file_id}: {e}"),
        }
        Ok(())
    }

    /// Dispatch one envelope from the relay. Returns true if local state
    /// changed.
    pub fn handle_envelope(&mut self, envelope: &Envelope) -> bool {
        let file_id = envelope.file_id;
        let file_scoped = envelope.topic != Topic::RemoveUserSpecificCursor;
        if file_scoped && !file_id.is_nil() && !self.editors.contains_key(&file_id) {
            log::trace!("Ignoring {} for unopened file {file_id}", envelope.topic.name());
            return false;
        }

        match envelope.topic {
            Topic::ReceiveChange => self.apply_remote_change(envelope),
            Topic::UserJoined | Topic::RosterReply | Topic::UserLeft | Topic::LeaveFile => {
                self.presence.handle(envelope)
            }
            Topic::RosterQuery => {
                if let Some(reply) = self.presence.answer_query(envelope) {
                    self.emit(reply);
                }
                false
            }
            Topic::RemoveActiveLiveUser => {
                let roster = self.presence.handle(envelope);
                let cursor = self.cursors.handle(envelope);
                roster || cursor
            }
            Topic::ReceiveCursor | Topic::RemoveCursor | Topic::RemoveUserSpecificCursor => {
                self.cursors.handle(envelope)
            }
            Topic::JoinRefused => {
                log::warn!("Relay refused to join room {file_id}, edits stay local");
                self.refused.insert(file_id)
            }
            Topic::Pong => {
                log::trace!("pong from relay");
                false
            }
            other => {
                log::debug!("Unexpected {} from relay", other.name());
                false
            }
        }
    }

    fn apply_remote_change(&mut self, envelope: &Envelope) -> bool {
        let entry = match envelope.log_entry() {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("Dropping malformed change frame: {e}");
                return false;
            }
        };
        let Some(editor) = self.editors.get_mut(&entry.change.file_id) else {
            return false;
        };
        if let Some(change_seq) = entry.relay_seq {
            editor.observe_seq(change_seq);
        }
        editor.apply_remote(&entry.change);
        self.log.append(entry);
        true
    }

    /// Leave a file: withdraw cursor and presence, save, then detach.
    pub async fn close_file(&mut self, file_id: Uuid) -> Result<(), SessionError> {
        self.ensure_open(file_id)?;

        let remove_cursor = self.cursors.remove_local(file_id);
        self.emit(remove_cursor);
        let departures = self.presence.leave_file(file_id)?;
        self.emit_all(departures);
        self.emit(Envelope::leave_file(self.user_id(), file_id));

        if let Err(e) = self.debouncer.flush(file_id).await {
            log::warn!("Final save of {file_id} failed: {e}");
        }
        self.cursors.forget_file(file_id);
        self.editors.remove(&file_id);
        self.refused.remove(&file_id);
        log::debug!("Closed file {file_id}");
        Ok(())
    }

    /// Close every file and end the session.
    pub async fn close(mut self) {
        let open: Vec<Uuid> = self.editors.keys().copied().collect();
        for file_id in open {
            if let Err(e) = self.close_file(file_id).await {
                log::warn!("Closing {file_id} failed: {e}");
            }
        }
        self.emit(Envelope::remove_user_specific_cursor(self.user_id()));
        self.debouncer.shutdown();
        log::info!("Session for {} closed", self.user_id());
    }

    /// Merge the server-side change log into the local one.
    pub async fn load_history(&mut self) -> Result<usize, SessionError> {
        match self.store.fetch_change_log(self.project_id).await {
            Ok(entries) => Ok(self.log.extend_missing(entries)),
            Err(e) => {
                log::warn!("Loading change history failed: {e}");
                Err(e.into())
            }
        }
    }

    /// Send a keepalive ping.
    pub fn ping(&self) {
        self.emit(Envelope::ping(self.user_id()));
    }

    pub fn user_id(&self) -> Uuid {
        self.presence.identity().user_id
    }

    pub fn project_id(&self) -> Uuid {
        self.project_id
    }

    pub fn text(&self, file_id: Uuid) -> Option<String> {
        self.editors.get(&file_id).map(FileEditor::text)
    }

    pub fn editor(&self, file_id: Uuid) -> Option<&FileEditor> {
        self.editors.get(&file_id)
    }

    /// True when the relay refused this file's room. The file stays
    /// editable and is still saved, but peers see nothing.
    pub fn is_refused(&self, file_id: Uuid) -> bool {
        self.refused.contains(&file_id)
    }

    pub fn open_files(&self) -> Vec<Uuid> {
        self.editors.keys().copied().collect()
    }

    pub fn active_file(&self) -> Option<Uuid> {
        self.presence.active_file()
    }

    pub fn change_log(&self) -> &ChangeLog {
        &self.log
    }

    pub fn presence(&self) -> &TabRegistry {
        &self.presence
    }

    pub fn roster(&self, file_id: Uuid) -> Option<&PresenceRoster> {
        self.presence.roster(file_id)
    }

    pub fn cursors(&self) -> &CursorBoard {
        &self.cursors
    }

    /// Remote carets to draw in a file.
    pub fn cursor_markers(&self, file_id: Uuid) -> Vec<CursorMarker> {
        self.presence
            .roster(file_id)
            .map(|roster| self.cursors.markers(roster))
            .unwrap_or_default()
    }

    pub fn debouncer(&self) -> &PersistenceDebouncer<S> {
        &self.debouncer
    }

    fn ensure_open(&self, file_id: Uuid) -> Result<(), SessionError> {
        if self.editors.contains_key(&file_id) {
            Ok(())
        } else {
            Err(SessionError::FileNotOpen(file_id))
        }
    }

    fn emit(&self, envelope: Envelope) {
        let topic = envelope.topic;
        if let Err(e) = self.relay.emit(envelope) {
            log::warn!("Relay emit of {} failed, continuing locally: {e}", topic.name());
        }
    }

    fn emit_all(&self, envelopes: Vec<Envelope>) {
        for envelope in envelopes {
            self.emit(envelope);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    FileNotOpen(Uuid),
    Presence(PresenceError),
    Store(StoreError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FileNotOpen(file) => write!(f, "File {file} is not open"),
            Self::Presence(e) => write!(f, "Presence error: {e}"),
            Self::Store(e) => write!(f, "Store error: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<PresenceError> for SessionError {
    fn from(e: PresenceError) -> Self {
        SessionError::Presence(e)
    }
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        SessionError::Store(e)
    }
}
