//! Presence & tab registry: who has which file open, and which tab is active.
//!
//! ## Architecture
//!
//! ```text
//! open file                      peers (already in the room)
//!    │                                     │
//!    ▼                                     │
//! TabRegistry::join_file()                 │
//!    │  user-joined(own record)  ─────────►│ roster.upsert
//!    │  roster-query             ─────────►│ answer_query()
//!    │                                     │
//!    │◄──────────── roster-reply(own) ─────┘
//!    ▼
//! roster.upsert (merge)
//! ```
//!
//! There is no central presence store. Each client keeps a per-file roster
//! built from `user-joined` deltas and query replies, merged last-writer-wins
//! on `updated_at`. Entries leave the roster only on an explicit leave or the
//! relay's disconnect notice; there is no timeout eviction, so a partition
//! that drops those messages leaves a stale entry behind.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use tandem_core::now_millis;

use crate::protocol::{Envelope, ProtocolError, Topic};

/// The local user as shown to peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: Uuid,
    pub display_name: String,
    pub avatar_ref: Option<String>,
}

impl UserIdentity {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            user_id: Uuid::new_v4(),
            display_name: display_name.into(),
            avatar_ref: None,
        }
    }
}

/// One user's presence in one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabUserPresence {
    pub file_id: Uuid,
    pub user_id: Uuid,
    pub display_name: String,
    pub avatar_ref: Option<String>,
    pub is_active_in_tab: bool,
    pub is_live: bool,
    /// Milliseconds since the Unix epoch
    pub updated_at: u64,
}

/// Local user's state for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresenceState {
    Absent,
    /// Subscribed, not yet shown in a tab
    Joined,
    /// Open in the focused tab
    Active,
    /// Open in a background tab
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceEvent {
    JoinFile,
    Activate,
    Deactivate,
    Leave,
    Disconnect,
}

impl PresenceState {
    pub fn transition(self, event: PresenceEvent) -> Result<PresenceState, PresenceError> {
        use PresenceEvent::*;
        use PresenceState::*;

        match (self, event) {
            (_, Leave) | (_, Disconnect) => Ok(Absent),
            (Absent, JoinFile) => Ok(Joined),
            (state, JoinFile) => Ok(state),
            (Absent, Activate) | (Absent, Deactivate) => Err(PresenceError::InvalidTransition {
                from: self,
                event,
            }),
            (_, Activate) => Ok(Active),
            (Joined, Deactivate) => Ok(Joined),
            (_, Deactivate) => Ok(Inactive),
        }
    }

    pub fn is_live(self) -> bool {
        matches!(self, PresenceState::Active | PresenceState::Inactive)
    }

    pub fn is_active_in_tab(self) -> bool {
        self == PresenceState::Active
    }
}

/// Everyone known to be in one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRoster {
    file_id: Uuid,
    users: HashMap<Uuid, TabUserPresence>,
}

impl PresenceRoster {
    pub fn new(file_id: Uuid) -> Self {
        Self {
            file_id,
            users: HashMap::new(),
        }
    }

    pub fn file_id(&self) -> Uuid {
        self.file_id
    }

    /// Merge one record. Returns true if it replaced the stored entry.
    ///
    /// Last writer wins on `updated_at`; a tie accepts the incoming record.
    pub fn upsert(&mut self, record: TabUserPresence) -> bool {
        if record.file_id != self.file_id {
            return false;
        }
        match self.users.get(&record.user_id) {
            Some(existing) if existing.updated_at > record.updated_at => false,
            _ => {
                self.users.insert(record.user_id, record);
                true
            }
        }
    }

    pub fn remove(&mut self, user_id: &Uuid) -> Option<TabUserPresence> {
        self.users.remove(user_id)
    }

    pub fn get(&self, user_id: &Uuid) -> Option<&TabUserPresence> {
        self.users.get(user_id)
    }

    pub fn contains(&self, user_id: &Uuid) -> bool {
        self.users.contains_key(user_id)
    }

    /// Every entry, ordered by display name.
    pub fn users(&self) -> Vec<&TabUserPresence> {
        let mut users: Vec<_> = self.users.values().collect();
        users.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then(a.user_id.cmp(&b.user_id))
        });
        users
    }

    pub fn live_users(&self) -> Vec<&TabUserPresence> {
        self.users().into_iter().filter(|u| u.is_live).collect()
    }

    /// Users whose focused tab is this file.
    pub fn active_users(&self) -> Vec<&TabUserPresence> {
        self.users().into_iter().filter(|u| u.is_active_in_tab).collect()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

struct FileSlot {
    state: PresenceState,
    roster: PresenceRoster,
}

/// Per-client registry of joined files and their rosters.
pub struct TabRegistry {
    identity: UserIdentity,
    files: HashMap<Uuid, FileSlot>,
    active_file: Option<Uuid>,
    last_stamp: u64,
}

impl TabRegistry {
    pub fn new(identity: UserIdentity) -> Self {
        Self {
            identity,
            files: HashMap::new(),
            active_file: None,
            last_stamp: 0,
        }
    }

    pub fn identity(&self) -> &UserIdentity {
        &self.identity
    }

    /// Enter a file's room. Returns the announcement and the roster query.
    pub fn join_file(&mut self, file_id: Uuid) -> Result<Vec<Envelope>, PresenceError> {
        let state = self.local_state(file_id).transition(PresenceEvent::JoinFile)?;
        self.files.entry(file_id).or_insert_with(|| FileSlot {
            state,
            roster: PresenceRoster::new(file_id),
        });
        let own = self.refresh_own(file_id)?;
        log::debug!("Joined presence for file {file_id}");
        Ok(vec![
            Envelope::user_joined(&own)?,
            Envelope::roster_query(self.identity.user_id, file_id),
        ])
    }

    /// Make `file_id` the focused tab.
    ///
    /// Every other file that was active goes inactive in the same call; the
    /// returned deltas cover all of them.
    pub fn activate(&mut self, file_id: Uuid) -> Result<Vec<Envelope>, PresenceError> {
        if self.local_state(file_id) == PresenceState::Absent {
            return Err(PresenceError::NotJoined(file_id));
        }

        let previously_active: Vec<Uuid> = self
            .files
            .iter()
            .filter(|(id, slot)| **id != file_id && slot.state == PresenceState::Active)
            .map(|(id, _)| *id)
            .collect();

        let mut deltas = Vec::with_capacity(previously_active.len() + 1);
        for other in previously_active {
            self.apply(other, PresenceEvent::Deactivate)?;
            deltas.push(Envelope::user_joined(&self.refresh_own(other)?)?);
        }
        self.apply(file_id, PresenceEvent::Activate)?;
        deltas.push(Envelope::user_joined(&self.refresh_own(file_id)?)?);
        self.active_file = Some(file_id);
        Ok(deltas)
    }

    /// Put a joined file in the background without focusing another.
    pub fn deactivate(&mut self, file_id: Uuid) -> Result<Vec<Envelope>, PresenceError> {
        self.apply(file_id, PresenceEvent::Deactivate)?;
        if self.active_file == Some(file_id) {
            self.active_file = None;
        }
        Ok(vec![Envelope::user_joined(&self.refresh_own(file_id)?)?])
    }

    /// Leave a file's room and forget its roster.
    pub fn leave_file(&mut self, file_id: Uuid) -> Result<Vec<Envelope>, PresenceError> {
        if self.files.remove(&file_id).is_none() {
            return Err(PresenceError::NotJoined(file_id));
        }
        if self.active_file == Some(file_id) {
            self.active_file = None;
        }
        Ok(vec![Envelope::user_left(self.identity.user_id, file_id)])
    }

    /// Apply a peer's presence envelope. Returns true if a roster changed.
    pub fn handle(&mut self, envelope: &Envelope) -> bool {
        if envelope.sender == self.identity.user_id {
            return false;
        }
        let Some(slot) = self.files.get_mut(&envelope.file_id) else {
            return false;
        };

        match envelope.topic {
            Topic::UserJoined | Topic::RosterReply => match envelope.presence() {
                Ok(record) if record.user_id == envelope.sender => slot.roster.upsert(record),
                Ok(record) => {
                    log::warn!(
                        "Presence record for {} sent by {}, ignored",
                        record.user_id,
                        envelope.sender
                    );
                    false
                }
                Err(e) => {
                    log::warn!("Dropping malformed {}: {e}", envelope.topic.name());
                    false
                }
            },
            Topic::UserLeft | Topic::LeaveFile | Topic::RemoveActiveLiveUser => {
                slot.roster.remove(&envelope.sender).is_some()
            }
            _ => false,
        }
    }

    /// Reply to a peer's roster query with the local record for that file.
    pub fn answer_query(&self, envelope: &Envelope) -> Option<Envelope> {
        if envelope.topic != Topic::RosterQuery || envelope.sender == self.identity.user_id {
            return None;
        }
        let own = self
            .files
            .get(&envelope.file_id)?
            .roster
            .get(&self.identity.user_id)?;
        match Envelope::roster_reply(own) {
            Ok(reply) => Some(reply),
            Err(e) => {
                log::warn!("Failed to encode roster reply: {e}");
                None
            }
        }
    }

    pub fn roster(&self, file_id: Uuid) -> Option<&PresenceRoster> {
        self.files.get(&file_id).map(|slot| &slot.roster)
    }

    pub fn local_state(&self, file_id: Uuid) -> PresenceState {
        self.files
            .get(&file_id)
            .map_or(PresenceState::Absent, |slot| slot.state)
    }

    pub fn active_file(&self) -> Option<Uuid> {
        self.active_file
    }

    pub fn joined_files(&self) -> Vec<Uuid> {
        self.files.keys().copied().collect()
    }

    fn apply(&mut self, file_id: Uuid, event: PresenceEvent) -> Result<(), PresenceError> {
        let slot = self
            .files
            .get_mut(&file_id)
            .ok_or(PresenceError::NotJoined(file_id))?;
        slot.state = slot.state.transition(event)?;
        Ok(())
    }

    /// Rewrite the local user's record in a file's roster from its state.
    fn refresh_own(&mut self, file_id: Uuid) -> Result<TabUserPresence, PresenceError> {
        let stamp = now_millis().max(self.last_stamp + 1);
        self.last_stamp = stamp;

        let slot = self
            .files
            .get_mut(&file_id)
            .ok_or(PresenceError::NotJoined(file_id))?;
        let record = TabUserPresence {
            file_id,
            user_id: self.identity.user_id,
            display_name: self.identity.display_name.clone(),
            avatar_ref: self.identity.avatar_ref.clone(),
            is_active_in_tab: slot.state.is_active_in_tab(),
            is_live: slot.state.is_live(),
            updated_at: stamp,
        };
        slot.roster.upsert(record.clone());
        Ok(record)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PresenceError {
    InvalidTransition {
        from: PresenceState,
        event: PresenceEvent,
    },
    NotJoined(Uuid),
    Protocol(ProtocolError),
}

impl std::fmt::Display for PresenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidTransition { from, event } => {
                write!(f, "Invalid presence transition: {event:?} from {from:?}")
            }
            Self::NotJoined(file) => write!(f, "File {file} has not been joined"),
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
        }
    }
}

impl std::error::Error for PresenceError {}

impl From<ProtocolError> for PresenceError {
    fn from(e: ProtocolError) -> Self {
        PresenceError::Protocol(e)
    }
}
