//! Live cursor positions, one per (file, user).
//!
//! Every local movement is emitted immediately. A received position
//! overwrites whatever was stored for that user in that file. Entries are
//! dropped only by an explicit removal event, never by age.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use tandem_core::{now_millis, Position};

use crate::presence::PresenceRoster;
use crate::protocol::{Envelope, ProtocolError, Topic};

/// A user's caret in a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPosition {
    pub file_id: Uuid,
    pub user_id: Uuid,
    pub line: u32,
    pub ch: u32,
    pub updated_at: u64,
}

impl CursorPosition {
    pub fn position(&self) -> Position {
        Position::new(self.line, self.ch)
    }
}

/// Caret colours, picked so neighbours in the list stay distinguishable.
const PALETTE: [u32; 12] = [
    0xe06c75, 0x61afef, 0x98c379, 0xc678dd, 0xe5c07b, 0x56b6c2, 0xd19a66, 0x7f8cff,
    0xbe5046, 0x2bbac5, 0xa9dc76, 0xff6188,
];

/// Marker colour, stable per user id. Packed `0xRRGGBB`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CursorColor(pub u32);

impl CursorColor {
    pub fn from_uuid(id: Uuid) -> Self {
        Self(PALETTE[(id.as_u128() % PALETTE.len() as u128) as usize])
    }

    /// `#rrggbb`
    pub fn to_hex(self) -> String {
        format!("#{:06x}", self.0)
    }
}

/// What the editor draws for one remote user.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorMarker {
    pub user_id: Uuid,
    pub display_name: String,
    pub line: u32,
    pub ch: u32,
    pub color: CursorColor,
}

/// Cursor table for every joined file.
pub struct CursorBoard {
    local_user: Uuid,
    positions: HashMap<(Uuid, Uuid), CursorPosition>,
}

impl CursorBoard {
    pub fn new(local_user: Uuid) -> Self {
        Self {
            local_user,
            positions: HashMap::new(),
        }
    }

    /// Record the local caret and build the `send-cursor` envelope.
    pub fn update_local(&mut self, file_id: Uuid, at: Position) -> Result<Envelope, ProtocolError> {
        let position = CursorPosition {
            file_id,
            user_id: self.local_user,
            line: at.line,
            ch: at.ch,
            updated_at: now_millis(),
        };
        self.positions.insert((file_id, self.local_user), position);
        Envelope::send_cursor(&position)
    }

    /// Forget the local caret in a file and build the `remove-cursor` envelope.
    pub fn remove_local(&mut self, file_id: Uuid) -> Envelope {
        self.positions.remove(&(file_id, self.local_user));
        Envelope::remove_cursor(self.local_user, file_id)
    }

    /// Drop every cursor stored for a file.
    pub fn forget_file(&mut self, file_id: Uuid) {
        self.positions.retain(|(file, _), _| *file != file_id);
    }

    /// Apply a peer's cursor envelope. Returns true if the table changed.
    pub fn handle(&mut self, envelope: &Envelope) -> bool {
        if envelope.sender == self.local_user {
            return false;
        }
        match envelope.topic {
            Topic::ReceiveCursor => match envelope.cursor() {
                Ok(position) if position.user_id == envelope.sender => {
                    log::trace!(
                        "Cursor {} at {}:{} in {}",
                        position.user_id,
                        position.line,
                        position.ch,
                        position.file_id
                    );
                    self.positions
                        .insert((position.file_id, position.user_id), position);
                    true
                }
                Ok(_) => false,
                Err(e) => {
                    log::warn!("Dropping malformed cursor frame: {e}");
                    false
                }
            },
            Topic::RemoveCursor | Topic::RemoveActiveLiveUser => self
                .positions
                .remove(&(envelope.file_id, envelope.sender))
                .is_some(),
            Topic::RemoveUserSpecificCursor => {
                let before = self.positions.len();
                self.positions.retain(|(_, user), _| *user != envelope.sender);
                self.positions.len() != before
            }
            _ => false,
        }
    }

    pub fn position(&self, file_id: Uuid, user_id: Uuid) -> Option<&CursorPosition> {
        self.positions.get(&(file_id, user_id))
    }

    /// Markers for every live user in the roster with a known cursor,
    /// excluding the local user.
    pub fn markers(&self, roster: &PresenceRoster) -> Vec<CursorMarker> {
        roster
            .live_users()
            .into_iter()
            .filter(|user| user.user_id != self.local_user)
            .filter_map(|user| {
                let pos = self.positions.get(&(roster.file_id(), user.user_id))?;
                Some(CursorMarker {
                    user_id: user.user_id,
                    display_name: user.display_name.clone(),
                    line: pos.line,
                    ch: pos.ch,
                    color: CursorColor::from_uuid(user.user_id),
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}
