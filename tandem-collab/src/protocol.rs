//! Binary relay protocol for change, cursor and presence events.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬───────────┬──────────┬──────────┐
//! │ topic    │ sender    │ file_id   │ seq      │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes  │ varint   │ variable │
//! └──────────┴───────────┴───────────┴──────────┴──────────┘
//! ```
//!
//! `sender` is the user the event is about. `file_id` names the room; it is
//! nil for `RemoveUserSpecificCursor`, which applies to every room the
//! sender is in. `seq` is 0 when a client emits and is stamped by the relay
//! with the room's next sequence number on fan-out.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tandem_core::{ChangeRecord, LogEntry};

use crate::cursor::CursorPosition;
use crate::presence::TabUserPresence;

/// Event topics. Tag values are part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Topic {
    /// Subscribe to a file room
    JoinFile = 1,
    /// Unsubscribe from a file room; peers evict the sender
    LeaveFile = 2,
    /// Local change, client → relay
    SendChange = 3,
    /// Relayed change with its log entry, relay → peers
    ReceiveChange = 4,
    /// Local cursor, client → relay
    SendCursor = 5,
    /// Relayed cursor, relay → peers
    ReceiveCursor = 6,
    /// Drop the sender's cursor in one file
    RemoveCursor = 7,
    /// Drop the sender's cursor in every file
    RemoveUserSpecificCursor = 8,
    /// Convergence query from a joining client
    RosterQuery = 9,
    /// A peer's own presence record, in answer to a query
    RosterReply = 10,
    /// Presence delta (join, tab switch)
    UserJoined = 11,
    /// Presence removal
    UserLeft = 12,
    /// Relay notice that the sender's connection dropped
    RemoveActiveLiveUser = 13,
    Ping = 14,
    Pong = 15,
    /// Relay notice to one client that its join was refused (room full)
    JoinRefused = 16,
}

impl Topic {
    /// Event name as it appears in logs.
    pub fn name(self) -> &'static str {
        match self {
            Topic::JoinFile => "join-file",
            Topic::LeaveFile => "leave-file",
            Topic::SendChange => "send-change",
            Topic::ReceiveChange => "receive-change",
            Topic::SendCursor => "send-cursor",
            Topic::ReceiveCursor => "receive-cursor",
            Topic::RemoveCursor => "remove-cursor",
            Topic::RemoveUserSpecificCursor => "remove-user-specific-cursor",
            Topic::RosterQuery => "roster-query",
            Topic::RosterReply => "roster-reply",
            Topic::UserJoined => "user-joined",
            Topic::UserLeft => "user-left",
            Topic::RemoveActiveLiveUser => "remove-active-live-user",
            Topic::Ping => "ping",
            Topic::Pong => "pong",
            Topic::JoinRefused => "join-refused",
        }
    }
}

/// Payload of `JoinFile`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub project_id: Uuid,
}

/// Top-level relay frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: Topic,
    pub sender: Uuid,
    pub file_id: Uuid,
    /// Room sequence number, stamped by the relay
    pub seq: u64,
    pub payload: Vec<u8>,
}

impl Envelope {
    fn bare(topic: Topic, sender: Uuid, file_id: Uuid) -> Self {
        Self {
            topic,
            sender,
            file_id,
            seq: 0,
            payload: Vec::new(),
        }
    }

    fn with_payload<T: Serialize>(
        topic: Topic,
        sender: Uuid,
        file_id: Uuid,
        value: &T,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            payload: encode_payload(value)?,
            ..Self::bare(topic, sender, file_id)
        })
    }

    pub fn join_file(user_id: Uuid, file_id: Uuid, project_id: Uuid) -> Result<Self, ProtocolError> {
        Self::with_payload(Topic::JoinFile, user_id, file_id, &JoinRequest { project_id })
    }

    pub fn leave_file(user_id: Uuid, file_id: Uuid) -> Self {
        Self::bare(Topic::LeaveFile, user_id, file_id)
    }

    pub fn send_change(change: &ChangeRecord) -> Result<Self, ProtocolError> {
        Self::with_payload(Topic::SendChange, change.author_id, change.file_id, change)
    }

    /// Relay-side: wrap a change and its log entry for the room.
    pub fn receive_change(entry: &LogEntry) -> Result<Self, ProtocolError> {
        let mut env = Self::with_payload(
            Topic::ReceiveChange,
            entry.change.author_id,
            entry.change.file_id,
            entry,
        )?;
        env.seq = entry.relay_seq.unwrap_or(0);
        Ok(env)
    }

    pub fn send_cursor(position: &CursorPosition) -> Result<Self, ProtocolError> {
        Self::with_payload(Topic::SendCursor, position.user_id, position.file_id, position)
    }

    pub fn remove_cursor(user_id: Uuid, file_id: Uuid) -> Self {
        Self::bare(Topic::RemoveCursor, user_id, file_id)
    }

    pub fn remove_user_specific_cursor(user_id: Uuid) -> Self {
        Self::bare(Topic::RemoveUserSpecificCursor, user_id, Uuid::nil())
    }

    pub fn roster_query(user_id: Uuid, file_id: Uuid) -> Self {
        Self::bare(Topic::RosterQuery, user_id, file_id)
    }

    pub fn roster_reply(presence: &TabUserPresence) -> Result<Self, ProtocolError> {
        Self::with_payload(Topic::RosterReply, presence.user_id, presence.file_id, presence)
    }

    pub fn user_joined(presence: &TabUserPresence) -> Result<Self, ProtocolError> {
        Self::with_payload(Topic::UserJoined, presence.user_id, presence.file_id, presence)
    }

    pub fn user_left(user_id: Uuid, file_id: Uuid) -> Self {
        Self::bare(Topic::UserLeft, user_id, file_id)
    }

    pub fn remove_active_live_user(user_id: Uuid, file_id: Uuid) -> Self {
        Self::bare(Topic::RemoveActiveLiveUser, user_id, file_id)
    }

    pub fn join_refused(user_id: Uuid, file_id: Uuid) -> Self {
        Self::bare(Topic::JoinRefused, user_id, file_id)
    }

    pub fn ping(user_id: Uuid) -> Self {
        Self::bare(Topic::Ping, user_id, Uuid::nil())
    }

    pub fn pong(user_id: Uuid) -> Self {
        Self::bare(Topic::Pong, user_id, Uuid::nil())
    }

    /// Same event under another topic (relay re-publishing `send-*` as `receive-*`).
    pub fn retopic(mut self, topic: Topic) -> Self {
        self.topic = topic;
        self
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (env, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(env)
    }

    pub fn join_request(&self) -> Result<JoinRequest, ProtocolError> {
        self.payload_as(&[Topic::JoinFile])
    }

    pub fn change(&self) -> Result<ChangeRecord, ProtocolError> {
        self.payload_as(&[Topic::SendChange])
    }

    pub fn log_entry(&self) -> Result<LogEntry, ProtocolError> {
        self.payload_as(&[Topic::ReceiveChange])
    }

    pub fn cursor(&self) -> Result<CursorPosition, ProtocolError> {
        self.payload_as(&[Topic::SendCursor, Topic::ReceiveCursor])
    }

    pub fn presence(&self) -> Result<TabUserPresence, ProtocolError> {
        self.payload_as(&[Topic::UserJoined, Topic::RosterReply])
    }

    fn payload_as<T: DeserializeOwned>(&self, topics: &[Topic]) -> Result<T, ProtocolError> {
        if !topics.contains(&self.topic) {
            return Err(ProtocolError::InvalidTopic(self.topic));
        }
        let (value, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(value)
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

/// Protocol and transport errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidTopic(Topic),
    /// Opening the socket failed (DNS, refused, TLS, handshake)
    ConnectFailed(String),
    ConnectionClosed,
    /// Outgoing queue is full; the frame was dropped
    Backpressure,
    NotJoined(Uuid),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidTopic(t) => write!(f, "Unexpected payload request for topic {}", t.name()),
            Self::ConnectFailed(e) => write!(f, "Connect failed: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Backpressure => write!(f, "Outgoing queue full"),
            Self::NotJoined(file) => write!(f, "Not joined to file {file}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<tokio_tungstenite::tungstenite::Error> for ProtocolError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ProtocolError::ConnectFailed(e.to_string())
    }
}
