//! Per-file rooms with fan-out to every member but the sender.
//!
//! Each room owns one tokio broadcast channel. Frames carry the connection
//! id that published them so a member's forwarder can drop its own echo
//! without decoding the bytes. Members that fall more than `capacity` frames
//! behind lose the oldest frames (the relay is best-effort).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{Envelope, ProtocolError};

/// An encoded envelope in flight through a room.
#[derive(Debug)]
pub struct Frame {
    /// Connection that published the frame
    pub origin: Uuid,
    pub bytes: Vec<u8>,
}

/// One subscribed connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub connection_id: Uuid,
    pub user_id: Uuid,
    pub project_id: Uuid,
}

#[derive(Debug, Clone, Default)]
pub struct RoomStats {
    pub frames_sent: u64,
    pub last_seq: u64,
    pub last_change_seq: u64,
    pub active_members: usize,
}

/// Sequence numbers handed out by one publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamp {
    /// Position among every frame of the room
    pub seq: u64,
    /// Position among the room's changes; 0 for other frames
    pub change_seq: u64,
}

#[derive(Debug, Default)]
struct Sequencer {
    frames: u64,
    changes: u64,
}

/// Join refused by the room's member cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomFull {
    pub file_id: Uuid,
    pub limit: usize,
}

impl std::fmt::Display for RoomFull {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Room {} is full ({} members)", self.file_id, self.limit)
    }
}

impl std::error::Error for RoomFull {}

/// Relay room for a single file.
pub struct Room {
    file_id: Uuid,
    sender: broadcast::Sender<Arc<Frame>>,
    members: RwLock<HashMap<Uuid, Member>>,
    capacity: usize,
    /// Held across encode and send so frames leave in sequence order.
    sequencer: Mutex<Sequencer>,
    frames_sent: AtomicU64,
}

impl Room {
    pub fn new(file_id: Uuid, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            file_id,
            sender,
            members: RwLock::new(HashMap::new()),
            capacity,
            sequencer: Mutex::new(Sequencer::default()),
            frames_sent: AtomicU64::new(0),
        }
    }

    pub fn file_id(&self) -> Uuid {
        self.file_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Add a member and hand back its receiver.
    ///
    /// Rooms held by a [`RoomManager`] should be joined through
    /// [`RoomManager::join`], which keeps the room in the map while it has
    /// members.
    pub async fn add_member(&self, member: Member) -> broadcast::Receiver<Arc<Frame>> {
        let mut members = self.members.write().await;
        members.insert(member.connection_id, member);
        self.sender.subscribe()
    }

    pub async fn remove_member(&self, connection_id: &Uuid) -> Option<Member> {
        self.members.write().await.remove(connection_id)
    }

    /// Stamp the next frame sequence number, build the envelope with it and
    /// fan it out. Returns the stamped sequence number.
    pub fn relay_with<F>(&self, origin: Uuid, build: F) -> Result<u64, ProtocolError>
    where
        F: FnOnce(u64) -> Result<Envelope, ProtocolError>,
    {
        self.publish(origin, false, |stamp| build(stamp.seq))
            .map(|stamp| stamp.seq)
    }

    /// Like [`Room::relay_with`], but the frame is a change and also takes the
    /// room's next change sequence number. `build` receives that number.
    pub fn relay_change_with<F>(&self, origin: Uuid, build: F) -> Result<Stamp, ProtocolError>
    where
        F: FnOnce(u64) -> Result<Envelope, ProtocolError>,
    {
        self.publish(origin, true, |stamp| build(stamp.change_seq))
    }

    fn publish<F>(&self, origin: Uuid, is_change: bool, build: F) -> Result<Stamp, ProtocolError>
    where
        F: FnOnce(Stamp) -> Result<Envelope, ProtocolError>,
    {
        let mut next = self.sequencer.lock().unwrap_or_else(|e| e.into_inner());
        let stamp = Stamp {
            seq: next.frames + 1,
            change_seq: if is_change { next.changes + 1 } else { 0 },
        };
        let mut envelope = build(stamp)?;
        envelope.seq = stamp.seq;
        let bytes = envelope.encode()?;
        next.frames = stamp.seq;
        if is_change {
            next.changes = stamp.change_seq;
        }
        // No receivers is fine: the sender may be the only member.
        let _ = self.sender.send(Arc::new(Frame { origin, bytes }));
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(stamp)
    }

    /// Fan out an envelope as-is, stamping only its sequence number.
    pub fn relay(&self, origin: Uuid, envelope: Envelope) -> Result<u64, ProtocolError> {
        self.relay_with(origin, move |_| Ok(envelope))
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn members(&self) -> Vec<Member> {
        self.members.read().await.values().cloned().collect()
    }

    pub async fn has_member(&self, connection_id: &Uuid) -> bool {
        self.members.read().await.contains_key(connection_id)
    }

    pub fn last_seq(&self) -> u64 {
        self.sequencer.lock().unwrap_or_else(|e| e.into_inner()).frames
    }

    pub fn last_change_seq(&self) -> u64 {
        self.sequencer.lock().unwrap_or_else(|e| e.into_inner()).changes
    }

    pub async fn stats(&self) -> RoomStats {
        RoomStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            last_seq: self.last_seq(),
            last_change_seq: self.last_change_seq(),
            active_members: self.member_count().await,
        }
    }
}

/// Maps file ids to rooms.
///
/// Membership changes go through the manager's write lock, so a room is in
/// the map exactly while it has members.
pub struct RoomManager {
    rooms: RwLock<HashMap<Uuid, Arc<Room>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Add a member to a file's room, creating the room if needed.
    pub async fn join(
        &self,
        file_id: Uuid,
        member: Member,
        max_members: usize,
    ) -> Result<(Arc<Room>, broadcast::Receiver<Arc<Frame>>), RoomFull> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(file_id)
            .or_insert_with(|| Arc::new(Room::new(file_id, self.default_capacity)))
            .clone();
        let count = room.member_count().await;
        if count >= max_members {
            if count == 0 {
                rooms.remove(&file_id);
            }
            return Err(RoomFull {
                file_id,
                limit: max_members,
            });
        }
        let rx = room.add_member(member).await;
        Ok((room, rx))
    }

    /// Remove a member, dropping the room once its last member is gone.
    pub async fn leave(&self, file_id: &Uuid, connection_id: &Uuid) -> Option<Member> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get(file_id)?.clone();
        let member = room.remove_member(connection_id).await;
        if room.member_count().await == 0 {
            rooms.remove(file_id);
        }
        member
    }

    pub async fn get(&self, file_id: &Uuid) -> Option<Arc<Room>> {
        self.rooms.read().await.get(file_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_files(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
