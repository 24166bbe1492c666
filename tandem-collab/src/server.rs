//! WebSocket relay server with one room per file.
//!
//! Architecture:
//! ```text
//! Client A ──┐                     ┌── forwarder ──► Client B
//!            ├── Room (file_id) ───┤
//! Client B ──┘    │  seq stamp     └── forwarder ──► Client A
//!                 │
//!                 └── FileStore (RocksDB, optional)
//!                         └── changes (project, seq)
//! ```
//!
//! The relay holds no document state. It stamps each frame with the room's
//! next sequence number, fans it out to every other member and appends
//! relayed changes to the project log when storage is configured. Changes
//! also carry a change-only sequence number in their log entry, so clients
//! can spot missed changes without seeing every frame.
//!
//! A connection may join any number of rooms. When it drops, the relay
//! tells each room that the user went away.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use tandem_core::LogEntry;

use crate::protocol::{Envelope, Topic};
use crate::relay::{Frame, Member, Room, RoomManager};
use crate::storage::{FileStore, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum connections per room
    pub max_members_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Change-log storage path (None = relay only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_members_per_room: 100,
            broadcast_capacity: 256,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            max_members_per_room: 8,
            broadcast_capacity: 64,
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub persisted_changes: u64,
}

#[derive(Default)]
struct Counters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    persisted_changes: AtomicU64,
}

/// Shared by every connection task.
struct Shared {
    config: ServerConfig,
    rooms: RoomManager,
    store: Option<Arc<FileStore>>,
    counters: Counters,
}

/// A room this connection has joined.
struct Joined {
    room: Arc<Room>,
    project_id: Uuid,
    forwarder: JoinHandle<()>,
}

/// The relay server.
pub struct RelayServer {
    shared: Arc<Shared>,
}

impl RelayServer {
    /// Create a server, opening the change-log store if a path is set.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Some(Arc::new(FileStore::open(store_config)?))
            }
            None => None,
        };

        Ok(Self {
            shared: Arc::new(Shared {
                rooms: RoomManager::new(config.broadcast_capacity),
                config,
                store,
                counters: Counters::default(),
            }),
        })
    }

    /// Create with default configuration (relay only, no persistence).
    pub fn with_defaults() -> Self {
        Self {
            shared: Arc::new(Shared {
                rooms: RoomManager::new(ServerConfig::default().broadcast_capacity),
                config: ServerConfig::default(),
                store: None,
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn store(&self) -> Option<&Arc<FileStore>> {
        self.shared.store.as_ref()
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.shared.rooms
    }

    pub async fn stats(&self) -> ServerStats {
        let c = &self.shared.counters;
        ServerStats {
            total_connections: c.total_connections.load(Ordering::Relaxed),
            active_connections: c.active_connections.load(Ordering::Relaxed),
            total_messages: c.total_messages.load(Ordering::Relaxed),
            total_bytes: c.total_bytes.load(Ordering::Relaxed),
            active_rooms: self.shared.rooms.room_count().await,
            persisted_changes: c.persisted_changes.load(Ordering::Relaxed),
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        log::info!("Relay listening on {}", listener.local_addr()?);
        self.run_on(listener).await
    }

    /// Serve on an already-bound listener.
    pub async fn run_on(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }
}

/// Per-connection state.
struct Connection {
    id: Uuid,
    addr: SocketAddr,
    /// Bound by the first envelope; later envelopes must match
    user_id: Option<Uuid>,
    joined: HashMap<Uuid, Joined>,
    out_tx: mpsc::UnboundedSender<Message>,
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<Shared>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::info!("WebSocket connection established from {addr}");

    shared.counters.total_connections.fetch_add(1, Ordering::Relaxed);
    shared.counters.active_connections.fetch_add(1, Ordering::Relaxed);

    // Forwarders and the reader all write through one queue.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let mut conn = Connection {
        id: Uuid::new_v4(),
        addr,
        user_id: None,
        joined: HashMap::new(),
        out_tx,
    };

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Binary(data)) => {
                shared.counters.total_messages.fetch_add(1, Ordering::Relaxed);
                shared
                    .counters
                    .total_bytes
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                match Envelope::decode(&data) {
                    Ok(envelope) => conn.dispatch(&shared, envelope).await,
                    Err(e) => log::warn!("Failed to decode frame from {addr}: {e}"),
                }
            }
            Ok(Message::Ping(data)) => {
                let _ = conn.out_tx.send(Message::Pong(data));
            }
            Ok(Message::Close(_)) => {
                log::info!("Connection closed from {addr}");
                break;
            }
            Err(e) => {
                log::error!("WebSocket error from {addr}: {e}");
                break;
            }
            _ => {}
        }
    }

    conn.disconnect(&shared).await;
    shared.counters.active_connections.fetch_sub(1, Ordering::Relaxed);
    drop(conn);
    let _ = writer.await;
    Ok(())
}

impl Connection {
    async fn dispatch(&mut self, shared: &Shared, envelope: Envelope) {
        let user_id = *self.user_id.get_or_insert(envelope.sender);
        if envelope.sender != user_id {
            log::warn!(
                "Connection {} bound to {user_id} sent a frame as {}, dropped",
                self.addr,
                envelope.sender
            );
            return;
        }

        match envelope.topic {
            Topic::JoinFile => self.join(shared, &envelope).await,
            Topic::LeaveFile => {
                self.relay(&envelope, envelope.clone());
                self.leave(shared, envelope.file_id).await;
            }
            Topic::SendChange => self.relay_change(shared, &envelope),
            Topic::SendCursor => {
                let relayed = envelope.clone().retopic(Topic::ReceiveCursor);
                self.relay(&envelope, relayed);
            }
            Topic::RemoveUserSpecificCursor => {
                for joined in self.joined.values() {
                    if let Err(e) = joined.room.relay(self.id, envelope.clone()) {
                        log::warn!("Failed to relay cursor removal: {e}");
                    }
                }
            }
            Topic::RemoveCursor
            | Topic::RosterQuery
            | Topic::RosterReply
            | Topic::UserJoined
            | Topic::UserLeft => self.relay(&envelope, envelope.clone()),
            Topic::Ping => self.send_direct(&Envelope::pong(user_id)),
            Topic::Pong => {}
            Topic::ReceiveChange
            | Topic::ReceiveCursor
            | Topic::RemoveActiveLiveUser
            | Topic::JoinRefused => {
                log::warn!(
                    "Client {} sent relay-only topic {}, dropped",
                    self.addr,
                    envelope.topic.name()
                );
            }
        }
    }

    async fn join(&mut self, shared: &Shared, envelope: &Envelope) {
        let file_id = envelope.file_id;
        if self.joined.contains_key(&file_id) {
            log::debug!("Connection {} already in room {file_id}", self.addr);
            return;
        }
        let request = match envelope.join_request() {
            Ok(request) => request,
            Err(e) => {
                log::warn!("Malformed join from {}: {e}", self.addr);
                return;
            }
        };

        let member = Member {
            connection_id: self.id,
            user_id: envelope.sender,
            project_id: request.project_id,
        };
        let (room, rx) = match shared
            .rooms
            .join(file_id, member, shared.config.max_members_per_room)
            .await
        {
            Ok(joined) => joined,
            Err(full) => {
                log::warn!("{full}, join from {} refused", self.addr);
                self.send_direct(&Envelope::join_refused(envelope.sender, file_id));
                return;
            }
        };
        let forwarder = spawn_forwarder(self.id, file_id, rx, self.out_tx.clone());
        self.joined.insert(
            file_id,
            Joined {
                room,
                project_id: request.project_id,
                forwarder,
            },
        );
        log::info!("User {} joined room {file_id}", envelope.sender);
    }

    async fn leave(&mut self, shared: &Shared, file_id: Uuid) {
        let Some(joined) = self.joined.remove(&file_id) else {
            return;
        };
        joined.forwarder.abort();
        shared.rooms.leave(&file_id, &self.id).await;
        log::info!("Connection {} left room {file_id}", self.addr);
    }

    /// Fan `relayed` out to the room named by `original`.
    fn relay(&self, original: &Envelope, relayed: Envelope) {
        let Some(joined) = self.joined.get(&original.file_id) else {
            log::warn!(
                "{} for unjoined room {} from {}, dropped",
                original.topic.name(),
                original.file_id,
                self.addr
            );
            return;
        };
        if let Err(e) = joined.room.relay(self.id, relayed) {
            log::warn!("Failed to relay {}: {e}", original.topic.name());
        }
    }

    fn relay_change(&self, shared: &Shared, envelope: &Envelope) {
        let Some(joined) = self.joined.get(&envelope.file_id) else {
            log::warn!(
                "Change for unjoined room {} from {}, dropped",
                envelope.file_id,
                self.addr
            );
            return;
        };
        let change = match envelope.change() {
            Ok(change) => change,
            Err(e) => {
                log::warn!("Malformed change from {}: {e}", self.addr);
                return;
            }
        };
        if change.file_id != envelope.file_id || change.author_id != envelope.sender {
            log::warn!("Change record does not match its envelope, dropped");
            return;
        }

        let mut relayed: Option<LogEntry> = None;
        let result = joined.room.relay_change_with(self.id, |change_seq| {
            let entry = LogEntry::relayed(change_seq, change);
            let out = Envelope::receive_change(&entry)?;
            relayed = Some(entry);
            Ok(out)
        });
        match result {
            Ok(stamp) => log::trace!(
                "Relayed change {} (frame {}) in {}",
                stamp.change_seq,
                stamp.seq,
                envelope.file_id
            ),
            Err(e) => {
                log::warn!("Failed to relay change: {e}");
                return;
            }
        }

        if let (Some(store), Some(entry)) = (&shared.store, relayed) {
            match store.append_change(joined.project_id, &entry) {
                Ok(_) => {
                    shared.counters.persisted_changes.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => log::error!(
                    "Failed to persist change for project {}: {e}",
                    joined.project_id
                ),
            }
        }
    }

    fn send_direct(&self, envelope: &Envelope) {
        match envelope.encode() {
            Ok(bytes) => {
                let _ = self.out_tx.send(Message::Binary(bytes.into()));
            }
            Err(e) => log::warn!("Failed to encode {}: {e}", envelope.topic.name()),
        }
    }

    /// Tell every joined room the user dropped, then leave them.
    async fn disconnect(&mut self, shared: &Shared) {
        let files: Vec<Uuid> = self.joined.keys().copied().collect();
        if let Some(user_id) = self.user_id {
            for joined in self.joined.values() {
                let file_id = joined.room.file_id();
                let notices = [
                    Envelope::remove_active_live_user(user_id, file_id),
                    Envelope::remove_user_specific_cursor(user_id),
                ];
                for notice in notices {
                    if let Err(e) = joined.room.relay(self.id, notice) {
                        log::warn!("Failed to relay disconnect notice: {e}");
                    }
                }
            }
        }
        for file_id in files {
            self.leave(shared, file_id).await;
        }
    }
}

/// Copy room frames from other connections into this connection's queue.
fn spawn_forwarder(
    connection_id: Uuid,
    file_id: Uuid,
    mut rx: broadcast::Receiver<Arc<Frame>>,
    out_tx: mpsc::UnboundedSender<Message>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(frame) => {
                    if frame.origin == connection_id {
                        continue;
                    }
                    if out_tx.send(Message::Binary(frame.bytes.clone().into())).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Connection {connection_id} lagged by {n} frames in room {file_id}");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
