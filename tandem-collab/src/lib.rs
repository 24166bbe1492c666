//! # tandem-collab: Real-time collaboration for tandem
//!
//! Relays edits, presence and cursors between clients that have the same
//! file open, and persists file contents behind a debounce.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐     WebSocket      ┌───────────────┐
//! │ ClientSession │ ◄────────────────► │ RelayServer   │
//! │ (per user)    │    bincode frames  │ (central)     │
//! └───────┬───────┘                    └───────┬───────┘
//!         │                                    │
//!         ▼                                    ▼
//! ┌───────────────┐                    ┌───────────────┐
//! │ FileEditor    │                    │ Room per file │
//! │ TabRegistry   │                    │ seq, fan-out  │
//! │ CursorBoard   │                    └───────┬───────┘
//! └───────┬───────┘                            │
//!         │ debounced save                     │ append_change
//!         ▼                                    ▼
//! ┌───────────────┐                    ┌───────────────┐
//! │ ContentStore  │                    │ FileStore     │
//! └───────────────┘                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Topic-tagged envelopes (bincode)
//! - [`relay`]: Rooms with sequence stamping and fan-out
//! - [`server`]: WebSocket relay server
//! - [`client`]: WebSocket client and the [`RelaySink`] seam
//! - [`editor`]: Local edits to change records, remote apply without echo
//! - [`presence`]: Per-tab presence state machine and rosters
//! - [`cursor`]: Live cursor table and markers
//! - [`debounce`]: Coalesced saves
//! - [`session`]: The per-user orchestrator
//! - [`storage`]: HTTP, RocksDB and in-memory content stores
//!
//! Concurrent edits are not transformed or merged. Each record is replayed
//! at its recorded coordinates, clipped to the receiving buffer.

pub mod client;
pub mod cursor;
pub mod debounce;
pub mod editor;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use client::{ConnectionState, RelayClient, RelayEvent, RelaySink};
pub use cursor::{CursorBoard, CursorColor, CursorMarker, CursorPosition};
pub use debounce::{DebounceConfig, PersistenceDebouncer, SaveNotice};
pub use editor::FileEditor;
pub use presence::{
    PresenceError, PresenceEvent, PresenceRoster, PresenceState, TabRegistry, TabUserPresence,
    UserIdentity,
};
pub use protocol::{Envelope, JoinRequest, ProtocolError, Topic};
pub use relay::{Frame, Member, Room, RoomFull, RoomManager, RoomStats, Stamp};
pub use server::{RelayServer, ServerConfig, ServerStats};
pub use session::{ClientSession, SessionConfig, SessionError};
pub use storage::{
    ContentStore, FileMetadata, FileStore, HttpStore, HttpStoreConfig, MemoryStore, StoreConfig,
    StoreError,
};
