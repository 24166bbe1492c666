//! Durable storage boundary for file contents and the change log.
//!
//! ```text
//! ┌───────────────┐  save (debounced)  ┌──────────────────────────────┐
//! │ ClientSession │ ─────────────────► │ ContentStore                 │
//! │               │ ◄───────────────── │  ├─ HttpStore  (REST)        │
//! └───────────────┘  fetch on open     │  ├─ FileStore  (RocksDB)     │
//!                                      │  └─ MemoryStore (embedded)   │
//! ┌───────────────┐  append_change     └──────────────────────────────┘
//! │ RelayServer   │ ─────────────────► FileStore CF "changes"
//! └───────────────┘
//! ```
//!
//! The file row is the only durable shared resource. Two clients saving the
//! same file race and the later write wins.

pub mod http;
pub mod memory;
pub mod rocks;

pub use http::{HttpStore, HttpStoreConfig};
pub use memory::MemoryStore;
pub use rocks::{FileMetadata, FileStore, StoreConfig};

use std::future::Future;
use uuid::Uuid;

use tandem_core::LogEntry;

/// Where file contents live between sessions.
pub trait ContentStore: Send + Sync + 'static {
    /// Canonical text of a file. `NotFound` if it was never saved.
    fn fetch_content(
        &self,
        project_id: Uuid,
        file_id: Uuid,
    ) -> impl Future<Output = Result<String, StoreError>> + Send;

    /// Overwrite the canonical text of a file.
    fn save_content(
        &self,
        project_id: Uuid,
        file_id: Uuid,
        content: String,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Server-side change log of a project, oldest first.
    fn fetch_change_log(
        &self,
        project_id: Uuid,
    ) -> impl Future<Output = Result<Vec<LogEntry>, StoreError>> + Send;
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// File not found
    NotFound(Uuid),
    /// File is stored under a different project
    WrongProject { file_id: Uuid, project_id: Uuid },
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
    /// Remote store answered with a non-success status
    Http { status: u16 },
    /// Remote store could not be reached
    Transport(String),
    IoError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "File not found: {id}"),
            StoreError::WrongProject { file_id, project_id } => {
                write!(f, "File {file_id} belongs to project {project_id}")
            }
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::Http { status } => write!(f, "Store responded with HTTP {status}"),
            StoreError::Transport(e) => write!(f, "Transport error: {e}"),
            StoreError::IoError(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => StoreError::Http {
                status: status.as_u16(),
            },
            None if e.is_decode() => StoreError::DeserializationError(e.to_string()),
            None => StoreError::Transport(e.to_string()),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::IoError(e.to_string())
    }
}
