//! Durable per-room event logs.
//!
//! ```text
//! ┌──────────────┐  append (spawn_blocking)  ┌──────────────────────────────┐
//! │ Engine       │ ────────────────────────► │ EventLog                     │
//! │ (ingest,     │                           │  MemoryEventLog  (tests/dev) │
//! │  replay)     │ ◄──────────────────────── │  RocksEventLog   (RocksDB)   │
//! └──────────────┘  read (receipt order)     └──────────────────────────────┘
//! ```
//!
//! The log assigns each event its receipt order: 1, 2, 3, … per room,
//! continuing across restarts for durable backends. Events are never
//! rewritten or deleted; a clear is just another event.
//!
//! Implementations are synchronous. Async callers go through
//! `tokio::task::spawn_blocking`.

pub mod memory;
pub mod rocks;

pub use memory::MemoryEventLog;
pub use rocks::{RocksEventLog, RoomMetadata, StoreConfig};

use crate::event::{DrawingEvent, EventPayload};
use crate::protocol::{ParticipantId, RoomId};

/// Append-only, per-room ordered storage for drawing events.
pub trait EventLog: Send + Sync {
    /// Durably record `payload` and return it with its assigned receipt
    /// order. Nothing is recorded on error.
    fn append(
        &self,
        room_id: &RoomId,
        author_id: ParticipantId,
        payload: EventPayload,
    ) -> Result<DrawingEvent, StoreError>;

    /// All events of a room in ascending receipt order. Unknown rooms are
    /// empty, not an error.
    fn read(&self, room_id: &RoomId) -> Result<Vec<DrawingEvent>, StoreError>;

    fn event_count(&self, room_id: &RoomId) -> Result<u64, StoreError>;

    /// Rooms with at least one recorded event.
    fn rooms(&self) -> Result<Vec<RoomId>, StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Not found: {0}")]
    NotFound(String),
    /// The backend could not be reached at all (task failure, poisoned lock).
    #[error("Event log unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}
