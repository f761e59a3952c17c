//! # slate-collab — Real-time room sync for Slate whiteboards
//!
//! Relays drawing events between everyone in a room, persists them in
//! receipt order and replays them to late joiners.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     Binary Proto    │ (central)   │
//! └─────────────┘                     └──────┬──────┘
//!                                            │ Session per connection
//!                                     ┌──────┴──────┐
//!                                     │   Engine    │
//!                                     └──┬───────┬──┘
//!                                        │       │
//!                              ┌─────────┴─┐   ┌─┴──────────────┐
//!                              │ Registry  │   │ EventLog       │
//!                              │ rooms +   │   │ memory/RocksDB │
//!                              │ fan-out   │   └────────────────┘
//!                              └───────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded client/server messages)
//! - [`event`]: Drawing events and their payloads
//! - [`broadcast`]: Per-room fan-out with lag accounting
//! - [`registry`]: Connection to room membership
//! - [`presence`]: Join/leave announcements and participant colors
//! - [`relay`]: Cursor and laser-pointer throttling
//! - [`replay`]: Room history for joiners
//! - [`engine`]: Join, ingest and relay orchestration
//! - [`session`]: Per-connection message handling
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client
//! - [`storage`]: Durable event log

pub mod protocol;
pub mod event;
pub mod broadcast;
pub mod registry;
pub mod presence;
pub mod relay;
pub mod replay;
pub mod engine;
pub mod session;
pub mod server;
pub mod client;
pub mod storage;

// Re-exports for convenience
pub use protocol::{
    ClientMessage, ConnectionId, ParticipantId, ParticipantInfo, ProtocolError, RoomId, Roster,
    ServerMessage,
};
pub use event::{
    DrawingEvent, EventKind, EventPayload, Point, ShapeKind, ShapePayload, StrokePayload,
    StrokeTool, TextPayload,
};
pub use broadcast::{BroadcastGroup, BroadcastStats, Envelope};
pub use registry::{Departure, Participant, Registry, RegistryError, Room};
pub use relay::{LaserSignal, PointerSignal, SignalRelay, SignalThrottle};
pub use replay::ReplayService;
pub use engine::{Engine, IngestOutcome, JoinError, JoinTicket};
pub use session::{Handled, Session};
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer};
pub use client::{ConnectionState, SyncClient, SyncEvent};
pub use storage::{EventLog, MemoryEventLog, RocksEventLog, RoomMetadata, StoreConfig, StoreError};
