//! Binary protocol between canvas clients and the sync server.
//!
//! Every WebSocket binary frame carries exactly one bincode-encoded
//! [`ClientMessage`] (client → server) or [`ServerMessage`] (server → client):
//! ```text
//! ┌─────────────┬────────────────────────────────────────────┐
//! │ variant tag │ fields (room id, participant, payload, …)  │
//! │ varint      │ variable                                   │
//! └─────────────┴────────────────────────────────────────────┘
//! ```
//!
//! Frames that fail to decode are logged and dropped; they never close the
//! connection.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::{DrawingEvent, EventPayload};
use crate::presence;

/// Opaque room identifier chosen by the client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for RoomId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Stable identity of a person across connections and reloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantId(Uuid);

impl ParticipantId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One live transport session. A participant may hold several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Participant identity with display metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub participant_id: ParticipantId,
    pub display_name: String,
    /// `#rrggbb`
    pub display_color: String,
}

impl ParticipantInfo {
    pub fn new(
        participant_id: ParticipantId,
        display_name: impl Into<String>,
        display_color: impl Into<String>,
    ) -> Self {
        Self {
            participant_id,
            display_name: display_name.into(),
            display_color: display_color.into(),
        }
    }

    /// Create with a color derived from the participant id.
    pub fn with_derived_color(participant_id: ParticipantId, display_name: impl Into<String>) -> Self {
        Self::new(
            participant_id,
            display_name,
            presence::color_for(participant_id),
        )
    }

    /// Random participant id, derived color. Mostly for tests and demos.
    pub fn anonymous(display_name: impl Into<String>) -> Self {
        Self::with_derived_color(ParticipantId::random(), display_name)
    }
}

/// Distinct participants currently in a room.
///
/// A participant connected from several tabs appears once.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Roster {
    pub entries: Vec<ParticipantInfo>,
    pub count: usize,
}

impl Roster {
    /// Build a roster from per-connection member records, collapsing
    /// connections of the same participant. Entries are sorted by id.
    pub fn from_members<'a>(members: impl IntoIterator<Item = &'a ParticipantInfo>) -> Self {
        let mut entries: Vec<ParticipantInfo> = Vec::new();
        for info in members {
            if !entries.iter().any(|e| e.participant_id == info.participant_id) {
                entries.push(info.clone());
            }
        }
        entries.sort_by_key(|e| e.participant_id);
        let count = entries.len();
        Self { entries, count }
    }

    pub fn contains(&self, participant_id: ParticipantId) -> bool {
        self.entries.iter().any(|e| e.participant_id == participant_id)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Client → server messages.
///
/// Messages that name a room other than the one the connection joined are
/// dropped by the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    JoinRoom {
        participant_id: ParticipantId,
        room_id: RoomId,
        display_name: String,
        /// Derived from `participant_id` when absent.
        display_color: Option<String>,
    },
    PointerMove {
        room_id: RoomId,
        x: f32,
        y: f32,
        is_actively_drawing: bool,
    },
    LaserPointer {
        room_id: RoomId,
        x: f32,
        y: f32,
    },
    /// `drawing-stroke`, `drawing-shape`, `drawing-text` or `canvas-clear`
    /// depending on the payload kind.
    Submit {
        room_id: RoomId,
        payload: EventPayload,
    },
    /// Re-read a room's full history without joining it.
    FetchHistory { room_id: RoomId },
    Ping,
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::JoinRoom { .. } => "join-room",
            ClientMessage::PointerMove { .. } => "pointer-move",
            ClientMessage::LaserPointer { .. } => "laser-pointer",
            ClientMessage::Submit { payload, .. } => payload.kind().submit_name(),
            ClientMessage::FetchHistory { .. } => "fetch-history",
            ClientMessage::Ping => "ping",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// Server → client messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Full room history in receipt order. Sent once on join and on request.
    History {
        room_id: RoomId,
        events: Vec<DrawingEvent>,
    },
    /// Join rejected; the connection stays open but unregistered.
    JoinFailed { room_id: RoomId, reason: String },
    ParticipantJoined {
        participant: ParticipantInfo,
        roster: Roster,
    },
    ParticipantLeft {
        participant_id: ParticipantId,
        display_name: String,
        roster_count: usize,
    },
    PointerUpdate {
        participant: ParticipantInfo,
        x: f32,
        y: f32,
        is_actively_drawing: bool,
    },
    LaserUpdate {
        participant: ParticipantInfo,
        x: f32,
        y: f32,
    },
    PointerRetract { participant_id: ParticipantId },
    /// A live drawing event from another connection. `receipt_order` is
    /// `None` when the event could not be persisted.
    Broadcast {
        author_id: ParticipantId,
        payload: EventPayload,
        receipt_order: Option<u64>,
    },
    Pong,
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::History { .. } => "room-history",
            ServerMessage::JoinFailed { .. } => "join-failed",
            ServerMessage::ParticipantJoined { .. } => "participant-joined",
            ServerMessage::ParticipantLeft { .. } => "participant-left",
            ServerMessage::PointerUpdate { .. } => "pointer-update",
            ServerMessage::LaserUpdate { .. } => "laser-pointer",
            ServerMessage::PointerRetract { .. } => "pointer-retract",
            ServerMessage::Broadcast { payload, .. } => payload.kind().broadcast_name(),
            ServerMessage::Pong => "pong",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _): (T, usize) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
}
