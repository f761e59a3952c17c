//! Connection and room bookkeeping.
//!
//! The registry answers two questions: which room (and participant) a
//! connection belongs to, and which connections are in a room. Rooms are
//! created on first join and removed when their last connection leaves.
//!
//! Rooms live in a sharded map so joins and leaves in unrelated rooms do not
//! contend. Lock order is always map shard, then room members.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;

use crate::broadcast::BroadcastGroup;
use crate::protocol::{ConnectionId, ParticipantInfo, RoomId, Roster};

/// A registered connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub info: ParticipantInfo,
    pub room_id: RoomId,
    pub connection_id: ConnectionId,
}

/// Live state of one room.
pub struct Room {
    id: RoomId,
    members: Mutex<HashMap<ConnectionId, ParticipantInfo>>,
    broadcast: BroadcastGroup,
    /// Serializes persist-then-fan-out against history reads for joiners.
    sequencer: tokio::sync::Mutex<()>,
}

impl Room {
    fn new(id: RoomId, broadcast_capacity: usize) -> Self {
        Self {
            id,
            members: Mutex::new(HashMap::new()),
            broadcast: BroadcastGroup::new(broadcast_capacity),
            sequencer: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    pub fn broadcast(&self) -> &BroadcastGroup {
        &self.broadcast
    }

    pub(crate) fn sequencer(&self) -> &tokio::sync::Mutex<()> {
        &self.sequencer
    }

    fn lock_members(&self) -> MutexGuard<'_, HashMap<ConnectionId, ParticipantInfo>> {
        // Member maps hold plain data; a panic elsewhere cannot leave them torn.
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connection_count(&self) -> usize {
        self.lock_members().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_members().is_empty()
    }

    pub fn roster(&self) -> Roster {
        Roster::from_members(self.lock_members().values())
    }

    pub fn connections(&self) -> Vec<ConnectionId> {
        self.lock_members().keys().copied().collect()
    }
}

/// Result of a successful registration.
pub struct Joined {
    pub room: Arc<Room>,
    pub roster: Roster,
    /// The participant had no other connection in the room.
    pub first_connection: bool,
}

/// Result of removing a connection.
pub struct Departure {
    pub participant: Participant,
    pub room: Arc<Room>,
    /// The participant has no connection left in the room.
    pub last_connection: bool,
    pub roster: Roster,
    /// The room had no connections left and was dropped.
    pub room_closed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("connection {0} has already joined a room")]
    AlreadyJoined(ConnectionId),
    #[error("room {room} is full ({limit} connections)")]
    RoomFull { room: RoomId, limit: usize },
}

pub struct Registry {
    connections: DashMap<ConnectionId, Participant>,
    rooms: DashMap<RoomId, Arc<Room>>,
    broadcast_capacity: usize,
    max_connections_per_room: usize,
}

impl Registry {
    pub fn new(broadcast_capacity: usize, max_connections_per_room: usize) -> Self {
        Self {
            connections: DashMap::new(),
            rooms: DashMap::new(),
            broadcast_capacity,
            max_connections_per_room,
        }
    }

    /// Register `connection` as `info` in `room_id`, creating the room if
    /// needed.
    pub fn join(
        &self,
        connection: ConnectionId,
        info: ParticipantInfo,
        room_id: RoomId,
    ) -> Result<Joined, RegistryError> {
        if self.connections.contains_key(&connection) {
            return Err(RegistryError::AlreadyJoined(connection));
        }

        let entry = self
            .rooms
            .entry(room_id.clone())
            .or_insert_with(|| Arc::new(Room::new(room_id.clone(), self.broadcast_capacity)));
        let room = Arc::clone(entry.value());

        let admitted = {
            let mut members = room.lock_members();
            if members.len() >= self.max_connections_per_room {
                Err(RegistryError::RoomFull {
                    room: room_id.clone(),
                    limit: self.max_connections_per_room,
                })
            } else {
                let first_connection = !members
                    .values()
                    .any(|p| p.participant_id == info.participant_id);
                members.insert(connection, info.clone());
                Ok((Roster::from_members(members.values()), first_connection))
            }
        };
        drop(entry);

        let (roster, first_connection) = match admitted {
            Ok(admitted) => admitted,
            Err(e) => {
                // A room created by this call must not outlive the rejection.
                self.rooms.remove_if(&room_id, |_, r| r.is_empty());
                return Err(e);
            }
        };

        self.connections.insert(
            connection,
            Participant {
                info,
                room_id,
                connection_id: connection,
            },
        );

        Ok(Joined {
            room,
            roster,
            first_connection,
        })
    }

    /// Remove a connection. Returns `None` if it never joined.
    pub fn leave(&self, connection: ConnectionId) -> Option<Departure> {
        let (_, participant) = self.connections.remove(&connection)?;
        let room = self
            .rooms
            .get(&participant.room_id)
            .map(|r| Arc::clone(r.value()))?;

        let (roster, last_connection) = {
            let mut members = room.lock_members();
            members.remove(&connection);
            let still_present = members
                .values()
                .any(|p| p.participant_id == participant.info.participant_id);
            (Roster::from_members(members.values()), !still_present)
        };

        let room_closed = self
            .rooms
            .remove_if(&participant.room_id, |_, r| r.is_empty())
            .is_some();

        Some(Departure {
            participant,
            room,
            last_connection,
            roster,
            room_closed,
        })
    }

    pub fn lookup(&self, connection: ConnectionId) -> Option<Participant> {
        self.connections.get(&connection).map(|p| p.value().clone())
    }

    pub fn room(&self, room_id: &RoomId) -> Option<Arc<Room>> {
        self.rooms.get(room_id).map(|r| Arc::clone(r.value()))
    }

    /// Connections currently in `room_id`.
    pub fn room_members(&self, room_id: &RoomId) -> Vec<ConnectionId> {
        self.room(room_id)
            .map(|room| room.connections())
            .unwrap_or_default()
    }

    pub fn roster(&self, room_id: &RoomId) -> Roster {
        self.room(room_id)
            .map(|room| room.roster())
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
