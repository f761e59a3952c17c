//! In-process event log. Lost on restart.

use std::collections::HashMap;
use std::sync::RwLock;

use super::{EventLog, StoreError};
use crate::event::{now_millis, DrawingEvent, EventPayload};
use crate::protocol::{ParticipantId, RoomId};

#[derive(Default)]
pub struct MemoryEventLog {
    rooms: RwLock<HashMap<RoomId, Vec<DrawingEvent>>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> StoreError {
    StoreError::Unavailable("memory log lock poisoned".into())
}

impl EventLog for MemoryEventLog {
    fn append(
        &self,
        room_id: &RoomId,
        author_id: ParticipantId,
        payload: EventPayload,
    ) -> Result<DrawingEvent, StoreError> {
        let mut rooms = self.rooms.write().map_err(|_| poisoned())?;
        let events = rooms.entry(room_id.clone()).or_default();
        let event = DrawingEvent {
            room_id: room_id.clone(),
            author_id,
            payload,
            receipt_order: events.len() as u64 + 1,
            received_at_ms: now_millis(),
        };
        events.push(event.clone());
        Ok(event)
    }

    fn read(&self, room_id: &RoomId) -> Result<Vec<DrawingEvent>, StoreError> {
        let rooms = self.rooms.read().map_err(|_| poisoned())?;
        Ok(rooms.get(room_id).cloned().unwrap_or_default())
    }

    fn event_count(&self, room_id: &RoomId) -> Result<u64, StoreError> {
        let rooms = self.rooms.read().map_err(|_| poisoned())?;
        Ok(rooms.get(room_id).map_or(0, |events| events.len() as u64))
    }

    fn rooms(&self) -> Result<Vec<RoomId>, StoreError> {
        let rooms = self.rooms.read().map_err(|_| poisoned())?;
        Ok(rooms.keys().cloned().collect())
    }
}
