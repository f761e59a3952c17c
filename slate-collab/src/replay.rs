//! History replay: a room's persisted events, oldest first.
//!
//! No filtering or compaction happens here. A room cleared ten times replays
//! all ten clears and every stroke between them.

use std::sync::Arc;

use crate::event::DrawingEvent;
use crate::protocol::RoomId;
use crate::storage::{EventLog, StoreError};

#[derive(Clone)]
pub struct ReplayService {
    log: Arc<dyn EventLog>,
}

impl ReplayService {
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        Self { log }
    }

    /// Read the full history of `room_id` in receipt order.
    pub async fn replay(&self, room_id: &RoomId) -> Result<Vec<DrawingEvent>, StoreError> {
        let log = Arc::clone(&self.log);
        let room = room_id.clone();
        let events = tokio::task::spawn_blocking(move || log.read(&room))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))??;
        log::debug!("Replaying {} event(s) for room {}", events.len(), room_id);
        Ok(events)
    }
}
