//! Remote pointers and the room roster, as seen by one client.
//!
//! Pointer state is lossy: each update replaces the previous one, and an
//! entry that has not been refreshed within the staleness window is hidden
//! from readers even if no retract ever arrived.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use slate_collab::client::SyncEvent;
use slate_collab::protocol::{ParticipantId, ParticipantInfo, Roster};

/// Pointers older than this are treated as gone.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(3);

/// Last known position of a remote cursor or laser pointer.
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePointer {
    pub participant: ParticipantInfo,
    pub x: f32,
    pub y: f32,
    pub is_actively_drawing: bool,
    pub updated_at: Instant,
}

impl RemotePointer {
    pub fn is_stale(&self, now: Instant, stale_after: Duration) -> bool {
        now.saturating_duration_since(self.updated_at) > stale_after
    }
}

pub struct PointerView {
    local_id: ParticipantId,
    cursors: HashMap<ParticipantId, RemotePointer>,
    lasers: HashMap<ParticipantId, RemotePointer>,
    roster: Roster,
    stale_after: Duration,
}

impl PointerView {
    pub fn new(local_id: ParticipantId) -> Self {
        Self::with_stale_after(local_id, DEFAULT_STALE_AFTER)
    }

    pub fn with_stale_after(local_id: ParticipantId, stale_after: Duration) -> Self {
        Self {
            local_id,
            cursors: HashMap::new(),
            lasers: HashMap::new(),
            roster: Roster::default(),
            stale_after,
        }
    }

    pub fn update_pointer(
        &mut self,
        participant: ParticipantInfo,
        x: f32,
        y: f32,
        is_actively_drawing: bool,
        now: Instant,
    ) {
        if participant.participant_id == self.local_id {
            return;
        }
        self.cursors.insert(
            participant.participant_id,
            RemotePointer {
                participant,
                x,
                y,
                is_actively_drawing,
                updated_at: now,
            },
        );
    }

    pub fn update_laser(&mut self, participant: ParticipantInfo, x: f32, y: f32, now: Instant) {
        if participant.participant_id == self.local_id {
            return;
        }
        self.lasers.insert(
            participant.participant_id,
            RemotePointer {
                participant,
                x,
                y,
                is_actively_drawing: false,
                updated_at: now,
            },
        );
    }

    /// Drop a participant's cursor and laser.
    pub fn retract(&mut self, participant_id: ParticipantId) -> bool {
        let cursor = self.cursors.remove(&participant_id).is_some();
        let laser = self.lasers.remove(&participant_id).is_some();
        cursor || laser
    }

    /// Fresh cursors, ordered by participant id.
    pub fn cursors(&self, now: Instant) -> Vec<&RemotePointer> {
        self.fresh(&self.cursors, now)
    }

    /// Fresh laser pointers, ordered by participant id.
    pub fn lasers(&self, now: Instant) -> Vec<&RemotePointer> {
        self.fresh(&self.lasers, now)
    }

    fn fresh<'a>(
        &self,
        map: &'a HashMap<ParticipantId, RemotePointer>,
        now: Instant,
    ) -> Vec<&'a RemotePointer> {
        let mut out: Vec<_> = map
            .values()
            .filter(|p| !p.is_stale(now, self.stale_after))
            .collect();
        out.sort_by_key(|p| p.participant.participant_id);
        out
    }

    /// Remove expired entries; returns whose cursor expired.
    pub fn prune_stale(&mut self, now: Instant) -> Vec<ParticipantId> {
        let stale_after = self.stale_after;
        let mut expired: Vec<ParticipantId> = self
            .cursors
            .iter()
            .filter(|(_, p)| p.is_stale(now, stale_after))
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.cursors.remove(id);
        }
        self.lasers.retain(|_, p| !p.is_stale(now, stale_after));
        expired.sort();
        expired
    }

    /// Latest roster snapshot. After a departure only the count is exact
    /// until the next join refreshes the entries.
    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn participant_count(&self) -> usize {
        self.roster.count
    }

    /// Feed a client event. Returns whether pointer or roster state changed.
    pub fn handle_sync_event(&mut self, event: &SyncEvent, now: Instant) -> bool {
        match event {
            SyncEvent::ParticipantJoined { roster, .. } => {
                self.roster = roster.clone();
                true
            }
            SyncEvent::ParticipantLeft {
                participant_id,
                roster_count,
                ..
            } => {
                self.roster.entries.retain(|p| p.participant_id != *participant_id);
                self.roster.count = *roster_count;
                self.retract(*participant_id);
                true
            }
            SyncEvent::Pointer {
                participant,
                x,
                y,
                is_actively_drawing,
            } => {
                self.update_pointer(participant.clone(), *x, *y, *is_actively_drawing, now);
                true
            }
            SyncEvent::Laser { participant, x, y } => {
                self.update_laser(participant.clone(), *x, *y, now);
                true
            }
            SyncEvent::PointerRetract { participant_id } => self.retract(*participant_id),
            SyncEvent::Disconnected => {
                self.cursors.clear();
                self.lasers.clear();
                self.roster = Roster::default();
                true
            }
            _ => false,
        }
    }
}
