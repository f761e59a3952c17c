//! Local undo/redo over raster snapshots.
//!
//! Each entry is the raster as it was before one local action, plus the
//! remote events that were applied on top of it since. Restoring an entry
//! reapplies those remote events, so undoing a local action never retracts
//! what other participants drew in the meantime.
//!
//! The remote events carried by an entry are capped. Once the newest entry
//! would exceed the cap it and every older entry are discarded, since none
//! of them can be restored without it.

use std::collections::VecDeque;

use slate_collab::event::EventPayload;

use crate::raster::Raster;

/// Maximum number of undo states to keep.
pub const DEFAULT_UNDO_DEPTH: usize = 50;

/// Maximum remote events an entry may carry before history is dropped.
pub const DEFAULT_MAX_REPLAY: usize = 512;

#[derive(Debug, Clone)]
struct Snapshot {
    raster: Raster,
    /// Remote events applied after this snapshot was current.
    replay: Vec<EventPayload>,
}

impl Snapshot {
    fn new(raster: Raster) -> Self {
        Self {
            raster,
            replay: Vec::new(),
        }
    }
}

/// What to put back on undo or redo: a raster and the remote events to
/// reapply over it, oldest first.
#[derive(Debug, Clone)]
pub struct Restore {
    pub raster: Raster,
    pub replay: Vec<EventPayload>,
}

/// Bounded undo/redo history.
#[derive(Debug, Clone)]
pub struct SnapshotStack {
    undo: VecDeque<Snapshot>,
    redo: Vec<Snapshot>,
    depth: usize,
    max_replay: usize,
}

impl Default for SnapshotStack {
    fn default() -> Self {
        Self::new(DEFAULT_UNDO_DEPTH)
    }
}

impl SnapshotStack {
    pub fn new(depth: usize) -> Self {
        Self::with_limits(depth, DEFAULT_MAX_REPLAY)
    }

    pub fn with_limits(depth: usize, max_replay: usize) -> Self {
        Self {
            undo: VecDeque::new(),
            redo: Vec::new(),
            depth: depth.max(1),
            max_replay,
        }
    }

    /// Save `raster` before a local action. Clears redo; evicts the oldest
    /// entry beyond the depth.
    pub fn push(&mut self, raster: &Raster) {
        self.undo.push_back(Snapshot::new(raster.clone()));
        self.redo.clear();
        while self.undo.len() > self.depth {
            self.undo.pop_front();
        }
    }

    /// Note a remote event that was just applied to the live raster.
    pub fn record_remote(&mut self, payload: &EventPayload) {
        if let Some(top) = self.undo.back_mut() {
            top.replay.push(payload.clone());
        }
        if let Some(top) = self.redo.last_mut() {
            top.replay.push(payload.clone());
        }
        self.enforce_replay_cap();
    }

    fn enforce_replay_cap(&mut self) {
        let max = self.max_replay;
        if self.undo.back().is_some_and(|top| top.replay.len() > max) {
            log::debug!("Undo history outgrown by {max}+ remote events, dropping it");
            self.undo.clear();
        }
        if self.redo.last().is_some_and(|top| top.replay.len() > max) {
            log::debug!("Redo history outgrown by {max}+ remote events, dropping it");
            self.redo.clear();
        }
    }

    /// Pop the latest local action. `current` is the raster being replaced.
    pub fn undo(&mut self, current: &Raster) -> Option<Restore> {
        let entry = self.undo.pop_back()?;
        if let Some(below) = self.undo.back_mut() {
            below.replay.extend(entry.replay.iter().cloned());
        }
        self.redo.push(Snapshot::new(current.clone()));
        self.enforce_replay_cap();
        Some(Restore {
            raster: entry.raster,
            replay: entry.replay,
        })
    }

    /// Reapply the latest undone action. `current` is the raster being
    /// replaced.
    pub fn redo(&mut self, current: &Raster) -> Option<Restore> {
        let entry = self.redo.pop()?;
        if let Some(below) = self.redo.last_mut() {
            below.replay.extend(entry.replay.iter().cloned());
        }
        self.undo.push_back(Snapshot::new(current.clone()));
        while self.undo.len() > self.depth {
            self.undo.pop_front();
        }
        self.enforce_replay_cap();
        Some(Restore {
            raster: entry.raster,
            replay: entry.replay,
        })
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn undo_len(&self) -> usize {
        self.undo.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo.len()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Remote events held across all entries.
    pub fn replay_len(&self) -> usize {
        self.undo.iter().chain(self.redo.iter()).map(|s| s.replay.len()).sum()
    }

    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::Color;

    fn raster_with(marker: u32) -> Raster {
        let mut r = Raster::new(16, 1, Color::WHITE);
        r.put(marker as i64, 0, Color::BLACK);
        r
    }

    #[test]
    fn test_push_and_undo() {
        let mut stack = SnapshotStack::default();
        assert!(!stack.can_undo());

        stack.push(&raster_with(0));
        let restore = stack.undo(&raster_with(1)).unwrap();
        assert_eq!(restore.raster, raster_with(0));
        assert!(restore.replay.is_empty());
        assert!(stack.can_redo());

        let restore = stack.redo(&raster_with(0)).unwrap();
        assert_eq!(restore.raster, raster_with(1));
        assert!(stack.can_undo());
        assert!(!stack.can_redo());
    }

    #[test]
    fn test_depth_evicts_oldest() {
        let mut stack = SnapshotStack::new(3);
        for i in 0..5 {
            stack.push(&raster_with(i));
        }
        assert_eq!(stack.undo_len(), 3);

        let mut restored = Vec::new();
        while let Some(r) = stack.undo(&raster_with(15)) {
            restored.push(r.raster);
        }
        assert_eq!(restored, vec![raster_with(4), raster_with(3), raster_with(2)]);
    }

    #[test]
    fn test_new_action_clears_redo() {
        let mut stack = SnapshotStack::default();
        stack.push(&raster_with(0));
        stack.undo(&raster_with(1));
        assert!(stack.can_redo());

        stack.push(&raster_with(0));
        assert!(!stack.can_redo());
    }

    #[test]
    fn test_remote_events_follow_the_history() {
        let clear = EventPayload::clear();
        let mut stack = SnapshotStack::default();
        stack.push(&raster_with(0));
        stack.push(&raster_with(1));
        stack.record_remote(&clear);

        // Undoing the second action carries the remote event with it...
        let restore = stack.undo(&raster_with(2)).unwrap();
        assert_eq!(restore.replay, vec![clear.clone()]);
        // ...and hands it down to the first.
        let restore = stack.undo(&raster_with(3)).unwrap();
        assert_eq!(restore.replay, vec![clear.clone()]);
    }

    #[test]
    fn test_busy_room_does_not_grow_history_without_bound() {
        let clear = EventPayload::clear();
        let mut stack = SnapshotStack::with_limits(DEFAULT_UNDO_DEPTH, 8);
        stack.push(&raster_with(0));
        for _ in 0..8 {
            stack.record_remote(&clear);
        }
        assert!(stack.can_undo());
        assert_eq!(stack.replay_len(), 8);

        for _ in 0..10_000 {
            stack.record_remote(&clear);
            assert!(stack.replay_len() <= 8);
        }
        assert!(!stack.can_undo());
        assert_eq!(stack.replay_len(), 0);

        // New local actions start a fresh history.
        stack.push(&raster_with(1));
        assert!(stack.can_undo());
    }

    #[test]
    fn test_undo_inheriting_too_much_replay_drops_older_entries() {
        let clear = EventPayload::clear();
        let mut stack = SnapshotStack::with_limits(DEFAULT_UNDO_DEPTH, 4);
        stack.push(&raster_with(0));
        for _ in 0..3 {
            stack.record_remote(&clear);
        }
        stack.push(&raster_with(1));
        for _ in 0..3 {
            stack.record_remote(&clear);
        }

        // The older entry would inherit 6 events: it is dropped.
        let restore = stack.undo(&raster_with(2)).unwrap();
        assert_eq!(restore.replay.len(), 3);
        assert!(!stack.can_undo());
        assert!(stack.can_redo());
    }

    #[test]
    fn test_remote_events_recorded_into_redo() {
        let clear = EventPayload::clear();
        let mut stack = SnapshotStack::default();
        stack.push(&raster_with(0));
        stack.undo(&raster_with(1));
        stack.record_remote(&clear);

        let restore = stack.redo(&raster_with(0)).unwrap();
        assert_eq!(restore.raster, raster_with(1));
        assert_eq!(restore.replay, vec![clear]);
    }
}
