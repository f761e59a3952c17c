//! Per-room canvas view: applies history and live events to one raster.
//!
//! ```text
//!            join / Disconnected            History applied
//!   ──────►  Replaying  ─────────────────────────────►  Live
//!            (live events buffered)                    (applied on arrival)
//! ```
//!
//! Events are painted strictly in arrival order with no conflict resolution:
//! overlapping marks simply paint over each other. Undo and redo are local
//! to this view and never leave it.
//!
//! The server never echoes a participant's own events back, so a jump in
//! receipt order is only a gap when it is larger than the number of local
//! edits not yet accounted for. A gap sets [`CanvasView::needs_resync`];
//! the caller should then fetch the room history and reload it.

use std::borrow::Cow;

use slate_collab::client::SyncEvent;
use slate_collab::event::{DrawingEvent, EventPayload, StrokeTool};

use crate::raster::{Color, ColorError, Raster};
use crate::render::{FlatRenderer, Renderer};
use crate::undo::{SnapshotStack, DEFAULT_UNDO_DEPTH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewState {
    /// Waiting for the room history; live events are held back.
    Replaying,
    Live,
}

/// What happened to a remote event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    Applied,
    /// Held until history has been applied.
    Buffered,
    /// Receipt order already applied.
    Duplicate,
    /// Applied, but `missing` earlier events never arrived.
    AppliedAfterGap { missing: u64 },
}

impl RemoteOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied | Self::AppliedAfterGap { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CanvasError {
    /// Local edits before history has loaded would be painted under it.
    #[error("canvas is still replaying history")]
    NotLive,
    #[error(transparent)]
    InvalidColor(#[from] ColorError),
}

/// The client-side view of one room's canvas.
pub struct CanvasView<R: Renderer = FlatRenderer> {
    state: ViewState,
    raster: Raster,
    renderer: R,
    history: SnapshotStack,
    pending: Vec<(EventPayload, Option<u64>)>,
    last_order: Option<u64>,
    /// Local edits submitted since the last receipt order we saw.
    unconfirmed_local: u64,
    needs_resync: bool,
    preview: Option<EventPayload>,
}

impl CanvasView<FlatRenderer> {
    pub fn new(width: u32, height: u32, background: Color) -> Self {
        Self::with_renderer(width, height, background, FlatRenderer)
    }
}

impl<R: Renderer> CanvasView<R> {
    pub fn with_renderer(width: u32, height: u32, background: Color, renderer: R) -> Self {
        Self {
            state: ViewState::Replaying,
            raster: Raster::new(width, height, background),
            renderer,
            history: SnapshotStack::new(DEFAULT_UNDO_DEPTH),
            pending: Vec::new(),
            last_order: None,
            unconfirmed_local: 0,
            needs_resync: false,
            preview: None,
        }
    }

    pub fn state(&self) -> ViewState {
        self.state
    }

    pub fn is_live(&self) -> bool {
        self.state == ViewState::Live
    }

    /// The shared raster, without any preview overlay.
    pub fn raster(&self) -> &Raster {
        &self.raster
    }

    /// Highest receipt order applied so far.
    pub fn last_receipt_order(&self) -> Option<u64> {
        self.last_order
    }

    /// Set once a gap in receipt order has been seen; cleared by
    /// [`CanvasView::load_history`].
    pub fn needs_resync(&self) -> bool {
        self.needs_resync
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Back to `Replaying`, e.g. after losing the connection. The raster is
    /// kept until the next history replaces it.
    pub fn reset(&mut self) {
        self.state = ViewState::Replaying;
        self.pending.clear();
    }

    // ─── History and remote events ────────────────────────────────────

    /// Rebuild the raster from a room's full history, then apply anything
    /// buffered meanwhile and go live. Returns the number of events applied.
    pub fn load_history(&mut self, events: &[DrawingEvent]) -> usize {
        self.raster.reset();
        self.history.clear();
        self.last_order = None;
        self.unconfirmed_local = 0;
        self.needs_resync = false;

        for event in events {
            self.renderer.render(&event.payload, &mut self.raster);
            self.last_order = Some(event.receipt_order);
        }
        let mut applied = events.len();

        for (payload, order) in std::mem::take(&mut self.pending) {
            if self.is_duplicate(order) {
                continue;
            }
            if let Some(missing) = self.apply(&payload, order) {
                self.flag_gap(missing);
            }
            applied += 1;
        }

        self.state = ViewState::Live;
        log::debug!(
            "Canvas live after {} event(s), last receipt order {:?}",
            applied,
            self.last_order
        );
        applied
    }

    /// Apply (or buffer) an event relayed from another participant.
    pub fn apply_remote(&mut self, payload: EventPayload, receipt_order: Option<u64>) -> RemoteOutcome {
        if self.state == ViewState::Replaying {
            self.pending.push((payload, receipt_order));
            return RemoteOutcome::Buffered;
        }
        if self.is_duplicate(receipt_order) {
            log::debug!("Skipping already applied receipt order {receipt_order:?}");
            return RemoteOutcome::Duplicate;
        }
        match self.apply(&payload, receipt_order) {
            Some(missing) => {
                self.flag_gap(missing);
                RemoteOutcome::AppliedAfterGap { missing }
            }
            None => RemoteOutcome::Applied,
        }
    }

    /// Paint a remote event. Returns how many sequenced events were skipped
    /// over, if that cannot be explained by our own unechoed edits.
    fn apply(&mut self, payload: &EventPayload, order: Option<u64>) -> Option<u64> {
        self.renderer.render(payload, &mut self.raster);
        self.history.record_remote(payload);
        let order = order?;
        let skipped = order.saturating_sub(self.last_order.unwrap_or(0) + 1);
        self.last_order = self.last_order.max(Some(order));

        let missing = skipped.saturating_sub(self.unconfirmed_local);
        self.unconfirmed_local = self.unconfirmed_local.saturating_sub(skipped);
        (missing > 0).then_some(missing)
    }

    fn flag_gap(&mut self, missing: u64) {
        log::warn!(
            "Missed {} event(s) before receipt order {:?}, history reload needed",
            missing,
            self.last_order
        );
        self.needs_resync = true;
    }

    fn is_duplicate(&self, order: Option<u64>) -> bool {
        matches!((order, self.last_order), (Some(o), Some(last)) if o <= last)
    }

    // ─── Local edits ──────────────────────────────────────────────────

    /// Snapshot, then paint a local edit. Returns the payload to submit.
    pub fn draw_local(&mut self, payload: EventPayload) -> Result<EventPayload, CanvasError> {
        if !self.is_live() {
            return Err(CanvasError::NotLive);
        }
        validate_colors(&payload)?;
        self.history.push(&self.raster);
        self.renderer.render(&payload, &mut self.raster);
        self.unconfirmed_local += 1;
        Ok(payload)
    }

    /// Locally undoable clear. Returns the payload to submit.
    pub fn clear_local(&mut self, background_color: Option<String>) -> Result<EventPayload, CanvasError> {
        self.draw_local(EventPayload::Clear { background_color })
    }

    pub fn undo(&mut self) -> bool {
        match self.history.undo(&self.raster) {
            Some(restore) => {
                self.restore(restore.raster, &restore.replay);
                true
            }
            None => false,
        }
    }

    pub fn redo(&mut self) -> bool {
        match self.history.redo(&self.raster) {
            Some(restore) => {
                self.restore(restore.raster, &restore.replay);
                true
            }
            None => false,
        }
    }

    fn restore(&mut self, raster: Raster, replay: &[EventPayload]) {
        self.raster = raster;
        for payload in replay {
            self.renderer.render(payload, &mut self.raster);
        }
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    // ─── Drag preview ─────────────────────────────────────────────────

    /// Start showing an in-progress shape over the raster.
    pub fn begin_preview(&mut self, payload: EventPayload) {
        self.preview = Some(payload);
    }

    /// Replace the in-progress shape, e.g. on pointer move.
    pub fn update_preview(&mut self, payload: EventPayload) {
        self.preview = Some(payload);
    }

    /// Stop previewing and return the last previewed shape. Nothing is
    /// painted; commit it with [`CanvasView::draw_local`].
    pub fn end_preview(&mut self) -> Option<EventPayload> {
        self.preview.take()
    }

    pub fn preview(&self) -> Option<&EventPayload> {
        self.preview.as_ref()
    }

    /// The raster with the preview drawn over it. The shared raster itself
    /// is left untouched.
    pub fn composite(&self) -> Cow<'_, Raster> {
        match &self.preview {
            Some(payload) => {
                let mut overlay = self.raster.clone();
                self.renderer.render(payload, &mut overlay);
                Cow::Owned(overlay)
            }
            None => Cow::Borrowed(&self.raster),
        }
    }

    // ─── Sync glue ────────────────────────────────────────────────────

    /// Feed a client event. Returns whether the raster may have changed.
    pub fn handle_sync_event(&mut self, event: &SyncEvent) -> bool {
        match event {
            SyncEvent::History { events, .. } => {
                self.load_history(events);
                true
            }
            SyncEvent::Remote {
                payload,
                receipt_order,
                ..
            } => self.apply_remote(payload.clone(), *receipt_order).is_applied(),
            SyncEvent::Disconnected => {
                self.reset();
                false
            }
            _ => false,
        }
    }
}

fn validate_colors(payload: &EventPayload) -> Result<(), ColorError> {
    match payload {
        EventPayload::Stroke(stroke) => {
            if stroke.tool == StrokeTool::Pen {
                Color::parse(&stroke.color)?;
            }
        }
        EventPayload::Shape(shape) => {
            Color::parse(&shape.color)?;
            if let Some(fill) = &shape.fill {
                Color::parse(fill)?;
            }
        }
        EventPayload::Text(text) => {
            Color::parse(&text.color)?;
        }
        EventPayload::Clear { background_color } => {
            if let Some(color) = background_color {
                Color::parse(color)?;
            }
        }
    }
    Ok(())
}
