//! # slate-canvas — Client-side canvas reconciliation for Slate
//!
//! Turns the event stream of a [`SyncClient`](slate_collab::SyncClient)
//! into pixels: room history first, then live events in arrival order, with
//! local-only undo/redo and a drag preview overlay.
//!
//! ```text
//!  SyncEvent ──┬──► CanvasView ──► Renderer ──► Raster
//!              │     (Replaying → Live,          ▲
//!              │      SnapshotStack)             │ composite()
//!              │                             preview overlay
//!              └──► PointerView (remote cursors, roster)
//! ```
//!
//! ## Modules
//!
//! - [`raster`]: RGBA surface and `#rrggbb` colors
//! - [`render`]: Rendering capability and the flat software renderer
//! - [`undo`]: Bounded snapshot history
//! - [`reconcile`]: Per-room canvas state machine
//! - [`presence`]: Remote pointers with staleness

pub mod raster;
pub mod render;
pub mod undo;
pub mod reconcile;
pub mod presence;

pub use raster::{Color, ColorError, Raster};
pub use render::{FlatRenderer, Renderer};
pub use undo::{Restore, SnapshotStack, DEFAULT_MAX_REPLAY, DEFAULT_UNDO_DEPTH};
pub use reconcile::{CanvasError, CanvasView, RemoteOutcome, ViewState};
pub use presence::{PointerView, RemotePointer, DEFAULT_STALE_AFTER};
