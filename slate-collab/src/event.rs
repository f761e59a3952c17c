//! Drawing events: the persisted, replayable unit of canvas mutation.
//!
//! Every stroke, shape, text block and clear travels as an [`EventPayload`].
//! Once the ingestion pipeline assigns it a receipt order it becomes a
//! [`DrawingEvent`] and is stored in the room's event log.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::protocol::{ParticipantId, RoomId};

/// A point in canvas coordinates (pixels, origin top-left).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Freehand tool used for a stroke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrokeTool {
    Pen,
    /// Paints with the canvas background color.
    Eraser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShapeKind {
    Rectangle,
    Ellipse,
    Line,
    Arrow,
    Triangle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrokePayload {
    pub points: Vec<Point>,
    /// `#rrggbb` or `#rrggbbaa`
    pub color: String,
    pub width: f32,
    pub tool: StrokeTool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapePayload {
    pub shape: ShapeKind,
    pub start: Point,
    pub end: Point,
    pub color: String,
    pub width: f32,
    /// Interior fill; outline only when `None`.
    pub fill: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextPayload {
    pub position: Point,
    pub content: String,
    pub color: String,
    pub size: f32,
}

/// Discriminant of an [`EventPayload`], used for logging and wire names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventKind {
    Stroke = 1,
    Shape = 2,
    Text = 3,
    Clear = 4,
}

impl EventKind {
    /// Name of the inbound message that submits this kind.
    pub fn submit_name(self) -> &'static str {
        match self {
            EventKind::Stroke => "drawing-stroke",
            EventKind::Shape => "drawing-shape",
            EventKind::Text => "drawing-text",
            EventKind::Clear => "canvas-clear",
        }
    }

    /// Name of the outbound message that fans this kind out.
    pub fn broadcast_name(self) -> &'static str {
        match self {
            EventKind::Stroke => "broadcast-stroke",
            EventKind::Shape => "broadcast-shape",
            EventKind::Text => "broadcast-text",
            EventKind::Clear => "broadcast-clear",
        }
    }
}

/// Kind-specific body of a drawing event.
///
/// The server never interprets these beyond the kind tag; rendering is
/// entirely a client concern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    Stroke(StrokePayload),
    Shape(ShapePayload),
    Text(TextPayload),
    /// Resets the whole canvas. `None` means the viewer's default background.
    Clear { background_color: Option<String> },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Stroke(_) => EventKind::Stroke,
            EventPayload::Shape(_) => EventKind::Shape,
            EventPayload::Text(_) => EventKind::Text,
            EventPayload::Clear { .. } => EventKind::Clear,
        }
    }

    pub fn stroke(points: Vec<Point>, color: impl Into<String>, width: f32) -> Self {
        EventPayload::Stroke(StrokePayload {
            points,
            color: color.into(),
            width,
            tool: StrokeTool::Pen,
        })
    }

    pub fn clear() -> Self {
        EventPayload::Clear {
            background_color: None,
        }
    }
}

/// A persisted drawing event.
///
/// `receipt_order` is assigned by the event log, strictly increasing per
/// room and never reused. It is the sole replay order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawingEvent {
    pub room_id: RoomId,
    pub author_id: ParticipantId,
    pub payload: EventPayload,
    pub receipt_order: u64,
    /// Wall-clock receive time in Unix milliseconds. Informational only.
    pub received_at_ms: u64,
}

impl DrawingEvent {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

/// Current wall-clock time in Unix milliseconds.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_kind() {
        let stroke = EventPayload::stroke(vec![Point::new(0.0, 0.0)], "#000000", 2.0);
        assert_eq!(stroke.kind(), EventKind::Stroke);
        assert_eq!(EventPayload::clear().kind(), EventKind::Clear);

        let text = EventPayload::Text(TextPayload {
            position: Point::new(10.0, 10.0),
            content: "hi".into(),
            color: "#ff0000".into(),
            size: 16.0,
        });
        assert_eq!(text.kind(), EventKind::Text);
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(EventKind::Stroke.submit_name(), "drawing-stroke");
        assert_eq!(EventKind::Clear.submit_name(), "canvas-clear");
        assert_eq!(EventKind::Shape.broadcast_name(), "broadcast-shape");
        assert_eq!(EventKind::Clear.broadcast_name(), "broadcast-clear");
    }

    #[test]
    fn test_now_millis_is_recent() {
        // 2020-01-01 in Unix millis
        assert!(now_millis() > 1_577_836_800_000);
    }
}
