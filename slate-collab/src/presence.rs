//! Presence announcements and participant colors.
//!
//! Presence is a pure function of the live room directory: nothing here is
//! persisted. After a restart participants simply rejoin and are announced
//! again.
//!
//! ```text
//! Registry::join ──► announce_join ──► participant-joined (whole room, joiner included)
//! Registry::leave ─► announce_leave ─► participant-left   (only on a participant's last connection)
//! ```

use uuid::Uuid;

use crate::protocol::{ParticipantId, ParticipantInfo, ServerMessage};
use crate::registry::{Departure, Room};

// ───────────────────────────────────────────────────────────────────
// Announcements
// ───────────────────────────────────────────────────────────────────

/// Announce `participant` to every connection in `room`, including the
/// joiner's own. Returns the number of receivers.
pub fn announce_join(room: &Room, participant: &ParticipantInfo) -> usize {
    let roster = room.roster();
    let msg = ServerMessage::ParticipantJoined {
        participant: participant.clone(),
        roster,
    };
    match room.broadcast().broadcast(None, &msg) {
        Ok(n) => n,
        Err(e) => {
            log::error!("Failed to encode join announcement for room {}: {e}", room.id());
            0
        }
    }
}

/// Announce a departure. Does nothing while the participant still holds
/// another connection in the room.
pub fn announce_leave(departure: &Departure) -> Option<usize> {
    if !departure.last_connection {
        return None;
    }
    let info = &departure.participant.info;
    let msg = ServerMessage::ParticipantLeft {
        participant_id: info.participant_id,
        display_name: info.display_name.clone(),
        roster_count: departure.roster.count,
    };
    match departure.room.broadcast().broadcast(None, &msg) {
        Ok(n) => Some(n),
        Err(e) => {
            log::error!(
                "Failed to encode leave announcement for room {}: {e}",
                departure.room.id()
            );
            None
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// Stable, vivid `#rrggbb` color for a participant.
///
/// The hue comes from the id, so the same participant gets the same color
/// on every connection.
pub fn color_for(participant_id: ParticipantId) -> String {
    let (r, g, b) = color_from_uuid(participant_id.as_uuid());
    format!("#{:02x}{:02x}{:02x}", to_channel(r), to_channel(g), to_channel(b))
}

fn color_from_uuid(id: Uuid) -> (f32, f32, f32) {
    let hue = ((id.as_u128() % 360) as f32) / 360.0;
    hsl_to_rgb(hue, 0.7, 0.5)
}

fn to_channel(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}
