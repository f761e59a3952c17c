//! Per-room fan-out with backpressure.
//!
//! Uses one tokio broadcast channel per room. Each connection owns an
//! independent receiver that buffers up to `capacity` frames; a receiver that
//! falls further behind skips frames (`RecvError::Lagged`) instead of stalling
//! the room. Frames are encoded once and shared by `Arc`.
//!
//! Every frame is wrapped in an [`Envelope`] that records the originating
//! connection, so receivers can skip their own echoes, and the receipt order
//! of a drawing event, so receivers can skip what their history covers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::protocol::{ConnectionId, ProtocolError, ServerMessage};

/// One encoded server frame plus the connection that caused it.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// `None` for frames every member must see, including the one that
    /// triggered them (join announcements).
    pub origin: Option<ConnectionId>,
    /// Receipt order of the persisted drawing event in `frame`, if any.
    pub receipt_order: Option<u64>,
    pub frame: Arc<Vec<u8>>,
}

impl Envelope {
    /// Whether this frame originated from `connection` and must not be
    /// delivered back to it.
    pub fn is_echo_for(&self, connection: ConnectionId) -> bool {
        self.origin == Some(connection)
    }

    /// Whether a history ending at `watermark` already contains this frame's
    /// event.
    pub fn is_covered_by(&self, watermark: Option<u64>) -> bool {
        matches!((self.receipt_order, watermark), (Some(order), Some(mark)) if order <= mark)
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    /// Frames skipped by lagging receivers.
    pub messages_dropped: u64,
    pub receivers: usize,
}

/// Lock-free counters for the hot path.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// The broadcast channel for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Envelope>,
    capacity: usize,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` is how many frames each receiver may buffer before it
    /// starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    /// Encode and send a message to every receiver.
    ///
    /// Returns the number of receivers the frame was queued for, including
    /// the origin's own receiver if it has one (filtering happens on receive).
    pub fn broadcast(
        &self,
        origin: Option<ConnectionId>,
        msg: &ServerMessage,
    ) -> Result<usize, ProtocolError> {
        let receipt_order = match msg {
            ServerMessage::Broadcast { receipt_order, .. } => *receipt_order,
            _ => None,
        };
        let encoded = msg.encode()?;
        Ok(self.send(Envelope {
            origin,
            receipt_order,
            frame: Arc::new(encoded),
        }))
    }

    /// Send a pre-encoded frame that carries no drawing event.
    pub fn broadcast_raw(&self, origin: Option<ConnectionId>, frame: Arc<Vec<u8>>) -> usize {
        self.send(Envelope {
            origin,
            receipt_order: None,
            frame,
        })
    }

    fn send(&self, envelope: Envelope) -> usize {
        // No receivers is not an error: the room may be momentarily empty.
        let count = self.sender.send(envelope).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }

    /// Record frames a lagging receiver skipped.
    pub fn note_lagged(&self, skipped: u64) {
        self.atomic_stats
            .messages_dropped
            .fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            receivers: self.sender.receiver_count(),
        }
    }
}
