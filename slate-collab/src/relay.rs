//! Ephemeral signal relay: rate-limited cursor and laser-pointer updates.
//!
//! Each connection throttles its own signals. A signal that arrives while
//! the window is closed replaces any earlier pending one; when the window
//! reopens only the latest is emitted. Nothing is persisted, acknowledged or
//! retried.

use std::time::{Duration, Instant};

/// Default minimum spacing between cursor emissions.
pub const DEFAULT_CURSOR_INTERVAL: Duration = Duration::from_millis(40);
/// Laser pointers run at a lower duty cycle.
pub const DEFAULT_LASER_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointerSignal {
    pub x: f32,
    pub y: f32,
    pub is_actively_drawing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LaserSignal {
    pub x: f32,
    pub y: f32,
}

/// Coalescing rate limiter for one signal stream.
#[derive(Debug, Clone)]
pub struct SignalThrottle<T> {
    min_interval: Duration,
    last_emit: Option<Instant>,
    pending: Option<T>,
}

impl<T> SignalThrottle<T> {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_emit: None,
            pending: None,
        }
    }

    fn is_open(&self, now: Instant) -> bool {
        match self.last_emit {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.min_interval,
        }
    }

    /// Offer a new signal. Returns it if it may be emitted now; otherwise
    /// keeps it as the pending signal (dropping any older pending one).
    pub fn offer(&mut self, signal: T, now: Instant) -> Option<T> {
        if self.is_open(now) {
            self.last_emit = Some(now);
            self.pending = None;
            Some(signal)
        } else {
            self.pending = Some(signal);
            None
        }
    }

    /// Take the pending signal if its window has reopened.
    pub fn take_due(&mut self, now: Instant) -> Option<T> {
        if self.pending.is_some() && self.is_open(now) {
            self.last_emit = Some(now);
            self.pending.take()
        } else {
            None
        }
    }

    /// When the pending signal becomes due, if there is one.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref()?;
        Some(match self.last_emit {
            Some(last) => last + self.min_interval,
            None => Instant::now(),
        })
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Drop any pending signal.
    pub fn clear(&mut self) {
        self.pending = None;
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }
}

/// Signals that became due at a flush.
#[derive(Debug, Default, PartialEq)]
pub struct DueSignals {
    pub pointer: Option<PointerSignal>,
    pub laser: Option<LaserSignal>,
}

/// The pair of throttles one connection owns.
#[derive(Debug, Clone)]
pub struct SignalRelay {
    cursor: SignalThrottle<PointerSignal>,
    laser: SignalThrottle<LaserSignal>,
}

impl SignalRelay {
    pub fn new(cursor_interval: Duration, laser_interval: Duration) -> Self {
        Self {
            cursor: SignalThrottle::new(cursor_interval),
            laser: SignalThrottle::new(laser_interval),
        }
    }

    pub fn offer_cursor(&mut self, signal: PointerSignal, now: Instant) -> Option<PointerSignal> {
        self.cursor.offer(signal, now)
    }

    pub fn offer_laser(&mut self, signal: LaserSignal, now: Instant) -> Option<LaserSignal> {
        self.laser.offer(signal, now)
    }

    pub fn take_due(&mut self, now: Instant) -> DueSignals {
        DueSignals {
            pointer: self.cursor.take_due(now),
            laser: self.laser.take_due(now),
        }
    }

    /// Earliest instant at which a pending signal becomes due.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.cursor.deadline(), self.laser.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn clear(&mut self) {
        self.cursor.clear();
        self.laser.clear();
    }
}

impl Default for SignalRelay {
    fn default() -> Self {
        Self::new(DEFAULT_CURSOR_INTERVAL, DEFAULT_LASER_INTERVAL)
    }
}
