//! Room engine: the transport-free core shared by every connection.
//!
//! ```text
//!              ┌──────────── Engine ─────────────┐
//! join ───────►│ Registry ──► sequencer ──► Replay│──► History + receiver
//! ingest ─────►│ sequencer ──► EventLog ──► fan-out (origin skipped)
//! pointer ────►│ Registry ──► fan-out             │
//! leave ──────►│ Registry ──► presence            │
//!              └─────────────────────────────────┘
//! ```
//!
//! Each room has a sequencer. Ingestion holds it across persist and
//! fan-out; a joiner holds it only while subscribing, then reads history
//! without blocking the room. A persisted event is therefore in the joiner's
//! history, on its receiver, or both; the history watermark lets the
//! connection drop the duplicates.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::broadcast::Envelope;
use crate::event::{DrawingEvent, EventPayload};
use crate::presence;
use crate::protocol::{ConnectionId, ParticipantId, ParticipantInfo, RoomId, Roster, ServerMessage};
use crate::registry::{Departure, Participant, Registry, RegistryError, Room};
use crate::relay::{LaserSignal, PointerSignal};
use crate::replay::ReplayService;
use crate::server::{ServerConfig, ServerStats};
use crate::storage::{EventLog, MemoryEventLog, StoreError};

/// Why a join was refused.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JoinError {
    /// History could not be read; the joiner cannot safely go live.
    #[error("history unavailable: {0}")]
    HistoryUnavailable(#[source] StoreError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Everything a connection needs after a successful join.
pub struct JoinTicket {
    pub room: Arc<Room>,
    /// Subscribed before history was read; carries everything after it and
    /// possibly some of the tail of `history`.
    pub receiver: broadcast::Receiver<Envelope>,
    pub history: Vec<DrawingEvent>,
    /// Receipt order of the last event in `history`. Frames at or below it
    /// are already covered.
    pub watermark: Option<u64>,
    pub roster: Roster,
}

/// What happened to a submitted drawing event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Sender not registered; nothing stored or sent.
    Dropped,
    Persisted { receipt_order: u64, recipients: usize },
    /// Persisting failed; the event was still fanned out.
    Unpersisted { recipients: usize },
}

#[derive(Default)]
struct EngineCounters {
    total_connections: AtomicU64,
    events_persisted: AtomicU64,
    events_unpersisted: AtomicU64,
    events_dropped: AtomicU64,
    history_resyncs: AtomicU64,
    signals_relayed: AtomicU64,
    joins_failed: AtomicU64,
    frames_lagged: AtomicU64,
}

pub struct Engine {
    registry: Registry,
    log: Arc<dyn EventLog>,
    replay: ReplayService,
    counters: EngineCounters,
}

impl Engine {
    pub fn new(config: &ServerConfig, log: Arc<dyn EventLog>) -> Self {
        Self {
            registry: Registry::new(config.broadcast_capacity, config.max_connections_per_room),
            replay: ReplayService::new(Arc::clone(&log)),
            log,
            counters: EngineCounters::default(),
        }
    }

    /// Engine backed by a non-durable in-memory log.
    pub fn in_memory(config: &ServerConfig) -> Self {
        Self::new(config, Arc::new(MemoryEventLog::new()))
    }

    // ─── Membership ───────────────────────────────────────────────────

    /// Register a connection, hand it the room's history and a receiver for
    /// everything after, then announce it to the room.
    pub async fn join(
        &self,
        connection: ConnectionId,
        info: ParticipantInfo,
        room_id: RoomId,
    ) -> Result<JoinTicket, JoinError> {
        let joined = match self.registry.join(connection, info.clone(), room_id.clone()) {
            Ok(joined) => joined,
            Err(e) => {
                self.counters.joins_failed.fetch_add(1, Ordering::Relaxed);
                log::warn!("Join of {} to room {} refused: {e}", info.display_name, room_id);
                return Err(e.into());
            }
        };
        let room = joined.room;

        // Every event sequenced before the subscription is already in the
        // log; every later one reaches the receiver. Overlap is filtered by
        // the ticket's watermark.
        let receiver = {
            let _sequenced = room.sequencer().lock().await;
            room.broadcast().subscribe()
        };
        let history = match self.replay.replay(&room_id).await {
            Ok(history) => history,
            Err(e) => {
                self.registry.leave(connection);
                self.counters.joins_failed.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "Join of {} to room {} failed, history unavailable: {e}",
                    info.display_name,
                    room_id
                );
                return Err(JoinError::HistoryUnavailable(e));
            }
        };
        let watermark = history.last().map(|e| e.receipt_order);

        presence::announce_join(&room, &info);
        let roster = room.roster();
        log::info!(
            "{} ({}) joined room {} [{} participant(s), {} event(s) replayed]",
            info.display_name,
            connection,
            room_id,
            roster.count,
            history.len()
        );

        Ok(JoinTicket {
            room,
            receiver,
            history,
            watermark,
            roster,
        })
    }

    /// Unregister a connection and announce the departure if it was the
    /// participant's last connection in the room.
    pub fn leave(&self, connection: ConnectionId) -> Option<Departure> {
        let departure = self.registry.leave(connection)?;
        presence::announce_leave(&departure);
        log::info!(
            "{} ({}) left room {}{}",
            departure.participant.info.display_name,
            connection,
            departure.participant.room_id,
            if departure.room_closed { " [room closed]" } else { "" }
        );
        Some(departure)
    }

    pub fn lookup(&self, connection: ConnectionId) -> Option<Participant> {
        self.registry.lookup(connection)
    }

    pub fn roster(&self, room_id: &RoomId) -> Roster {
        self.registry.roster(room_id)
    }

    pub fn room_members(&self, room_id: &RoomId) -> Vec<ConnectionId> {
        self.registry.room_members(room_id)
    }

    // ─── Drawing events ───────────────────────────────────────────────

    /// Persist a drawing event and fan it out to every other connection in
    /// the sender's room.
    pub async fn ingest(&self, connection: ConnectionId, payload: EventPayload) -> IngestOutcome {
        let Some((participant, room)) = self.member_room(connection) else {
            log::debug!(
                "Dropping {} from unregistered connection {}",
                payload.kind().submit_name(),
                connection
            );
            self.counters.events_dropped.fetch_add(1, Ordering::Relaxed);
            return IngestOutcome::Dropped;
        };
        let author_id = participant.info.participant_id;
        let kind = payload.kind();

        let _sequenced = room.sequencer().lock().await;

        let receipt_order = match self
            .append(participant.room_id.clone(), author_id, payload.clone())
            .await
        {
            Ok(event) => {
                self.counters.events_persisted.fetch_add(1, Ordering::Relaxed);
                Some(event.receipt_order)
            }
            Err(e) => {
                self.counters.events_unpersisted.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "Persisting {} from {} in room {} failed, broadcasting anyway: {e}",
                    kind.submit_name(),
                    participant.info.display_name,
                    participant.room_id
                );
                None
            }
        };

        let msg = ServerMessage::Broadcast {
            author_id,
            payload,
            receipt_order,
        };
        if let Err(e) = room.broadcast().broadcast(Some(connection), &msg) {
            log::error!("Failed to encode {}: {e}", kind.broadcast_name());
        }
        let recipients = room.connection_count().saturating_sub(1);

        log::debug!(
            "{} #{:?} from {} in room {} -> {} recipient(s)",
            kind.broadcast_name(),
            receipt_order,
            participant.info.display_name,
            participant.room_id,
            recipients
        );

        match receipt_order {
            Some(receipt_order) => IngestOutcome::Persisted {
                receipt_order,
                recipients,
            },
            None => IngestOutcome::Unpersisted { recipients },
        }
    }

    async fn append(
        &self,
        room_id: RoomId,
        author_id: ParticipantId,
        payload: EventPayload,
    ) -> Result<DrawingEvent, StoreError> {
        let log = Arc::clone(&self.log);
        tokio::task::spawn_blocking(move || log.append(&room_id, author_id, payload))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
    }

    /// A room's full history, for callers that are not joining.
    pub async fn fetch_history(&self, room_id: &RoomId) -> Result<Vec<DrawingEvent>, StoreError> {
        self.replay.replay(room_id).await
    }

    // ─── Ephemeral signals ────────────────────────────────────────────

    /// Send an (already throttled) cursor update to the rest of the room.
    pub fn publish_pointer(&self, connection: ConnectionId, signal: PointerSignal) -> bool {
        let Some((participant, room)) = self.member_room(connection) else {
            return false;
        };
        let msg = ServerMessage::PointerUpdate {
            participant: participant.info,
            x: signal.x,
            y: signal.y,
            is_actively_drawing: signal.is_actively_drawing,
        };
        self.relay_signal(connection, &room, &msg)
    }

    /// Send an (already throttled) laser-pointer update to the rest of the room.
    pub fn publish_laser(&self, connection: ConnectionId, signal: LaserSignal) -> bool {
        let Some((participant, room)) = self.member_room(connection) else {
            return false;
        };
        let msg = ServerMessage::LaserUpdate {
            participant: participant.info,
            x: signal.x,
            y: signal.y,
        };
        self.relay_signal(connection, &room, &msg)
    }

    /// Tell the room to drop this connection's pointer.
    pub fn retract(&self, connection: ConnectionId) -> bool {
        let Some((participant, room)) = self.member_room(connection) else {
            return false;
        };
        let msg = ServerMessage::PointerRetract {
            participant_id: participant.info.participant_id,
        };
        self.relay_signal(connection, &room, &msg)
    }

    fn relay_signal(&self, connection: ConnectionId, room: &Room, msg: &ServerMessage) -> bool {
        match room.broadcast().broadcast(Some(connection), msg) {
            Ok(_) => {
                self.counters.signals_relayed.fetch_add(1, Ordering::Relaxed);
                log::trace!("{} from {} in room {}", msg.kind(), connection, room.id());
                true
            }
            Err(e) => {
                log::error!("Failed to encode {}: {e}", msg.kind());
                false
            }
        }
    }

    fn member_room(&self, connection: ConnectionId) -> Option<(Participant, Arc<Room>)> {
        let participant = self.registry.lookup(connection)?;
        let room = self.registry.room(&participant.room_id)?;
        Some((participant, room))
    }

    // ─── Bookkeeping ──────────────────────────────────────────────────

    pub fn connection_opened(&self) {
        self.counters.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record frames a connection's receiver skipped.
    pub fn note_lagged(&self, connection: ConnectionId, skipped: u64) {
        self.counters.frames_lagged.fetch_add(skipped, Ordering::Relaxed);
        if let Some((_, room)) = self.member_room(connection) {
            room.broadcast().note_lagged(skipped);
        }
    }

    /// Record a history re-send to a connection that fell behind.
    pub fn note_resync(&self) {
        self.counters.history_resyncs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> ServerStats {
        let c = &self.counters;
        ServerStats {
            active_rooms: self.registry.room_count(),
            active_connections: self.registry.connection_count(),
            total_connections: c.total_connections.load(Ordering::Relaxed),
            events_persisted: c.events_persisted.load(Ordering::Relaxed),
            events_unpersisted: c.events_unpersisted.load(Ordering::Relaxed),
            events_dropped: c.events_dropped.load(Ordering::Relaxed),
            history_resyncs: c.history_resyncs.load(Ordering::Relaxed),
            signals_relayed: c.signals_relayed.load(Ordering::Relaxed),
            joins_failed: c.joins_failed.load(Ordering::Relaxed),
            frames_lagged: c.frames_lagged.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Point;
    use tokio::sync::broadcast::error::TryRecvError;

    fn engine() -> Engine {
        Engine::in_memory(&ServerConfig::for_testing())
    }

    fn stroke() -> EventPayload {
        EventPayload::stroke(vec![Point::new(1.0, 1.0), Point::new(5.0, 5.0)], "#ff0000", 2.0)
    }

    /// Decode every queued frame not originating from `me`.
    fn drain(rx: &mut broadcast::Receiver<Envelope>, me: ConnectionId) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(env) if env.is_echo_for(me) => continue,
                Ok(env) => out.push(ServerMessage::decode(&env.frame).unwrap()),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        out
    }

    /// Fails appends always and reads when `fail_reads` is set.
    struct BrokenLog {
        fail_reads: bool,
    }

    impl EventLog for BrokenLog {
        fn append(
            &self,
            _: &RoomId,
            _: ParticipantId,
            _: EventPayload,
        ) -> Result<DrawingEvent, StoreError> {
            Err(StoreError::Database("disk full".into()))
        }
        fn read(&self, _: &RoomId) -> Result<Vec<DrawingEvent>, StoreError> {
            if self.fail_reads {
                Err(StoreError::Database("offline".into()))
            } else {
                Ok(Vec::new())
            }
        }
        fn event_count(&self, _: &RoomId) -> Result<u64, StoreError> {
            Ok(0)
        }
        fn rooms(&self) -> Result<Vec<RoomId>, StoreError> {
            Ok(Vec::new())
        }
    }

    /// Memory log whose reads stall for `read_delay_ms` before reading.
    struct SlowReadLog {
        inner: MemoryEventLog,
        read_delay_ms: AtomicU64,
    }

    impl EventLog for SlowReadLog {
        fn append(
            &self,
            room_id: &RoomId,
            author_id: ParticipantId,
            payload: EventPayload,
        ) -> Result<DrawingEvent, StoreError> {
            self.inner.append(room_id, author_id, payload)
        }
        fn read(&self, room_id: &RoomId) -> Result<Vec<DrawingEvent>, StoreError> {
            let delay = self.read_delay_ms.load(Ordering::Relaxed);
            std::thread::sleep(std::time::Duration::from_millis(delay));
            self.inner.read(room_id)
        }
        fn event_count(&self, room_id: &RoomId) -> Result<u64, StoreError> {
            self.inner.event_count(room_id)
        }
        fn rooms(&self) -> Result<Vec<RoomId>, StoreError> {
            self.inner.rooms()
        }
    }

    #[tokio::test]
    async fn test_history_read_does_not_block_ingest() {
        let log = Arc::new(SlowReadLog {
            inner: MemoryEventLog::new(),
            read_delay_ms: AtomicU64::new(0),
        });
        let engine = Arc::new(Engine::new(&ServerConfig::for_testing(), log.clone()));
        let a = ConnectionId::random();
        engine.join(a, ParticipantInfo::anonymous("A"), "r".into()).await.unwrap();

        log.read_delay_ms.store(300, Ordering::Relaxed);
        let joining = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .join(ConnectionId::random(), ParticipantInfo::anonymous("B"), "r".into())
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let outcome = tokio::time::timeout(std::time::Duration::from_millis(150), engine.ingest(a, stroke()))
            .await
            .expect("ingest waited for a joiner's history read");
        assert!(matches!(outcome, IngestOutcome::Persisted { receipt_order: 1, .. }));
        assert!(!joining.is_finished());

        // The stroke landed in both the history and the receiver; the
        // watermark marks the receiver's copy as covered.
        let mut ticket = joining.await.unwrap().unwrap();
        assert_eq!(ticket.watermark, Some(1));
        let mut covered = 0;
        while let Ok(env) = ticket.receiver.try_recv() {
            if env.receipt_order.is_some() {
                assert!(env.is_covered_by(ticket.watermark));
                covered += 1;
            }
        }
        assert_eq!(covered, 1);
    }

    #[tokio::test]
    async fn test_join_returns_history_and_announces() {
        let engine = engine();
        let conn = ConnectionId::random();
        let alice = ParticipantInfo::anonymous("Alice");

        let mut ticket = engine.join(conn, alice.clone(), "r".into()).await.unwrap();
        assert!(ticket.history.is_empty());
        assert_eq!(ticket.roster.count, 1);

        // The joiner sees its own announcement.
        let msgs = drain(&mut ticket.receiver, conn);
        assert!(matches!(
            &msgs[..],
            [ServerMessage::ParticipantJoined { participant, .. }] if *participant == alice
        ));
    }

    #[tokio::test]
    async fn test_ingest_assigns_orders_and_skips_sender() {
        let engine = engine();
        let a = ConnectionId::random();
        let b = ConnectionId::random();
        let mut ta = engine.join(a, ParticipantInfo::anonymous("A"), "r".into()).await.unwrap();
        let mut tb = engine.join(b, ParticipantInfo::anonymous("B"), "r".into()).await.unwrap();
        drain(&mut ta.receiver, a);
        drain(&mut tb.receiver, b);

        let outcome = engine.ingest(a, stroke()).await;
        assert_eq!(
            outcome,
            IngestOutcome::Persisted {
                receipt_order: 1,
                recipients: 1
            }
        );

        assert!(drain(&mut ta.receiver, a).is_empty());
        let got = drain(&mut tb.receiver, b);
        assert!(matches!(
            &got[..],
            [ServerMessage::Broadcast { receipt_order: Some(1), .. }]
        ));
    }

    #[tokio::test]
    async fn test_ingest_from_unregistered_is_dropped() {
        let engine = engine();
        let outcome = engine.ingest(ConnectionId::random(), stroke()).await;
        assert_eq!(outcome, IngestOutcome::Dropped);
        assert_eq!(engine.stats().events_dropped, 1);
    }

    #[tokio::test]
    async fn test_ingest_after_leave_is_dropped() {
        let engine = engine();
        let conn = ConnectionId::random();
        engine.join(conn, ParticipantInfo::anonymous("A"), "r".into()).await.unwrap();
        engine.leave(conn);

        assert_eq!(engine.ingest(conn, stroke()).await, IngestOutcome::Dropped);
        assert!(engine.fetch_history(&"r".into()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_late_joiner_gets_history() {
        let engine = engine();
        let a = ConnectionId::random();
        engine.join(a, ParticipantInfo::anonymous("A"), "r".into()).await.unwrap();
        engine.ingest(a, stroke()).await;
        engine.ingest(a, EventPayload::clear()).await;

        let ticket = engine
            .join(ConnectionId::random(), ParticipantInfo::anonymous("B"), "r".into())
            .await
            .unwrap();
        let orders: Vec<u64> = ticket.history.iter().map(|e| e.receipt_order).collect();
        assert_eq!(orders, vec![1, 2]);
        assert_eq!(ticket.roster.count, 2);
    }

    #[tokio::test]
    async fn test_join_fails_when_history_unavailable() {
        let engine = Engine::new(
            &ServerConfig::for_testing(),
            Arc::new(BrokenLog { fail_reads: true }),
        );

        let err = engine
            .join(ConnectionId::random(), ParticipantInfo::anonymous("A"), "r".into())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, JoinError::HistoryUnavailable(_)));

        let stats = engine.stats();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.active_rooms, 0);
        assert_eq!(stats.joins_failed, 1);
    }

    #[tokio::test]
    async fn test_persist_failure_still_fans_out() {
        let engine = Engine::new(
            &ServerConfig::for_testing(),
            Arc::new(BrokenLog { fail_reads: false }),
        );
        let a = ConnectionId::random();
        let b = ConnectionId::random();
        engine.join(a, ParticipantInfo::anonymous("A"), "r".into()).await.unwrap();
        let mut tb = engine.join(b, ParticipantInfo::anonymous("B"), "r".into()).await.unwrap();
        drain(&mut tb.receiver, b);

        let outcome = engine.ingest(a, stroke()).await;
        assert_eq!(outcome, IngestOutcome::Unpersisted { recipients: 1 });

        let got = drain(&mut tb.receiver, b);
        assert!(matches!(
            &got[..],
            [ServerMessage::Broadcast { receipt_order: None, .. }]
        ));
        assert_eq!(engine.stats().events_unpersisted, 1);
    }

    #[tokio::test]
    async fn test_pointer_relay_and_retract() {
        let engine = engine();
        let a = ConnectionId::random();
        let b = ConnectionId::random();
        let alice = ParticipantInfo::anonymous("Alice");
        engine.join(a, alice.clone(), "r".into()).await.unwrap();
        let mut tb = engine.join(b, ParticipantInfo::anonymous("B"), "r".into()).await.unwrap();
        drain(&mut tb.receiver, b);

        let signal = PointerSignal {
            x: 10.0,
            y: 20.0,
            is_actively_drawing: true,
        };
        assert!(engine.publish_pointer(a, signal));
        assert!(engine.publish_laser(a, LaserSignal { x: 1.0, y: 2.0 }));
        assert!(engine.retract(a));

        let got = drain(&mut tb.receiver, b);
        assert_eq!(got.len(), 3);
        assert!(matches!(
            &got[0],
            ServerMessage::PointerUpdate { participant, x, is_actively_drawing: true, .. }
                if *participant == alice && *x == 10.0
        ));
        assert!(matches!(&got[1], ServerMessage::LaserUpdate { .. }));
        assert_eq!(
            got[2],
            ServerMessage::PointerRetract {
                participant_id: alice.participant_id
            }
        );
        assert!(!engine.publish_pointer(ConnectionId::random(), signal));
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let engine = engine();
        let a = ConnectionId::random();
        let b = ConnectionId::random();
        engine.join(a, ParticipantInfo::anonymous("A"), "one".into()).await.unwrap();
        let mut tb = engine.join(b, ParticipantInfo::anonymous("B"), "two".into()).await.unwrap();
        drain(&mut tb.receiver, b);

        let outcome = engine.ingest(a, stroke()).await;
        assert_eq!(
            outcome,
            IngestOutcome::Persisted {
                receipt_order: 1,
                recipients: 0
            }
        );
        assert!(drain(&mut tb.receiver, b).is_empty());
        assert!(engine.fetch_history(&"two".into()).await.unwrap().is_empty());
    }
}
