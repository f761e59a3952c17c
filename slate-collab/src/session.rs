//! Per-connection message handling, independent of the transport.
//!
//! The server's receive loop feeds decoded [`ClientMessage`]s into
//! [`Session::handle`] and writes back whatever replies it returns. Fan-out to
//! other connections happens inside the [`Engine`]; the session only owns the
//! connection's room membership, its signal throttles and the history
//! watermark that decides which fan-out frames it still needs.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;

use crate::broadcast::Envelope;
use crate::engine::{Engine, IngestOutcome};
use crate::event::DrawingEvent;
use crate::presence;
use crate::protocol::{ClientMessage, ConnectionId, ParticipantInfo, RoomId, ServerMessage};
use crate::registry::Departure;
use crate::relay::{LaserSignal, PointerSignal, SignalRelay};
use crate::server::ServerConfig;
use crate::storage::StoreError;

/// Output of handling one inbound message.
#[derive(Default)]
pub struct Handled {
    /// Messages for this connection only.
    pub replies: Vec<ServerMessage>,
    /// Set once, on a successful join: the room's fan-out stream.
    pub subscription: Option<broadcast::Receiver<Envelope>>,
}

impl Handled {
    fn reply(msg: ServerMessage) -> Self {
        Self {
            replies: vec![msg],
            subscription: None,
        }
    }
}

pub struct Session {
    engine: Arc<Engine>,
    connection_id: ConnectionId,
    room_id: Option<RoomId>,
    relay: SignalRelay,
    /// Last receipt order this connection has been sent as history.
    watermark: Option<u64>,
}

impl Session {
    pub fn new(engine: Arc<Engine>, connection_id: ConnectionId, config: &ServerConfig) -> Self {
        Self {
            engine,
            connection_id,
            room_id: None,
            relay: SignalRelay::new(config.cursor_interval, config.laser_interval),
            watermark: None,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// The room this connection joined, if any.
    pub fn room_id(&self) -> Option<&RoomId> {
        self.room_id.as_ref()
    }

    pub async fn handle(&mut self, msg: ClientMessage, now: Instant) -> Handled {
        log::trace!("{} <- {}", self.connection_id, msg.kind());
        match msg {
            ClientMessage::JoinRoom {
                participant_id,
                room_id,
                display_name,
                display_color,
            } => {
                let color = display_color.unwrap_or_else(|| presence::color_for(participant_id));
                let info = ParticipantInfo::new(participant_id, display_name, color);
                self.join(info, room_id).await
            }
            ClientMessage::PointerMove {
                room_id,
                x,
                y,
                is_actively_drawing,
            } => {
                if self.in_room(&room_id) {
                    let signal = PointerSignal {
                        x,
                        y,
                        is_actively_drawing,
                    };
                    if let Some(signal) = self.relay.offer_cursor(signal, now) {
                        self.engine.publish_pointer(self.connection_id, signal);
                    }
                }
                Handled::default()
            }
            ClientMessage::LaserPointer { room_id, x, y } => {
                if self.in_room(&room_id) {
                    if let Some(signal) = self.relay.offer_laser(LaserSignal { x, y }, now) {
                        self.engine.publish_laser(self.connection_id, signal);
                    }
                }
                Handled::default()
            }
            ClientMessage::Submit { room_id, payload } => {
                if self.room_id.as_ref().is_some_and(|joined| *joined != room_id) {
                    log::debug!(
                        "Dropping {} for room {} from {}: joined elsewhere",
                        payload.kind().submit_name(),
                        room_id,
                        self.connection_id
                    );
                } else if let IngestOutcome::Dropped =
                    self.engine.ingest(self.connection_id, payload).await
                {
                    log::debug!("{} submitted before joining", self.connection_id);
                }
                Handled::default()
            }
            ClientMessage::FetchHistory { room_id } => {
                match self.engine.fetch_history(&room_id).await {
                    Ok(events) => {
                        if self.in_room(&room_id) {
                            self.advance_watermark(&events);
                        }
                        Handled::reply(ServerMessage::History { room_id, events })
                    }
                    Err(e) => {
                        log::warn!("History fetch for room {} failed: {e}", room_id);
                        Handled::default()
                    }
                }
            }
            ClientMessage::Ping => Handled::reply(ServerMessage::Pong),
        }
    }

    async fn join(&mut self, info: ParticipantInfo, room_id: RoomId) -> Handled {
        if let Some(current) = &self.room_id {
            return Handled::reply(ServerMessage::JoinFailed {
                room_id,
                reason: format!("already joined room {current}"),
            });
        }

        match self.engine.join(self.connection_id, info, room_id.clone()).await {
            Ok(ticket) => {
                self.room_id = Some(room_id.clone());
                self.watermark = ticket.watermark;
                Handled {
                    replies: vec![ServerMessage::History {
                        room_id,
                        events: ticket.history,
                    }],
                    subscription: Some(ticket.receiver),
                }
            }
            Err(e) => Handled::reply(ServerMessage::JoinFailed {
                room_id,
                reason: e.to_string(),
            }),
        }
    }

    fn in_room(&self, room_id: &RoomId) -> bool {
        self.room_id.as_ref() == Some(room_id)
    }

    fn advance_watermark(&mut self, events: &[DrawingEvent]) {
        if let Some(last) = events.last() {
            self.watermark = self.watermark.max(Some(last.receipt_order));
        }
    }

    pub fn watermark(&self) -> Option<u64> {
        self.watermark
    }

    /// Whether a fan-out frame should be written to this connection: not its
    /// own echo and not already covered by history it was sent.
    pub fn admits(&self, envelope: &Envelope) -> bool {
        !envelope.is_echo_for(self.connection_id) && !envelope.is_covered_by(self.watermark)
    }

    /// Re-read the room's history after this connection's receiver skipped
    /// frames. The returned `History` replaces everything the client drew
    /// from the room; frames it covers are no longer admitted.
    pub async fn resync(&mut self) -> Result<Option<ServerMessage>, StoreError> {
        let Some(room_id) = self.room_id.clone() else {
            return Ok(None);
        };
        let events = self.engine.fetch_history(&room_id).await?;
        self.advance_watermark(&events);
        self.engine.note_resync();
        log::info!(
            "Resent {} event(s) of room {} to lagging connection {}",
            events.len(),
            room_id,
            self.connection_id
        );
        Ok(Some(ServerMessage::History { room_id, events }))
    }

    /// Publish throttled signals whose window has reopened.
    pub fn flush_signals(&mut self, now: Instant) -> usize {
        let due = self.relay.take_due(now);
        let mut sent = 0;
        if let Some(signal) = due.pointer {
            sent += usize::from(self.engine.publish_pointer(self.connection_id, signal));
        }
        if let Some(signal) = due.laser {
            sent += usize::from(self.engine.publish_laser(self.connection_id, signal));
        }
        sent
    }

    /// When [`Session::flush_signals`] next has something to send.
    pub fn next_signal_deadline(&self) -> Option<Instant> {
        self.relay.next_deadline()
    }

    /// Retract this connection's pointer and leave its room.
    pub fn close(&mut self) -> Option<Departure> {
        self.relay.clear();
        self.room_id.take()?;
        self.engine.retract(self.connection_id);
        self.engine.leave(self.connection_id)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.room_id.is_some() {
            self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventPayload;
    use crate::protocol::ParticipantId;
    use std::time::Duration;
    use tokio::sync::broadcast::error::TryRecvError;

    fn engine() -> Arc<Engine> {
        Arc::new(Engine::in_memory(&ServerConfig::for_testing()))
    }

    fn join_msg(name: &str, room: &str) -> ClientMessage {
        ClientMessage::JoinRoom {
            participant_id: ParticipantId::random(),
            room_id: room.into(),
            display_name: name.into(),
            display_color: None,
        }
    }

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

    #[tokio::test]
    async fn test_join_replies_with_history() {
        let engine = engine();
        let mut session = Session::new(Arc::clone(&engine), ConnectionId::random(), &ServerConfig::for_testing());

        let handled = session.handle(join_msg("Alice", "r"), Instant::now()).await;
        assert!(handled.subscription.is_some());
        assert!(matches!(
            &handled.replies[..],
            [ServerMessage::History { events, .. }] if events.is_empty()
        ));
        assert_eq!(session.room_id(), Some(&RoomId::from("r")));
    }

    #[tokio::test]
    async fn test_derived_color_when_missing() {
        let engine = engine();
        let conn = ConnectionId::random();
        let mut session = Session::new(Arc::clone(&engine), conn, &ServerConfig::for_testing());
        let pid = ParticipantId::random();

        session
            .handle(
                ClientMessage::JoinRoom {
                    participant_id: pid,
                    room_id: "r".into(),
                    display_name: "Alice".into(),
                    display_color: None,
                },
                Instant::now(),
            )
            .await;
        let participant = engine.lookup(conn).unwrap();
        assert_eq!(participant.info.display_color, presence::color_for(pid));
    }

    #[tokio::test]
    async fn test_second_join_rejected() {
        let engine = engine();
        let mut session = Session::new(engine, ConnectionId::random(), &ServerConfig::for_testing());
        session.handle(join_msg("Alice", "r"), Instant::now()).await;

        let handled = session.handle(join_msg("Alice", "other"), Instant::now()).await;
        assert!(handled.subscription.is_none());
        assert!(matches!(&handled.replies[..], [ServerMessage::JoinFailed { .. }]));
        assert_eq!(session.room_id(), Some(&RoomId::from("r")));
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let mut session = Session::new(engine(), ConnectionId::random(), &ServerConfig::for_testing());
        let handled = session.handle(ClientMessage::Ping, Instant::now()).await;
        assert_eq!(handled.replies, vec![ServerMessage::Pong]);
    }

    #[tokio::test]
    async fn test_submit_to_other_room_is_dropped() {
        let engine = engine();
        let mut session = Session::new(Arc::clone(&engine), ConnectionId::random(), &ServerConfig::for_testing());
        session.handle(join_msg("Alice", "r"), Instant::now()).await;

        session
            .handle(
                ClientMessage::Submit {
                    room_id: "elsewhere".into(),
                    payload: EventPayload::clear(),
                },
                Instant::now(),
            )
            .await;
        assert!(engine.fetch_history(&"elsewhere".into()).await.unwrap().is_empty());
        assert!(engine.fetch_history(&"r".into()).await.unwrap().is_empty());

        session
            .handle(
                ClientMessage::Submit {
                    room_id: "r".into(),
                    payload: EventPayload::clear(),
                },
                Instant::now(),
            )
            .await;
        assert_eq!(engine.fetch_history(&"r".into()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pointer_burst_is_coalesced() {
        let engine = engine();
        let config = ServerConfig::for_testing();
        let a = ConnectionId::random();
        let b = ConnectionId::random();
        let mut sa = Session::new(Arc::clone(&engine), a, &config);
        let mut sb = Session::new(Arc::clone(&engine), b, &config);
        sa.handle(join_msg("A", "r"), Instant::now()).await;
        let mut rx = sb.handle(join_msg("B", "r"), Instant::now()).await.subscription.unwrap();
        drain(&mut rx, b);

        let start = Instant::now();
        for i in 0..10 {
            let msg = ClientMessage::PointerMove {
                room_id: "r".into(),
                x: i as f32,
                y: 0.0,
                is_actively_drawing: false,
            };
            sa.handle(msg, start + Duration::from_millis(i)).await;
        }

        // First signal went straight out, the rest are pending.
        let got = drain(&mut rx, b);
        assert_eq!(got.len(), 1);
        assert!(matches!(got[0], ServerMessage::PointerUpdate { x, .. } if x == 0.0));

        let deadline = sa.next_signal_deadline().unwrap();
        assert_eq!(sa.flush_signals(deadline), 1);
        let got = drain(&mut rx, b);
        assert!(matches!(got[..], [ServerMessage::PointerUpdate { x, .. }] if x == 9.0));
        assert_eq!(sa.next_signal_deadline(), None);
    }

    #[tokio::test]
    async fn test_close_retracts_and_leaves() {
        let engine = engine();
        let config = ServerConfig::for_testing();
        let a = ConnectionId::random();
        let b = ConnectionId::random();
        let mut sa = Session::new(Arc::clone(&engine), a, &config);
        let mut sb = Session::new(Arc::clone(&engine), b, &config);
        sa.handle(join_msg("A", "r"), Instant::now()).await;
        let mut rx = sb.handle(join_msg("B", "r"), Instant::now()).await.subscription.unwrap();
        drain(&mut rx, b);

        let departure = sa.close().unwrap();
        assert!(departure.last_connection);
        assert!(sa.close().is_none());

        let got = drain(&mut rx, b);
        assert!(matches!(got[0], ServerMessage::PointerRetract { .. }));
        assert!(matches!(got[1], ServerMessage::ParticipantLeft { roster_count: 1, .. }));
        assert!(engine.lookup(a).is_none());
    }

    fn submit(room: &str) -> ClientMessage {
        ClientMessage::Submit {
            room_id: room.into(),
            payload: EventPayload::clear(),
        }
    }

    #[tokio::test]
    async fn test_lagging_receiver_is_resynced_with_history() {
        let config = ServerConfig {
            broadcast_capacity: 2,
            ..ServerConfig::for_testing()
        };
        let engine = Arc::new(Engine::in_memory(&config));
        let a = ConnectionId::random();
        let b = ConnectionId::random();
        let mut sa = Session::new(Arc::clone(&engine), a, &config);
        let mut sb = Session::new(Arc::clone(&engine), b, &config);
        sa.handle(join_msg("A", "r"), Instant::now()).await;
        let mut rx = sb.handle(join_msg("B", "r"), Instant::now()).await.subscription.unwrap();
        drain(&mut rx, b);

        for _ in 0..5 {
            sa.handle(submit("r"), Instant::now()).await;
        }
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Lagged(3))));

        let reply = sb.resync().await.unwrap().unwrap();
        match reply {
            ServerMessage::History { events, .. } => {
                let orders: Vec<u64> = events.iter().map(|e| e.receipt_order).collect();
                assert_eq!(orders, vec![1, 2, 3, 4, 5]);
            }
            other => panic!("expected History, got {other:?}"),
        }
        assert_eq!(sb.watermark(), Some(5));

        // Orders 4 and 5 are still queued but already in the history.
        let mut queued = 0;
        while let Ok(env) = rx.try_recv() {
            queued += 1;
            assert!(!sb.admits(&env));
        }
        assert_eq!(queued, 2);
        assert_eq!(engine.stats().history_resyncs, 1);
    }

    #[tokio::test]
    async fn test_resync_without_room_is_noop() {
        let mut session = Session::new(engine(), ConnectionId::random(), &ServerConfig::for_testing());
        assert_eq!(session.resync().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_watermark_filters_covered_frames() {
        let engine = engine();
        let config = ServerConfig::for_testing();
        let a = ConnectionId::random();
        let mut sa = Session::new(Arc::clone(&engine), a, &config);
        sa.handle(join_msg("A", "r"), Instant::now()).await;
        sa.handle(submit("r"), Instant::now()).await;
        sa.handle(submit("r"), Instant::now()).await;

        let b = ConnectionId::random();
        let mut sb = Session::new(Arc::clone(&engine), b, &config);
        let mut rx = sb.handle(join_msg("B", "r"), Instant::now()).await.subscription.unwrap();
        assert_eq!(sb.watermark(), Some(2));
        drain(&mut rx, b);

        sa.handle(submit("r"), Instant::now()).await;
        let env = rx.try_recv().unwrap();
        assert_eq!(env.receipt_order, Some(3));
        assert!(sb.admits(&env));
        assert!(!sa.admits(&env));

        // An explicit fetch of the own room moves the watermark too.
        sb.handle(ClientMessage::FetchHistory { room_id: "r".into() }, Instant::now())
            .await;
        assert_eq!(sb.watermark(), Some(3));
        assert!(!sb.admits(&env));
    }

    #[tokio::test]
    async fn test_drop_leaves_room() {
        let engine = engine();
        let conn = ConnectionId::random();
        {
            let mut session = Session::new(Arc::clone(&engine), conn, &ServerConfig::for_testing());
            session.handle(join_msg("A", "r"), Instant::now()).await;
            assert!(engine.lookup(conn).is_some());
        }
        assert!(engine.lookup(conn).is_none());
        assert_eq!(engine.stats().active_rooms, 0);
    }
}
