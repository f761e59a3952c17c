//! WebSocket sync client.
//!
//! Connects to a [`SyncServer`](crate::server::SyncServer), joins one room and
//! surfaces everything the server sends as [`SyncEvent`]s on an mpsc channel.
//! There is no offline queue: a canvas that reconnects rejoins and replays
//! the room's history instead.

use std::sync::Arc;
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::event::{DrawingEvent, EventPayload};
use crate::protocol::{
    ClientMessage, ParticipantId, ParticipantInfo, ProtocolError, RoomId, Roster, ServerMessage,
};
use crate::relay::{
    LaserSignal, PointerSignal, SignalThrottle, DEFAULT_CURSOR_INTERVAL, DEFAULT_LASER_INTERVAL,
};

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events delivered to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// Full room history; sent after joining and on request.
    History {
        room_id: RoomId,
        events: Vec<DrawingEvent>,
    },
    JoinFailed {
        room_id: RoomId,
        reason: String,
    },
    /// A drawing event from another connection.
    Remote {
        author_id: ParticipantId,
        payload: EventPayload,
        receipt_order: Option<u64>,
    },
    ParticipantJoined {
        participant: ParticipantInfo,
        roster: Roster,
    },
    ParticipantLeft {
        participant_id: ParticipantId,
        display_name: String,
        roster_count: usize,
    },
    Pointer {
        participant: ParticipantInfo,
        x: f32,
        y: f32,
        is_actively_drawing: bool,
    },
    Laser {
        participant: ParticipantInfo,
        x: f32,
        y: f32,
    },
    PointerRetract {
        participant_id: ParticipantId,
    },
    Pong,
}

impl From<ServerMessage> for SyncEvent {
    fn from(msg: ServerMessage) -> Self {
        match msg {
            ServerMessage::History { room_id, events } => SyncEvent::History { room_id, events },
            ServerMessage::JoinFailed { room_id, reason } => SyncEvent::JoinFailed { room_id, reason },
            ServerMessage::ParticipantJoined {
                participant,
                roster,
            } => SyncEvent::ParticipantJoined {
                participant,
                roster,
            },
            ServerMessage::ParticipantLeft {
                participant_id,
                display_name,
                roster_count,
            } => SyncEvent::ParticipantLeft {
                participant_id,
                display_name,
                roster_count,
            },
            ServerMessage::PointerUpdate {
                participant,
                x,
                y,
                is_actively_drawing,
            } => SyncEvent::Pointer {
                participant,
                x,
                y,
                is_actively_drawing,
            },
            ServerMessage::LaserUpdate { participant, x, y } => SyncEvent::Laser { participant, x, y },
            ServerMessage::PointerRetract { participant_id } => {
                SyncEvent::PointerRetract { participant_id }
            }
            ServerMessage::Broadcast {
                author_id,
                payload,
                receipt_order,
            } => SyncEvent::Remote {
                author_id,
                payload,
                receipt_order,
            },
            ServerMessage::Pong => SyncEvent::Pong,
        }
    }
}

/// Sync client for one participant in one room.
pub struct SyncClient {
    participant: ParticipantInfo,
    room_id: RoomId,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    cursor: SignalThrottle<PointerSignal>,
    laser: SignalThrottle<LaserSignal>,
}

impl SyncClient {
    /// `server_url` is a `ws://host:port` address.
    pub fn new(
        participant: ParticipantInfo,
        room_id: impl Into<RoomId>,
        server_url: impl Into<String>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(1024);
        Self {
            participant,
            room_id: room_id.into(),
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_tx,
            event_rx: Some(event_rx),
            cursor: SignalThrottle::new(DEFAULT_CURSOR_INTERVAL),
            laser: SignalThrottle::new(DEFAULT_LASER_INTERVAL),
        }
    }

    /// Take the event receiver. Only the first call returns `Some`.
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Open the WebSocket and join the room. The room history arrives as a
    /// [`SyncEvent::History`].
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok(connected) => connected,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel; close when it is dropped.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });
        self.outgoing_tx = Some(out_tx);

        // Reader task: decode frames into events.
        let event_tx = self.event_tx.clone();
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match ServerMessage::decode(&data) {
                        Ok(server_msg) => {
                            if event_tx.send(SyncEvent::from(server_msg)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Failed to decode server message: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        self.join().await
    }

    /// (Re)send the join for this client's room.
    pub async fn join(&self) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::JoinRoom {
            participant_id: self.participant.participant_id,
            room_id: self.room_id.clone(),
            display_name: self.participant.display_name.clone(),
            display_color: Some(self.participant.display_color.clone()),
        })
        .await
    }

    /// Submit a drawing event the caller has already applied locally.
    pub async fn submit(&self, payload: EventPayload) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Submit {
            room_id: self.room_id.clone(),
            payload,
        })
        .await
    }

    /// Report the local cursor. Returns whether it was sent now; throttled
    /// positions are held until [`SyncClient::flush_signals`].
    pub async fn move_pointer(
        &mut self,
        x: f32,
        y: f32,
        is_actively_drawing: bool,
    ) -> Result<bool, ProtocolError> {
        let signal = PointerSignal {
            x,
            y,
            is_actively_drawing,
        };
        match self.cursor.offer(signal, Instant::now()) {
            Some(signal) => self.send_pointer(signal).await.map(|_| true),
            None => Ok(false),
        }
    }

    /// Report the laser pointer. Same throttling as [`SyncClient::move_pointer`].
    pub async fn laser(&mut self, x: f32, y: f32) -> Result<bool, ProtocolError> {
        match self.laser.offer(LaserSignal { x, y }, Instant::now()) {
            Some(signal) => self.send_laser(signal).await.map(|_| true),
            None => Ok(false),
        }
    }

    /// Send held pointer positions whose window has reopened.
    pub async fn flush_signals(&mut self) -> Result<usize, ProtocolError> {
        let now = Instant::now();
        let mut sent = 0;
        if let Some(signal) = self.cursor.take_due(now) {
            self.send_pointer(signal).await?;
            sent += 1;
        }
        if let Some(signal) = self.laser.take_due(now) {
            self.send_laser(signal).await?;
            sent += 1;
        }
        Ok(sent)
    }

    async fn send_pointer(&self, signal: PointerSignal) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::PointerMove {
            room_id: self.room_id.clone(),
            x: signal.x,
            y: signal.y,
            is_actively_drawing: signal.is_actively_drawing,
        })
        .await
    }

    async fn send_laser(&self, signal: LaserSignal) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::LaserPointer {
            room_id: self.room_id.clone(),
            x: signal.x,
            y: signal.y,
        })
        .await
    }

    /// Ask for the room's history again.
    pub async fn fetch_history(&self) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::FetchHistory {
            room_id: self.room_id.clone(),
        })
        .await
    }

    pub async fn ping(&self) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Ping).await
    }

    /// Close the connection. The server treats it as a leave.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        self.cursor.clear();
        self.laser.clear();
        *self.state.write().await = ConnectionState::Disconnected;
    }

    async fn send(&self, msg: &ClientMessage) -> Result<(), ProtocolError> {
        let tx = self
            .outgoing_tx
            .as_ref()
            .ok_or(ProtocolError::ConnectionClosed)?;
        let encoded = msg.encode()?;
        tx.send(encoded)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn participant(&self) -> &ParticipantInfo {
        &self.participant
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
