//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                        ┌── Registry (rooms, rosters)
//!             ├── Session ── Engine ──┼── EventLog (memory | RocksDB)
//! Client B ──┘   (per conn)           └── BroadcastGroup per room
//!                                              │
//!                                   ┌──────────┼───────────┐
//!                                   ▼          ▼           ▼
//!                                Client A   Client B    Client C
//! ```
//!
//! One task per connection runs a single receive loop that multiplexes:
//! inbound frames, the room's fan-out stream, the signal throttle deadline
//! and a heartbeat ticker. A peer that stays silent past the heartbeat
//! timeout is treated as gone, and so is one whose socket does not accept a
//! frame within that timeout. A connection whose fan-out receiver lags is
//! sent the room's history again.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::Envelope;
use crate::engine::Engine;
use crate::protocol::{ClientMessage, ConnectionId};
use crate::relay::{DEFAULT_CURSOR_INTERVAL, DEFAULT_LASER_INTERVAL};
use crate::session::Session;
use crate::storage::{EventLog, MemoryEventLog, RocksEventLog, StoreConfig, StoreError};

type ConnectionResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;
type WsSender = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum simultaneous connections per room
    pub max_connections_per_room: usize,
    /// Frames buffered per receiver before it starts lagging
    pub broadcast_capacity: usize,
    /// How often the server pings an idle peer
    pub heartbeat_interval: Duration,
    /// Silence after which a peer is considered gone
    pub heartbeat_timeout: Duration,
    /// Minimum spacing of relayed cursor updates per connection
    pub cursor_interval: Duration,
    /// Minimum spacing of relayed laser-pointer updates per connection
    pub laser_interval: Duration,
    /// Event log directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_connections_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(45),
            cursor_interval: DEFAULT_CURSOR_INTERVAL,
            laser_interval: DEFAULT_LASER_INTERVAL,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, short heartbeats, in-memory log.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(3),
            ..Self::default()
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub active_rooms: usize,
    pub active_connections: usize,
    pub total_connections: u64,
    pub events_persisted: u64,
    /// Events fanned out although persisting them failed
    pub events_unpersisted: u64,
    /// Events from unregistered connections
    pub events_dropped: u64,
    /// Histories re-sent to connections whose receiver lagged
    pub history_resyncs: u64,
    pub signals_relayed: u64,
    pub joins_failed: u64,
    /// Frames skipped by lagging receivers
    pub frames_lagged: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to open event log: {0}")]
    Store(#[from] StoreError),
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    engine: Arc<Engine>,
}

impl SyncServer {
    /// Create a server, opening the RocksDB event log if `storage_path` is
    /// set.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let log: Arc<dyn EventLog> = match &config.storage_path {
            Some(path) => Arc::new(RocksEventLog::open(StoreConfig::new(path.clone()))?),
            None => {
                log::warn!("No storage path configured; room history will not survive restarts");
                Arc::new(MemoryEventLog::new())
            }
        };
        Ok(Self::with_log(config, log))
    }

    /// Create a server over an existing event log.
    pub fn with_log(config: ServerConfig, log: Arc<dyn EventLog>) -> Self {
        let engine = Arc::new(Engine::new(&config, log));
        Self { config, engine }
    }

    /// Default configuration, in-memory log.
    pub fn with_defaults() -> Self {
        Self::with_log(ServerConfig::default(), Arc::new(MemoryEventLog::new()))
    }

    /// Create with a durable log at the given path.
    pub fn with_storage(
        bind_addr: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Result<Self, ServerError> {
        Self::new(ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        })
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let engine = Arc::clone(&self.engine);
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, engine, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        engine: Arc<Engine>,
        config: ServerConfig,
    ) -> ConnectionResult {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let connection_id = ConnectionId::random();
        engine.connection_opened();
        log::info!("WebSocket connection {connection_id} established from {addr}");

        let mut session = Session::new(Arc::clone(&engine), connection_id, &config);
        let result = Self::drive(ws_stream, &mut session, &engine, &config, addr).await;

        // Runs on every exit path, including transport errors.
        session.close();
        log::debug!("Connection {connection_id} from {addr} finished");
        result
    }

    async fn drive(
        ws_stream: WebSocketStream<TcpStream>,
        session: &mut Session,
        engine: &Engine,
        config: &ServerConfig,
        addr: SocketAddr,
    ) -> ConnectionResult {
        let (ws_sender, mut ws_receiver) = ws_stream.split();
        let connection_id = session.connection_id();
        let mut out = Outbound {
            sender: ws_sender,
            limit: config.heartbeat_timeout,
            addr,
        };
        let mut fanout: Option<broadcast::Receiver<Envelope>> = None;

        let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;
        let mut last_seen = Instant::now();

        loop {
            let deadline = session.next_signal_deadline();
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            last_seen = Instant::now();
                            match ClientMessage::decode(&data) {
                                Ok(client_msg) => {
                                    let handled = session.handle(client_msg, Instant::now()).await;
                                    if let Some(rx) = handled.subscription {
                                        fanout = Some(rx);
                                    }
                                    for reply in handled.replies {
                                        out.send(Message::Binary(reply.encode()?.into())).await?;
                                    }
                                }
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                }
                            }
                        }

                        Some(Ok(Message::Ping(data))) => {
                            last_seen = Instant::now();
                            out.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Pong(_))) => {
                            last_seen = Instant::now();
                        }

                        Some(Ok(Message::Text(_))) => {
                            log::debug!("Ignoring text frame from {addr}");
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                envelope = recv_fanout(&mut fanout) => {
                    match envelope {
                        Ok(env) => {
                            if session.admits(&env) {
                                out.send(Message::Binary(env.frame.to_vec().into())).await?;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("Connection {connection_id} lagged by {n} messages, resending history");
                            engine.note_lagged(connection_id, n);
                            match session.resync().await {
                                Ok(Some(history)) => {
                                    out.send(Message::Binary(history.encode()?.into())).await?;
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    log::warn!("Cannot resync lagging connection {connection_id}, closing: {e}");
                                    break;
                                }
                            }
                        }
                        Err(RecvError::Closed) => {
                            fanout = None;
                        }
                    }
                }

                _ = sleep_until(deadline) => {
                    session.flush_signals(Instant::now());
                }

                _ = heartbeat.tick() => {
                    if last_seen.elapsed() > config.heartbeat_timeout {
                        log::warn!("No heartbeat from {addr} for {:?}, dropping", last_seen.elapsed());
                        break;
                    }
                    out.send(Message::Ping(Vec::new().into())).await?;
                }
            }
        }

        Ok(())
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn stats(&self) -> ServerStats {
        self.engine.stats()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

/// Write half of a connection. Every write is bounded by the heartbeat
/// timeout so a peer that stops reading cannot stall its receive loop.
struct Outbound {
    sender: WsSender,
    limit: Duration,
    addr: SocketAddr,
}

impl Outbound {
    async fn send(&mut self, msg: Message) -> ConnectionResult {
        match tokio::time::timeout(self.limit, self.sender.send(msg)).await {
            Ok(sent) => Ok(sent?),
            Err(elapsed) => {
                log::warn!("Send to {} blocked for {:?}, dropping", self.addr, self.limit);
                Err(elapsed.into())
            }
        }
    }
}

/// Next frame from the room, or never if the connection has not joined.
async fn recv_fanout(rx: &mut Option<broadcast::Receiver<Envelope>>) -> Result<Envelope, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}
