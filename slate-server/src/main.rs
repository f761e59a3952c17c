//! Slate sync server binary.
//!
//! Every flag falls back to a `SLATE_*` environment variable, then to the
//! `ServerConfig` default. `RUST_LOG` controls log filtering (default `info`).

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use log::info;
use slate_collab::{ServerConfig, ServerError, SyncServer};

/// Real-time collaborative whiteboard sync server.
#[derive(Debug, Parser)]
#[command(name = "slate-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "SLATE_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// Event log directory. Without it, history lives in memory only.
    #[arg(long, env = "SLATE_STORAGE")]
    storage: Option<PathBuf>,

    /// Seconds between WebSocket pings to each peer.
    #[arg(long, env = "SLATE_HEARTBEAT_SECS", default_value_t = 15)]
    heartbeat_secs: u64,

    /// Seconds of silence after which a peer is dropped.
    #[arg(long, env = "SLATE_HEARTBEAT_TIMEOUT_SECS", default_value_t = 45)]
    heartbeat_timeout_secs: u64,

    /// Minimum spacing of relayed cursor updates, in milliseconds.
    #[arg(long, env = "SLATE_CURSOR_INTERVAL_MS", default_value_t = 40)]
    cursor_interval_ms: u64,

    /// Minimum spacing of relayed laser updates, in milliseconds.
    #[arg(long, env = "SLATE_LASER_INTERVAL_MS", default_value_t = 100)]
    laser_interval_ms: u64,

    /// Frames buffered per room receiver before it lags.
    #[arg(long, env = "SLATE_BROADCAST_CAPACITY", default_value_t = 256)]
    broadcast_capacity: usize,

    /// Connections allowed in one room.
    #[arg(long, env = "SLATE_MAX_CONNECTIONS_PER_ROOM", default_value_t = 100)]
    max_connections_per_room: usize,
}

impl Cli {
    fn config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            max_connections_per_room: self.max_connections_per_room.max(1),
            broadcast_capacity: self.broadcast_capacity.max(1),
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs.max(1)),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs.max(1)),
            cursor_interval: Duration::from_millis(self.cursor_interval_ms),
            laser_interval: Duration::from_millis(self.laser_interval_ms),
            storage_path: self.storage.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = cli.config();
    match &config.storage_path {
        Some(path) => info!("Starting Slate on {} (log at {})", config.bind_addr, path.display()),
        None => info!("Starting Slate on {} (in-memory log)", config.bind_addr),
    }

    SyncServer::new(config)?.run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_server_config() {
        let cli = Cli::try_parse_from(["slate-server"]).unwrap();
        let config = cli.config();
        let defaults = ServerConfig::default();

        assert_eq!(config.bind_addr, defaults.bind_addr);
        assert_eq!(config.heartbeat_interval, defaults.heartbeat_interval);
        assert_eq!(config.heartbeat_timeout, defaults.heartbeat_timeout);
        assert_eq!(config.cursor_interval, defaults.cursor_interval);
        assert_eq!(config.laser_interval, defaults.laser_interval);
        assert_eq!(config.broadcast_capacity, defaults.broadcast_capacity);
        assert_eq!(config.max_connections_per_room, defaults.max_connections_per_room);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "slate-server",
            "--bind",
            "0.0.0.0:7000",
            "--storage",
            "/var/lib/slate",
            "--heartbeat-secs",
            "5",
            "--cursor-interval-ms",
            "16",
            "--max-connections-per-room",
            "8",
        ])
        .unwrap();
        let config = cli.config();

        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.storage_path, Some(PathBuf::from("/var/lib/slate")));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.cursor_interval, Duration::from_millis(16));
        assert_eq!(config.max_connections_per_room, 8);
    }

    #[test]
    fn test_zero_capacities_are_clamped() {
        let cli = Cli::try_parse_from([
            "slate-server",
            "--broadcast-capacity",
            "0",
            "--max-connections-per-room",
            "0",
            "--heartbeat-secs",
            "0",
        ])
        .unwrap();
        let config = cli.config();

        assert_eq!(config.broadcast_capacity, 1);
        assert_eq!(config.max_connections_per_room, 1);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_rejects_non_numeric_interval() {
        assert!(Cli::try_parse_from(["slate-server", "--laser-interval-ms", "fast"]).is_err());
    }
}
