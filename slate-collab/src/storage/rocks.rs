//! RocksDB-backed event log.
//!
//! Column families:
//! - `events`: drawing events, bincode + LZ4, keyed by room and receipt order
//! - `rooms`: per-room metadata (next receipt order, counts, timestamps)
//!
//! Event key layout keeps a room's events contiguous and in receipt order:
//! ```text
//! ┌──────────────┬──────────────────┬─────────────────────┐
//! │ room_id len  │ room_id (utf-8)  │ receipt_order       │
//! │ 2 bytes BE   │ variable         │ 8 bytes big-endian  │
//! └──────────────┴──────────────────┴─────────────────────┘
//! ```
//! The event and the updated metadata are written in one batch, so a crash
//! never leaves a gap or a reused order.

use std::hash::{BuildHasher, RandomState};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};

use super::{EventLog, StoreError};
use crate::event::{now_millis, DrawingEvent, EventPayload};
use crate::protocol::{ParticipantId, RoomId};

const CF_EVENTS: &str = "events";
const CF_ROOMS: &str = "rooms";

const COLUMN_FAMILIES: &[&str] = &[CF_EVENTS, CF_ROOMS];

/// Number of append lock stripes. Rooms sharing a stripe append in turn.
const APPEND_STRIPES: usize = 64;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every append (default: true)
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("slate_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Per-room bookkeeping stored in the `rooms` column family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomMetadata {
    pub room_id: RoomId,
    /// Order the next appended event will receive.
    pub next_order: u64,
    pub event_count: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl RoomMetadata {
    fn new(room_id: RoomId) -> Self {
        let now = unix_secs();
        Self {
            room_id,
            next_order: 1,
            event_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Durable event log on RocksDB.
pub struct RocksEventLog {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes order assignment within a room. Fixed size, indexed by
    /// room id hash.
    append_locks: Box<[Mutex<()>]>,
    stripe_hasher: RandomState,
}

impl RocksEventLog {
    /// Open the log at the configured path, creating it if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened event log at {}", config.path.display());

        Ok(Self {
            db,
            config,
            append_locks: (0..APPEND_STRIPES).map(|_| Mutex::new(())).collect(),
            stripe_hasher: RandomState::new(),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_EVENTS => {
                // Values are already LZ4 framed by us.
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            CF_ROOMS => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Load room metadata, if the room has ever been written.
    pub fn metadata(&self, room_id: &RoomId) -> Result<Option<RoomMetadata>, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        match self.db.get_cf(&cf, room_id.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(RoomMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::NotFound(format!("column family '{name}'")))
    }

    fn append_lock(&self, room_id: &RoomId) -> &Mutex<()> {
        let stripe = self.stripe_hasher.hash_one(room_id) as usize % self.append_locks.len();
        &self.append_locks[stripe]
    }

    /// Key prefix shared by all events of a room.
    fn room_prefix(room_id: &RoomId) -> Result<Vec<u8>, StoreError> {
        let id = room_id.as_str().as_bytes();
        let len = u16::try_from(id.len())
            .map_err(|_| StoreError::Serialization(format!("room id too long ({} bytes)", id.len())))?;
        let mut prefix = Vec::with_capacity(2 + id.len() + 8);
        prefix.extend_from_slice(&len.to_be_bytes());
        prefix.extend_from_slice(id);
        Ok(prefix)
    }

    fn event_key(room_id: &RoomId, order: u64) -> Result<Vec<u8>, StoreError> {
        let mut key = Self::room_prefix(room_id)?;
        key.extend_from_slice(&order.to_be_bytes());
        Ok(key)
    }

    fn encode_event(event: &DrawingEvent) -> Result<Vec<u8>, StoreError> {
        let raw = bincode::serde::encode_to_vec(event, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    fn decode_event(value: &[u8]) -> Result<DrawingEvent, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(value)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let (event, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(event)
    }
}

impl EventLog for RocksEventLog {
    fn append(
        &self,
        room_id: &RoomId,
        author_id: ParticipantId,
        payload: EventPayload,
    ) -> Result<DrawingEvent, StoreError> {
        let _guard = self
            .append_lock(room_id)
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let cf_events = self.cf(CF_EVENTS)?;
        let cf_rooms = self.cf(CF_ROOMS)?;

        let mut meta = self
            .metadata(room_id)?
            .unwrap_or_else(|| RoomMetadata::new(room_id.clone()));

        let event = DrawingEvent {
            room_id: room_id.clone(),
            author_id,
            payload,
            receipt_order: meta.next_order,
            received_at_ms: now_millis(),
        };

        meta.next_order += 1;
        meta.event_count += 1;
        meta.updated_at = unix_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(
            &cf_events,
            Self::event_key(room_id, event.receipt_order)?,
            Self::encode_event(&event)?,
        );
        batch.put_cf(&cf_rooms, room_id.as_str().as_bytes(), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        log::trace!(
            "Appended {} #{} to room {}",
            event.kind().submit_name(),
            event.receipt_order,
            room_id
        );
        Ok(event)
    }

    fn read(&self, room_id: &RoomId) -> Result<Vec<DrawingEvent>, StoreError> {
        let cf = self.cf(CF_EVENTS)?;
        let prefix = Self::room_prefix(room_id)?;
        let start = Self::event_key(room_id, 0)?;

        let mut events = Vec::new();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&start, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            events.push(Self::decode_event(&value)?);
        }
        Ok(events)
    }

    fn event_count(&self, room_id: &RoomId) -> Result<u64, StoreError> {
        Ok(self.metadata(room_id)?.map_or(0, |m| m.event_count))
    }

    fn rooms(&self) -> Result<Vec<RoomId>, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        let mut rooms = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            rooms.push(RoomMetadata::decode(&value)?.room_id);
        }
        Ok(rooms)
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
