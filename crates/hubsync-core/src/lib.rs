//! hubsync core library
//!
//! Hub-and-spoke row replication. Every runner owns the rows stamped with its
//! host id; the hub pulls each runner's changes, stores them, and forwards
//! them to every other runner. A runner that was offline catches up from the
//! hub when it reconnects.
//!
//! # Architecture
//!
//! - **SQLite** holds the replicated tables and the per-peer cursors
//! - **WebSocket + CBOR** carries request/ack envelopes between hub and runners
//!
//! Delivery is at-least-once and every write is an idempotent upsert keyed by
//! primary key, so replays converge.
//!
//! # Modules
//!
//! - `record`: Rows as column maps, timestamps
//! - `tables`: Which tables replicate and which are forwarded
//! - `store`: Storage interface and cross-table paging
//! - `storage`: SQLite implementation
//! - `sync`: Wire protocol, hub, and runner
//! - `config`: Application configuration

pub mod config;
pub mod error;
pub mod record;
pub mod storage;
pub mod store;
pub mod sync;
pub mod tables;

pub use config::Config;
pub use error::{SyncError, SyncResult};
pub use record::{HostId, Record, RecordError, TableBatch, Timestamp};
pub use storage::{SqliteStore, StorageError, StorageResult};
pub use store::{CursorRole, RecordStore};
pub use sync::{Hub, HubServer, HubSettings, Runner, RunnerSettings};
pub use tables::{SyncTables, TableSpec};
