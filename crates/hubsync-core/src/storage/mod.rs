//! Storage layer
//!
//! SQLite persistence for replicated rows and sync cursors.
//!
//! ## Layout
//!
//! - One SQLite table per syncable table, generated from the registry
//! - `sync_cursors`: one `(role, peer_id)` row per peer relationship holding
//!   the last fully applied `updated_at` watermark
//! - `schema_info`: schema version tracking

pub mod error;
pub mod schema;
pub mod sqlite;

pub use error::{StorageError, StorageResult};
pub use schema::{init_schema, needs_init};
pub use sqlite::{CursorEntry, SqliteStore};
