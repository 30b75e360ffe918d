//! Command handlers

pub mod config;
pub mod hub;
pub mod record;
pub mod runner;
pub mod status;

use anyhow::{Context, Result};

use hubsync_core::{Config, SqliteStore, SyncTables};

/// Open the local database with the built-in table registry
pub fn open_store(config: &Config) -> Result<SqliteStore> {
    let path = config.sqlite_path();
    SqliteStore::open(&path, SyncTables::default())
        .with_context(|| format!("Failed to open database at {:?}", path))
}
