//! SQLite schema for replicated tables
//!
//! Table DDL is generated from the sync registry so the store always matches
//! the tables the protocol knows about. Every replicated table gets an index
//! on `updated_at` for the change queries that drive pulls and catch-up.

use rusqlite::{Connection, Result};

use crate::tables::{SyncTables, TableSpec, SCHEMA_VERSION};

/// Initialize the database schema
pub fn init_schema(conn: &Connection, tables: &SyncTables) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_info (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- Last applied updated_at watermark per peer relationship
        CREATE TABLE IF NOT EXISTS sync_cursors (
            role TEXT NOT NULL,
            peer_id TEXT NOT NULL,
            since TEXT NOT NULL,
            PRIMARY KEY (role, peer_id)
        );
        "#,
    )?;

    for table in tables.syncable() {
        conn.execute_batch(&table_ddl(table))?;
    }

    conn.execute(
        "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

/// DDL for one replicated table and its indexes
///
/// Columns are untyped so any JSON scalar round-trips unchanged.
fn table_ddl(table: &TableSpec) -> String {
    let columns = table
        .columns
        .iter()
        .map(|c| format!("{} {}", quote(c), column_type(c)))
        .collect::<Vec<_>>()
        .join(", ");
    let primary_key = table
        .primary_key
        .iter()
        .map(|c| quote(c))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "CREATE TABLE IF NOT EXISTS {name} ({columns}, PRIMARY KEY ({primary_key}));\n\
         CREATE INDEX IF NOT EXISTS {updated_idx} ON {name}(updated_at);\n\
         CREATE INDEX IF NOT EXISTS {host_idx} ON {name}(host_id, updated_at);",
        name = quote(&table.name),
        updated_idx = quote(&format!("idx_{}_updated_at", table.name)),
        host_idx = quote(&format!("idx_{}_host_id", table.name)),
    )
}

fn column_type(column: &str) -> &'static str {
    match column {
        "host_id" | "updated_at" => "TEXT NOT NULL",
        _ => "",
    }
}

/// Quote an identifier for SQLite
pub(crate) fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<Option<i64>> {
    let mut stmt = conn.prepare("SELECT value FROM schema_info WHERE key = 'version'")?;
    let result: Result<String> = stmt.query_row([], |row| row.get(0));

    match result {
        Ok(version_str) => Ok(version_str.parse().ok()),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Check if schema needs initialization or migration
pub fn needs_init(conn: &Connection) -> bool {
    let table_exists: bool = conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_info'")
        .and_then(|mut stmt| stmt.exists([]))
        .unwrap_or(false);

    if !table_exists {
        return true;
    }

    match get_schema_version(conn) {
        Ok(Some(v)) => v < SCHEMA_VERSION,
        _ => true,
    }
}
