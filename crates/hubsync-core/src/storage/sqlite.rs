//! SQLite record store
//!
//! Bundled `RecordStore` implementation used by both the hub and the runners.
//!
//! Upserts are last-writer-wins on `updated_at`: a replayed older version of
//! a row never overwrites a newer one, so replays after a crash or an
//! overlapping catch-up page are harmless. A row's `host_id` is fixed at
//! insert; a conflicting write from another host leaves the row untouched.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::{Map, Number, Value};
use tracing::debug;

use super::error::{StorageError, StorageResult};
use super::schema::{get_schema_version, init_schema, needs_init, quote};
use crate::record::{format_timestamp, parse_timestamp, Record, Timestamp};
use crate::store::{ChangeQuery, CursorRole, HostFilter, RecordStore};
use crate::tables::{SyncTables, TableSpec, SCHEMA_VERSION};

/// A persisted cursor row, as listed by `SqliteStore::cursors`
#[derive(Debug, Clone, PartialEq)]
pub struct CursorEntry {
    pub role: String,
    pub peer_id: String,
    pub since: Timestamp,
}

/// SQLite-backed record store
pub struct SqliteStore {
    conn: Mutex<Connection>,
    tables: SyncTables,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open or create the database at `path`
    pub fn open(path: &Path, tables: SyncTables) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::from_io(e, parent.to_path_buf()))?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;

        if let Some(found) = get_schema_version(&conn).ok().flatten() {
            if found > SCHEMA_VERSION {
                return Err(StorageError::SchemaTooNew {
                    found,
                    supported: SCHEMA_VERSION,
                });
            }
        }
        // Table DDL is idempotent, so new registry tables are picked up too
        if needs_init(&conn) || !Self::has_tables(&conn, &tables)? {
            init_schema(&conn, &tables)?;
        }

        debug!("Opened record store at {:?}", path);
        Ok(Self {
            conn: Mutex::new(conn),
            tables,
            path: Some(path.to_path_buf()),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory(tables: SyncTables) -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn, &tables)?;
        Ok(Self {
            conn: Mutex::new(conn),
            tables,
            path: None,
        })
    }

    /// The table registry this store was opened with
    pub fn tables(&self) -> &SyncTables {
        &self.tables
    }

    /// Database file location, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of rows in a table
    pub fn count(&self, table: &str) -> StorageResult<i64> {
        let spec = self.spec(table)?;
        let conn = self.lock()?;
        let count = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote(&spec.name)),
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Every row in a table, oldest change first
    pub fn all(&self, table: &str) -> StorageResult<Vec<Record>> {
        let spec = self.spec(table)?;
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM {} ORDER BY updated_at",
            column_list(spec),
            quote(&spec.name)
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| row_to_record(spec, row))?;
        let records = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Look up one row by its primary key values
    pub fn get(&self, table: &str, key: &[Value]) -> StorageResult<Option<Record>> {
        let spec = self.spec(table)?;
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM {} WHERE {}",
            column_list(spec),
            quote(&spec.name),
            key_predicate(spec)
        );
        let record = conn
            .query_row(&sql, params_from_iter(key.iter().map(to_sql)), |row| {
                row_to_record(spec, row)
            })
            .optional()?;
        Ok(record)
    }

    /// All persisted cursors
    pub fn cursors(&self) -> StorageResult<Vec<CursorEntry>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT role, peer_id, since FROM sync_cursors ORDER BY role, peer_id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (role, peer_id, since) = row?;
            if let Some(since) = parse_timestamp(&since) {
                entries.push(CursorEntry {
                    role,
                    peer_id,
                    since,
                });
            }
        }
        Ok(entries)
    }

    fn spec(&self, table: &str) -> StorageResult<&TableSpec> {
        self.tables
            .get(table)
            .ok_or_else(|| StorageError::UnknownTable(table.to_string()))
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    fn has_tables(conn: &Connection, tables: &SyncTables) -> StorageResult<bool> {
        let mut stmt = conn.prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name = ?")?;
        for table in tables.syncable() {
            if !stmt.exists(params![table.name])? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl RecordStore for SqliteStore {
    fn upsert(&self, table: &TableSpec, records: &[Record]) -> StorageResult<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut normalized = Vec::with_capacity(records.len());
        for record in records {
            let mut record = record.clone();
            record.validate(table)?;
            normalized.push(record);
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut written = 0;
        {
            let mut stmt = tx.prepare_cached(&upsert_sql(table))?;
            for record in &normalized {
                let values = table
                    .columns
                    .iter()
                    .map(|c| record.get(c).map(to_sql).unwrap_or(SqlValue::Null));
                written += stmt.execute(params_from_iter(values))?;
            }
        }
        tx.commit()?;

        debug!(
            table = %table.name,
            received = records.len(),
            written,
            "Upserted records"
        );
        Ok(written)
    }

    fn query_changed(&self, table: &TableSpec, query: &ChangeQuery) -> StorageResult<Vec<Record>> {
        let mut sql = format!(
            "SELECT {} FROM {} WHERE updated_at > ?1",
            column_list(table),
            quote(&table.name)
        );
        let mut args = vec![SqlValue::Text(format_timestamp(&query.after))];

        let (op, host) = match &query.hosts {
            HostFilter::Only(host) => ("=", host),
            HostFilter::Excluding(host) => ("!=", host),
        };
        args.push(SqlValue::Text(host.clone()));
        sql.push_str(&format!(" AND host_id {} ?{}", op, args.len()));

        if let Some(until) = &query.until {
            args.push(SqlValue::Text(format_timestamp(until)));
            sql.push_str(&format!(" AND updated_at <= ?{}", args.len()));
        }

        let order = std::iter::once("updated_at".to_string())
            .chain(table.primary_key.iter().map(|c| quote(c)))
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&format!(" ORDER BY {}", order));

        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), |row| row_to_record(table, row))?;
        let records = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn load_cursor(&self, role: CursorRole, peer_id: &str) -> StorageResult<Option<Timestamp>> {
        let conn = self.lock()?;
        let since: Option<String> = conn
            .query_row(
                "SELECT since FROM sync_cursors WHERE role = ?1 AND peer_id = ?2",
                params![role.as_str(), peer_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(since.as_deref().and_then(parse_timestamp))
    }

    fn save_cursor(&self, role: CursorRole, peer_id: &str, since: &Timestamp) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO sync_cursors (role, peer_id, since) VALUES (?1, ?2, ?3)
            ON CONFLICT(role, peer_id) DO UPDATE SET since = MAX(since, excluded.since)
            "#,
            params![role.as_str(), peer_id, format_timestamp(since)],
        )?;
        Ok(())
    }

    fn stored_owner(&self, table: &TableSpec, record: &Record) -> StorageResult<Option<String>> {
        let sql = format!(
            "SELECT host_id FROM {} WHERE {}",
            quote(&table.name),
            key_predicate(table)
        );
        let key = table
            .primary_key
            .iter()
            .map(|c| record.get(c).map(to_sql).unwrap_or(SqlValue::Null));

        let conn = self.lock()?;
        let owner = conn
            .query_row(&sql, params_from_iter(key), |row| row.get(0))
            .optional()?;
        Ok(owner)
    }
}

/// `pk1 = ?1 AND pk2 = ?2 ..` over a table's primary key
fn key_predicate(table: &TableSpec) -> String {
    table
        .primary_key
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = ?{}", quote(c), i + 1))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn column_list(table: &TableSpec) -> String {
    table
        .columns
        .iter()
        .map(|c| quote(c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn upsert_sql(table: &TableSpec) -> String {
    let name = quote(&table.name);
    let placeholders = (1..=table.columns.len())
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ");
    let conflict = table
        .primary_key
        .iter()
        .map(|c| quote(c))
        .collect::<Vec<_>>()
        .join(", ");
    let updates = table
        .value_columns()
        .map(|c| format!("{col} = excluded.{col}", col = quote(c)))
        .collect::<Vec<_>>();

    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!(
            "DO UPDATE SET {} WHERE excluded.updated_at >= {name}.updated_at \
             AND excluded.host_id = {name}.host_id",
            updates.join(", "),
        )
    };

    format!(
        "INSERT INTO {name} ({columns}) VALUES ({placeholders}) ON CONFLICT({conflict}) {action}",
        columns = column_list(table),
    )
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Array(b.iter().map(|byte| Value::from(*byte)).collect()),
    }
}

fn row_to_record(table: &TableSpec, row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
    let mut map = Map::with_capacity(table.columns.len());
    for (i, column) in table.columns.iter().enumerate() {
        let value = from_sql(row.get_ref(i)?);
        if !value.is_null() {
            map.insert(column.clone(), value);
        }
    }
    Ok(Record::from(map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use tempfile::TempDir;

    fn at(minute: i64) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory(SyncTables::default()).unwrap()
    }

    fn users(store: &SqliteStore) -> TableSpec {
        store.tables().get("users").unwrap().clone()
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let store = store();
        let spec = users(&store);
        let batch = vec![
            Record::owned("a", at(1)).with("id", "alice").with("name", "Alice"),
            Record::owned("a", at(2)).with("id", "bob").with("name", "Bob"),
        ];

        store.upsert(&spec, &batch).unwrap();
        let once = store.all("users").unwrap();
        store.upsert(&spec, &batch).unwrap();
        let twice = store.all("users").unwrap();

        assert_eq!(once, twice);
        assert_eq!(store.count("users").unwrap(), 2);
    }

    #[test]
    fn test_older_version_does_not_overwrite_newer() {
        let store = store();
        let spec = users(&store);

        store
            .upsert(&spec, &[Record::owned("a", at(5)).with("id", "alice").with("name", "new")])
            .unwrap();
        let written = store
            .upsert(&spec, &[Record::owned("a", at(1)).with("id", "alice").with("name", "old")])
            .unwrap();

        assert_eq!(written, 0);
        let row = store.get("users", &[Value::from("alice")]).unwrap().unwrap();
        assert_eq!(row.get("name"), Some(&Value::from("new")));
    }

    #[test]
    fn test_upsert_never_reassigns_owner() {
        let store = store();
        let spec = users(&store);

        store
            .upsert(&spec, &[Record::owned("b", at(1)).with("id", "bob").with("name", "Bob")])
            .unwrap();
        let written = store
            .upsert(&spec, &[Record::owned("a", at(2)).with("id", "bob").with("name", "Mallory")])
            .unwrap();

        assert_eq!(written, 0);
        let row = store.get("users", &[Value::from("bob")]).unwrap().unwrap();
        assert_eq!(row.host_id(), Some("b"));
        assert_eq!(row.get("name"), Some(&Value::from("Bob")));
    }

    #[test]
    fn test_stored_owner() {
        let store = store();
        let spec = users(&store);
        let bob = Record::owned("b", at(1)).with("id", "bob");

        assert_eq!(store.stored_owner(&spec, &bob).unwrap(), None);
        store.upsert(&spec, std::slice::from_ref(&bob)).unwrap();

        let claim = Record::owned("a", at(2)).with("id", "bob");
        assert_eq!(store.stored_owner(&spec, &claim).unwrap().as_deref(), Some("b"));
    }

    #[test]
    fn test_upsert_rejects_invalid_record() {
        let store = store();
        let spec = users(&store);
        let err = store
            .upsert(&spec, &[Record::new().with("id", "alice")])
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidRecord(_)));
        assert_eq!(store.count("users").unwrap(), 0);
    }

    #[test]
    fn test_values_round_trip() {
        let store = store();
        let spec = users(&store);
        store
            .upsert(
                &spec,
                &[Record::owned("a", at(1))
                    .with("id", "alice")
                    .with("name", "Alice")
                    .with("created_at", 1_700_000_000)],
            )
            .unwrap();

        let row = store.get("users", &[Value::from("alice")]).unwrap().unwrap();
        assert_eq!(row.get("created_at"), Some(&Value::from(1_700_000_000)));
        assert_eq!(row.host_id(), Some("a"));
        assert_eq!(row.updated_at(), Some(at(1)));
        assert_eq!(row.get("email"), None);
    }

    #[test]
    fn test_query_changed_range_and_filter() {
        let store = store();
        let spec = users(&store);
        store
            .upsert(
                &spec,
                &[
                    Record::owned("a", at(1)).with("id", "a1"),
                    Record::owned("b", at(2)).with("id", "b1"),
                    Record::owned("a", at(3)).with("id", "a2"),
                    Record::owned("a", at(4)).with("id", "a3"),
                ],
            )
            .unwrap();

        let rows = store
            .query_changed(
                &spec,
                &ChangeQuery {
                    after: at(1),
                    until: Some(at(3)),
                    hosts: HostFilter::Only("a".into()),
                    limit: None,
                },
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("id"), Some(&Value::from("a2")));

        let rows = store
            .query_changed(
                &spec,
                &ChangeQuery {
                    after: at(0),
                    until: None,
                    hosts: HostFilter::Excluding("a".into()),
                    limit: Some(10),
                },
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].host_id(), Some("b"));
    }

    #[test]
    fn test_cursor_never_moves_backwards() {
        let store = store();
        assert_eq!(store.load_cursor(CursorRole::Hub, "runner-a").unwrap(), None);

        store.save_cursor(CursorRole::Hub, "runner-a", &at(10)).unwrap();
        store.save_cursor(CursorRole::Hub, "runner-a", &at(5)).unwrap();
        assert_eq!(
            store.load_cursor(CursorRole::Hub, "runner-a").unwrap(),
            Some(at(10))
        );

        // Roles are independent
        assert_eq!(store.load_cursor(CursorRole::Runner, "runner-a").unwrap(), None);
    }

    #[test]
    fn test_cursor_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("runner.db");

        {
            let store = SqliteStore::open(&path, SyncTables::default()).unwrap();
            store.save_cursor(CursorRole::Runner, "hub", &at(42)).unwrap();
            let spec = users(&store);
            store
                .upsert(&spec, &[Record::owned("b", at(42)).with("id", "bob")])
                .unwrap();
        }

        let store = SqliteStore::open(&path, SyncTables::default()).unwrap();
        assert_eq!(store.load_cursor(CursorRole::Runner, "hub").unwrap(), Some(at(42)));
        assert_eq!(store.count("users").unwrap(), 1);
        assert_eq!(store.cursors().unwrap().len(), 1);
    }

    #[test]
    fn test_composite_primary_key() {
        let store = store();
        let spec = store.tables().get("activity_log").unwrap().clone();
        store
            .upsert(
                &spec,
                &[
                    Record::owned("a", at(1)).with("seq", 1).with("kind", "boot"),
                    Record::owned("b", at(1)).with("seq", 1).with("kind", "boot"),
                ],
            )
            .unwrap();
        assert_eq!(store.count("activity_log").unwrap(), 2);
    }
}
