//! Record store interface
//!
//! The sync core talks to storage only through `RecordStore`: idempotent
//! upserts keyed by primary key, change queries by `updated_at`, and durable
//! per-peer cursors. `SqliteStore` is the bundled implementation.
//!
//! ## Paging
//!
//! Pulls and catch-up hand out one page at a time and the receiver advances a
//! single cursor to the largest `updated_at` it saw. A per-table `LIMIT` would
//! let that cursor jump past rows still waiting in a slower table, so
//! `collect_page` cuts the page at a global timestamp boundary instead and
//! always includes every row sharing the boundary timestamp.

use std::fmt;

use crate::record::{max_updated_at, Record, TableBatch, Timestamp};
use crate::storage::StorageResult;
use crate::tables::TableSpec;

/// Which side of a peer relationship a cursor belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CursorRole {
    /// Hub-side: "rows from this runner already ingested"
    Hub,
    /// Runner-side: "rows from this hub already applied"
    Runner,
}

impl CursorRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            CursorRole::Hub => "hub",
            CursorRole::Runner => "runner",
        }
    }
}

impl fmt::Display for CursorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ownership filter for change queries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostFilter {
    /// Only rows owned by this host (what a runner reports upstream)
    Only(String),
    /// Every row not owned by this host (what the hub hands back down)
    Excluding(String),
}

/// A change query against one table
#[derive(Debug, Clone)]
pub struct ChangeQuery {
    /// Exclusive lower bound on `updated_at`
    pub after: Timestamp,
    /// Inclusive upper bound on `updated_at`
    pub until: Option<Timestamp>,
    pub hosts: HostFilter,
    pub limit: Option<usize>,
}

/// Storage boundary used by the hub and the runners
pub trait RecordStore: Send + Sync {
    /// Insert or update records by primary key; returns rows written
    ///
    /// Applying the same records twice must leave the same state as once.
    fn upsert(&self, table: &TableSpec, records: &[Record]) -> StorageResult<usize>;

    /// Rows changed within the query range, oldest first
    fn query_changed(&self, table: &TableSpec, query: &ChangeQuery) -> StorageResult<Vec<Record>>;

    /// Load the persisted cursor for a peer
    fn load_cursor(&self, role: CursorRole, peer_id: &str) -> StorageResult<Option<Timestamp>>;

    /// Persist the cursor for a peer; never moves an existing cursor backwards
    fn save_cursor(&self, role: CursorRole, peer_id: &str, since: &Timestamp) -> StorageResult<()>;

    /// Owner of the stored row sharing `record`'s primary key, if any
    fn stored_owner(&self, table: &TableSpec, record: &Record) -> StorageResult<Option<String>>;
}

/// One page of changes across several tables
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub tables: TableBatch,
    pub has_more: bool,
    pub max_updated_at: Option<Timestamp>,
}

impl Page {
    pub fn is_empty(&self) -> bool {
        self.tables.values().all(Vec::is_empty)
    }
}

/// Collect the oldest `limit` changes (plus boundary ties) across `tables`
pub fn collect_page<'a, S, I>(
    store: &S,
    tables: I,
    after: Timestamp,
    hosts: HostFilter,
    limit: usize,
) -> StorageResult<Page>
where
    S: RecordStore + ?Sized,
    I: IntoIterator<Item = &'a TableSpec>,
{
    let limit = limit.max(1);
    let lookahead = ChangeQuery {
        after,
        until: None,
        hosts: hosts.clone(),
        limit: Some(limit + 1),
    };

    let mut candidates = Vec::new();
    for table in tables {
        let rows = store.query_changed(table, &lookahead)?;
        let capped = rows.len() > limit;
        candidates.push((table, rows, capped));
    }

    let mut stamps: Vec<Timestamp> = candidates
        .iter()
        .flat_map(|(_, rows, _)| rows.iter().filter_map(Record::updated_at))
        .collect();

    if stamps.len() <= limit {
        let tables: TableBatch = candidates
            .into_iter()
            .filter(|(_, rows, _)| !rows.is_empty())
            .map(|(table, rows, _)| (table.name.clone(), rows))
            .collect();
        let max = max_updated_at(&tables);
        return Ok(Page {
            tables,
            has_more: false,
            max_updated_at: max,
        });
    }

    stamps.sort();
    let boundary = stamps[limit - 1];

    let mut has_more = false;
    let mut batch = TableBatch::new();
    for (table, rows, capped) in candidates {
        let rows = if capped {
            // This table may hold more boundary ties than the lookahead returned
            has_more = true;
            store.query_changed(
                table,
                &ChangeQuery {
                    after,
                    until: Some(boundary),
                    hosts: hosts.clone(),
                    limit: None,
                },
            )?
        } else {
            let (within, beyond): (Vec<_>, Vec<_>) = rows
                .into_iter()
                .partition(|r| r.updated_at().is_some_and(|ts| ts <= boundary));
            has_more |= !beyond.is_empty();
            within
        };
        if !rows.is_empty() {
            batch.insert(table.name.clone(), rows);
        }
    }

    let max = max_updated_at(&batch);
    Ok(Page {
        tables: batch,
        has_more,
        max_updated_at: max,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{epoch, record_count};
    use crate::storage::SqliteStore;
    use crate::tables::SyncTables;
    use chrono::{Duration, TimeZone, Utc};

    fn at(minute: i64) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn seeded() -> (SqliteStore, SyncTables) {
        let tables = SyncTables::default();
        let store = SqliteStore::open_in_memory(tables.clone()).unwrap();
        let users = tables.get("users").unwrap();
        let messages = tables.get("messages").unwrap();

        // users at minutes 1, 3, 5; messages at 2, 4, 6
        let user_rows: Vec<_> = [1, 3, 5]
            .iter()
            .map(|m| Record::owned("a", at(*m)).with("id", format!("u{m}")))
            .collect();
        let message_rows: Vec<_> = [2, 4, 6]
            .iter()
            .map(|m| Record::owned("a", at(*m)).with("id", format!("m{m}")))
            .collect();
        store.upsert(users, &user_rows).unwrap();
        store.upsert(messages, &message_rows).unwrap();
        (store, tables)
    }

    #[test]
    fn test_page_cuts_at_global_boundary() {
        let (store, tables) = seeded();

        let page = collect_page(
            &store,
            tables.forwardable(),
            epoch(),
            HostFilter::Only("a".into()),
            3,
        )
        .unwrap();

        assert!(page.has_more);
        assert_eq!(record_count(&page.tables), 3);
        assert_eq!(page.max_updated_at, Some(at(3)));
        assert_eq!(page.tables["users"].len(), 2);
        assert_eq!(page.tables["messages"].len(), 1);
    }

    #[test]
    fn test_paging_with_cursor_sees_every_row_once() {
        let (store, tables) = seeded();
        let mut cursor = epoch();
        let mut seen = 0;

        loop {
            let page = collect_page(
                &store,
                tables.forwardable(),
                cursor,
                HostFilter::Only("a".into()),
                2,
            )
            .unwrap();
            seen += record_count(&page.tables);
            if let Some(max) = page.max_updated_at {
                cursor = max;
            }
            if !page.has_more {
                break;
            }
        }

        assert_eq!(seen, 6);
        assert_eq!(cursor, at(6));
    }

    #[test]
    fn test_boundary_ties_stay_together() {
        let tables = SyncTables::default();
        let store = SqliteStore::open_in_memory(tables.clone()).unwrap();
        let users = tables.get("users").unwrap();
        let rows: Vec<_> = (0..4)
            .map(|i| Record::owned("a", at(1)).with("id", format!("u{i}")))
            .collect();
        store.upsert(users, &rows).unwrap();

        let page = collect_page(
            &store,
            tables.forwardable(),
            epoch(),
            HostFilter::Only("a".into()),
            2,
        )
        .unwrap();

        assert_eq!(record_count(&page.tables), 4);
    }

    #[test]
    fn test_host_filter_excludes_own_rows() {
        let (store, tables) = seeded();
        let users = tables.get("users").unwrap();
        store
            .upsert(users, &[Record::owned("b", at(7)).with("id", "bob")])
            .unwrap();

        let page = collect_page(
            &store,
            tables.forwardable(),
            epoch(),
            HostFilter::Excluding("a".into()),
            100,
        )
        .unwrap();

        assert!(!page.has_more);
        assert_eq!(record_count(&page.tables), 1);
        assert_eq!(page.tables["users"][0].host_id(), Some("b"));
    }

    #[test]
    fn test_empty_page() {
        let (store, tables) = seeded();
        let page = collect_page(
            &store,
            tables.forwardable(),
            at(60),
            HostFilter::Only("a".into()),
            10,
        )
        .unwrap();
        assert!(page.is_empty());
        assert!(!page.has_more);
        assert_eq!(page.max_updated_at, None);
    }
}
