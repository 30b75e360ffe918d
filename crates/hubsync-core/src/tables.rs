//! Syncable table registry
//!
//! The ordered list of replicated tables. Order matters: foreign-key parents
//! come before their children, and every batch is applied in this order.
//!
//! A table is either:
//! - **forwardable**: replicated to the hub and redistributed to every other runner
//! - **hub-ward only**: replicated to the hub but never forwarded (append-only logs)

use crate::record::{HOST_ID_COLUMN, UPDATED_AT_COLUMN};

/// Current replication schema version
///
/// Hub and runners must agree on this exactly; bump it whenever a table's
/// columns or the table list change.
pub const SCHEMA_VERSION: i64 = 1;

/// Shape of one replicated table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub name: String,
    /// All columns, including `host_id` and `updated_at`
    pub columns: Vec<String>,
    pub primary_key: Vec<String>,
    pub forwardable: bool,
}

impl TableSpec {
    pub fn new(name: &str, columns: &[&str], primary_key: &[&str], forwardable: bool) -> Self {
        Self {
            name: name.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            primary_key: primary_key.iter().map(|c| c.to_string()).collect(),
            forwardable,
        }
    }

    /// Columns that are not part of the primary key
    pub fn value_columns(&self) -> impl Iterator<Item = &String> {
        self.columns
            .iter()
            .filter(move |c| !self.primary_key.contains(*c))
    }
}

/// Ordered registry of syncable tables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTables {
    tables: Vec<TableSpec>,
}

impl SyncTables {
    /// Build a registry from tables already in dependency order
    ///
    /// Every table must carry `host_id` and `updated_at` columns.
    pub fn new(tables: Vec<TableSpec>) -> Result<Self, String> {
        for table in &tables {
            for required in [HOST_ID_COLUMN, UPDATED_AT_COLUMN] {
                if !table.columns.iter().any(|c| c == required) {
                    return Err(format!("table '{}' has no '{}' column", table.name, required));
                }
            }
            if table.primary_key.is_empty() {
                return Err(format!("table '{}' has no primary key", table.name));
            }
        }
        Ok(Self { tables })
    }

    /// All syncable tables, parents first
    pub fn syncable(&self) -> impl Iterator<Item = &TableSpec> {
        self.tables.iter()
    }

    /// Forwardable tables, parents first
    pub fn forwardable(&self) -> impl Iterator<Item = &TableSpec> {
        self.tables.iter().filter(|t| t.forwardable)
    }

    pub fn get(&self, name: &str) -> Option<&TableSpec> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn is_forwardable(&self, name: &str) -> bool {
        self.get(name).is_some_and(|t| t.forwardable)
    }
}

impl Default for SyncTables {
    /// The tables shipped with hubsync
    fn default() -> Self {
        Self {
            tables: vec![
                TableSpec::new(
                    "hosts",
                    &["id", "host_id", "name", "created_at", "updated_at"],
                    &["id"],
                    true,
                ),
                TableSpec::new(
                    "users",
                    &["id", "host_id", "name", "email", "created_at", "updated_at"],
                    &["id"],
                    true,
                ),
                TableSpec::new(
                    "messages",
                    &["id", "host_id", "user_id", "body", "created_at", "updated_at"],
                    &["id"],
                    true,
                ),
                TableSpec::new(
                    "activity_log",
                    &["host_id", "seq", "kind", "detail", "updated_at"],
                    &["host_id", "seq"],
                    false,
                ),
            ],
        }
    }
}
