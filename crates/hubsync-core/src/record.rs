//! Replicated row model
//!
//! A `Record` is one row of a syncable table, carried as a JSON object so the
//! replication layer stays agnostic of each table's columns. Two fields are
//! interpreted by the sync core:
//!
//! - `host_id`: the runner that owns the row; never changes after creation
//! - `updated_at`: RFC 3339 write timestamp set by the owning runner

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::tables::TableSpec;

/// Stable identifier of a runner (or of the hub, from a runner's point of view)
pub type HostId = String;

/// Cursor and row timestamp type
pub type Timestamp = DateTime<Utc>;

/// Column holding the owning runner's id
pub const HOST_ID_COLUMN: &str = "host_id";

/// Column holding the row's write timestamp
pub const UPDATED_AT_COLUMN: &str = "updated_at";

/// Rows grouped by table name
///
/// Map order is alphabetical; anything that applies a batch must walk the
/// table registry instead so parents land before children.
pub type TableBatch = BTreeMap<String, Vec<Record>>;

/// The cursor used before anything has been synced
pub fn epoch() -> Timestamp {
    DateTime::<Utc>::UNIX_EPOCH
}

/// Canonical text form of a timestamp
///
/// Fixed precision and a `Z` suffix make string order match time order,
/// which the SQLite store relies on for range queries.
pub fn format_timestamp(ts: &Timestamp) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 timestamp into UTC
pub fn parse_timestamp(raw: &str) -> Option<Timestamp> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Why a record was refused before reaching storage
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("record in '{table}' is missing column '{column}'")]
    MissingColumn { table: String, column: String },

    #[error("record in '{table}' has a non-text host_id")]
    InvalidHostId { table: String },

    #[error("record in '{table}' has an unparseable updated_at: {value}")]
    InvalidTimestamp { table: String, value: String },
}

/// A single replicated row
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    /// Create an empty record
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a record owned by `host_id`, stamped with `updated_at`
    pub fn owned(host_id: &str, updated_at: Timestamp) -> Self {
        let mut record = Self::new();
        record.set(HOST_ID_COLUMN, host_id);
        record.set(UPDATED_AT_COLUMN, format_timestamp(&updated_at));
        record
    }

    /// Builder-style column setter
    pub fn with(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.set(column, value);
        self
    }

    /// Set a column value
    pub fn set(&mut self, column: &str, value: impl Into<Value>) {
        self.0.insert(column.to_string(), value.into());
    }

    /// Get a column value
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    /// The owning runner, if the column is present and textual
    pub fn host_id(&self) -> Option<&str> {
        self.0.get(HOST_ID_COLUMN).and_then(Value::as_str)
    }

    /// The write timestamp, if present and parseable
    pub fn updated_at(&self) -> Option<Timestamp> {
        self.0
            .get(UPDATED_AT_COLUMN)
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
    }

    /// Access the raw column map
    pub fn columns(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Check the columns the sync core depends on and normalize `updated_at`
    /// to its canonical text form
    pub fn validate(&mut self, table: &TableSpec) -> Result<(), RecordError> {
        for column in &table.primary_key {
            if !self.0.contains_key(column) {
                return Err(RecordError::MissingColumn {
                    table: table.name.clone(),
                    column: column.clone(),
                });
            }
        }

        match self.0.get(HOST_ID_COLUMN) {
            Some(Value::String(_)) => {}
            Some(_) => {
                return Err(RecordError::InvalidHostId {
                    table: table.name.clone(),
                })
            }
            None => {
                return Err(RecordError::MissingColumn {
                    table: table.name.clone(),
                    column: HOST_ID_COLUMN.to_string(),
                })
            }
        }

        let Some(raw) = self.0.get(UPDATED_AT_COLUMN) else {
            return Err(RecordError::MissingColumn {
                table: table.name.clone(),
                column: UPDATED_AT_COLUMN.to_string(),
            });
        };
        let Some(ts) = raw.as_str().and_then(parse_timestamp) else {
            return Err(RecordError::InvalidTimestamp {
                table: table.name.clone(),
                value: raw.to_string(),
            });
        };
        self.set(UPDATED_AT_COLUMN, format_timestamp(&ts));
        Ok(())
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Largest `updated_at` across every record in a batch
pub fn max_updated_at(batch: &TableBatch) -> Option<Timestamp> {
    batch
        .values()
        .flatten()
        .filter_map(Record::updated_at)
        .max()
}

/// Total number of records across all tables in a batch
pub fn record_count(batch: &TableBatch) -> usize {
    batch.values().map(Vec::len).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn users() -> TableSpec {
        TableSpec::new("users", &["id", "host_id", "name", "updated_at"], &["id"], true)
    }

    #[test]
    fn test_owned_record_accessors() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let record = Record::owned("runner-a", ts).with("id", "alice");

        assert_eq!(record.host_id(), Some("runner-a"));
        assert_eq!(record.updated_at(), Some(ts));
        assert_eq!(record.get("id"), Some(&Value::from("alice")));
    }

    #[test]
    fn test_canonical_timestamp_orders_as_text() {
        let early = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        assert!(format_timestamp(&early) < format_timestamp(&late));
        assert_eq!(format_timestamp(&early), "2024-05-01T09:00:00.000Z");
    }

    #[test]
    fn test_validate_normalizes_offset_timestamps() {
        let mut record = Record::new()
            .with("id", "alice")
            .with("host_id", "runner-a")
            .with("updated_at", "2024-05-01T14:00:00+02:00");

        record.validate(&users()).unwrap();
        assert_eq!(
            record.get("updated_at"),
            Some(&Value::from("2024-05-01T12:00:00.000Z"))
        );
    }

    #[test]
    fn test_validate_rejects_missing_primary_key() {
        let mut record = Record::owned("runner-a", Utc::now());
        let err = record.validate(&users()).unwrap_err();
        assert!(matches!(err, RecordError::MissingColumn { ref column, .. } if column == "id"));
    }

    #[test]
    fn test_validate_rejects_bad_timestamp() {
        let mut record = Record::new()
            .with("id", "alice")
            .with("host_id", "runner-a")
            .with("updated_at", "yesterday");
        assert!(matches!(
            record.validate(&users()),
            Err(RecordError::InvalidTimestamp { .. })
        ));
    }

    #[test]
    fn test_max_updated_at_spans_tables() {
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let mut batch = TableBatch::new();
        batch.insert("users".into(), vec![Record::owned("a", t1)]);
        batch.insert("messages".into(), vec![Record::owned("a", t2)]);

        assert_eq!(max_updated_at(&batch), Some(t2));
        assert_eq!(record_count(&batch), 2);
        assert_eq!(max_updated_at(&TableBatch::new()), None);
    }
}
