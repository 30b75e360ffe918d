//! Pull responder
//!
//! Applies the forwards attached to a pull before reading the runner's own
//! changes, so a single round trip moves data both ways. Only rows stamped
//! with this runner's host id are ever reported upstream; forwarded rows
//! stay put, which keeps them from looping back through the hub.

use tracing::{debug, error, warn};

use super::{HubStatus, Runner};
use crate::error::{SyncError, SyncResult};
use crate::record::{max_updated_at, record_count, TableBatch};
use crate::store::{collect_page, HostFilter, RecordStore};
use crate::sync::message::{AckBody, ErrorKind, ErrorPayload, SyncRequest, SyncResponse};

impl<S: RecordStore + 'static> Runner<S> {
    /// Answer one hub pull
    pub fn handle_sync_request(&self, request: SyncRequest) -> AckBody {
        let settings = &self.shared.settings;

        if request.schema_version != settings.schema_version {
            let payload = SyncError::SchemaMismatch {
                local: settings.schema_version,
                remote: request.schema_version,
            }
            .to_payload();
            error!("Refusing pull: {}", payload.message);
            self.record_error(HubStatus::SchemaMismatch, payload.clone());
            return AckBody::Error(payload);
        }

        if let Some(forwards) = &request.forwards {
            if let Err(e) = self.apply_forwarded(forwards) {
                warn!("Failed to apply forwarded rows: {}", e);
                return AckBody::Error(ErrorPayload::new(ErrorKind::InternalError, e.to_string()));
            }
        }

        let page = match collect_page(
            self.shared.store.as_ref(),
            self.shared.tables.syncable(),
            request.since,
            HostFilter::Only(settings.host_id.clone()),
            settings.page_size,
        ) {
            Ok(page) => page,
            Err(e) => {
                warn!("Failed to read local changes: {}", e);
                return AckBody::Error(ErrorPayload::new(ErrorKind::InternalError, e.to_string()));
            }
        };

        debug!(
            since = %request.since,
            records = record_count(&page.tables),
            has_more = page.has_more,
            "Answering pull"
        );

        AckBody::Sync(SyncResponse {
            host_id: settings.host_id.clone(),
            has_more: page.has_more,
            tables: page.tables,
        })
    }

    /// Store rows the hub relayed from other runners
    ///
    /// Tables are applied in dependency order. Rows claiming this runner's
    /// host id, rows for tables that are not forwardable, and malformed rows
    /// are dropped. The catch-up cursor advances to the newest `updated_at`
    /// in the batch once everything is stored.
    ///
    /// Returns the number of rows written.
    pub fn apply_forwarded(&self, batch: &TableBatch) -> SyncResult<usize> {
        let host_id = self.shared.settings.host_id.as_str();
        let tables = &self.shared.tables;

        for (table, rows) in batch {
            if !rows.is_empty() && !tables.is_forwardable(table) {
                warn!(table = %table, rows = rows.len(), "Dropping forwards for non-forwardable table");
            }
        }

        let mut applied = 0;
        for spec in tables.forwardable() {
            let Some(rows) = batch.get(&spec.name) else {
                continue;
            };

            let mut accepted = Vec::with_capacity(rows.len());
            for row in rows {
                let mut record = row.clone();
                if let Err(e) = record.validate(spec) {
                    warn!(table = %spec.name, "Dropping malformed forwarded row: {}", e);
                    continue;
                }
                if record.host_id() == Some(host_id) {
                    warn!(table = %spec.name, "Dropping forwarded row owned by this runner");
                    continue;
                }
                accepted.push(record);
            }

            if !accepted.is_empty() {
                applied += self.shared.store.upsert(spec, &accepted)?;
            }
        }

        if let Some(max) = max_updated_at(batch) {
            self.advance_cursor(max)?;
        }
        if applied > 0 {
            debug!(records = applied, "Applied forwarded rows");
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, TimeZone, Utc};
    use serde_json::Value;

    use crate::record::{epoch, Record, TableBatch, Timestamp};
    use crate::storage::SqliteStore;
    use crate::store::{CursorRole, RecordStore};
    use crate::sync::message::{AckBody, ErrorKind, SyncRequest};
    use crate::sync::runner::{HubStatus, Runner, RunnerSettings};
    use crate::tables::SyncTables;

    fn at(minute: i64) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 9, 1, 0, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn runner(host: &str, page_size: usize) -> Runner<SqliteStore> {
        let tables = SyncTables::default();
        let store = Arc::new(SqliteStore::open_in_memory(tables.clone()).unwrap());
        let mut settings = RunnerSettings::new(host);
        settings.page_size = page_size;
        Runner::new(store, tables, settings).unwrap()
    }

    fn pull(since: Timestamp, forwards: Option<TableBatch>) -> SyncRequest {
        SyncRequest {
            schema_version: crate::tables::SCHEMA_VERSION,
            since,
            forwards,
        }
    }

    fn write(runner: &Runner<SqliteStore>, table: &str, rows: Vec<Record>) {
        let spec = runner.shared.tables.get(table).unwrap();
        runner.store().upsert(spec, &rows).unwrap();
    }

    #[test]
    fn test_reports_only_own_rows() {
        let runner = runner("b", 100);
        write(
            &runner,
            "users",
            vec![
                Record::owned("b", at(1)).with("id", "bob"),
                Record::owned("a", at(2)).with("id", "alice"),
            ],
        );
        write(&runner, "activity_log", vec![Record::owned("b", at(3)).with("seq", 1)]);

        let AckBody::Sync(resp) = runner.handle_sync_request(pull(epoch(), None)) else {
            panic!("expected sync response");
        };

        assert_eq!(resp.host_id, "b");
        assert!(!resp.has_more);
        assert_eq!(resp.tables["users"].len(), 1);
        assert_eq!(resp.tables["users"][0].host_id(), Some("b"));
        assert_eq!(resp.tables["activity_log"].len(), 1);
    }

    #[test]
    fn test_forwards_are_applied_but_not_echoed() {
        let runner = runner("b", 100);
        let mut forwards = TableBatch::new();
        forwards.insert("users".into(), vec![Record::owned("a", at(5)).with("id", "alice")]);

        let AckBody::Sync(resp) = runner.handle_sync_request(pull(epoch(), Some(forwards))) else {
            panic!("expected sync response");
        };

        assert!(resp.tables.is_empty());
        let alice = runner.store().get("users", &[Value::from("alice")]).unwrap();
        assert_eq!(alice.unwrap().host_id(), Some("a"));
        assert_eq!(runner.state().last_synced_from_hub, at(5));
        assert_eq!(
            runner.store().load_cursor(CursorRole::Runner, "hub").unwrap(),
            Some(at(5))
        );
    }

    #[test]
    fn test_forwarded_rows_claiming_own_host_are_dropped() {
        let runner = runner("b", 100);
        let mut forwards = TableBatch::new();
        forwards.insert(
            "users".into(),
            vec![
                Record::owned("b", at(1)).with("id", "spoofed"),
                Record::owned("a", at(2)).with("id", "alice"),
            ],
        );
        forwards.insert("activity_log".into(), vec![Record::owned("a", at(3)).with("seq", 1)]);

        let applied = runner.apply_forwarded(&forwards).unwrap();

        assert_eq!(applied, 1);
        assert!(runner.store().get("users", &[Value::from("spoofed")]).unwrap().is_none());
        assert_eq!(runner.store().count("activity_log").unwrap(), 0);
    }

    #[test]
    fn test_forward_cannot_take_over_a_row_owned_elsewhere() {
        let runner = runner("b", 100);
        write(
            &runner,
            "users",
            vec![Record::owned("b", at(1)).with("id", "bob").with("name", "Bob")],
        );
        let mut forwards = TableBatch::new();
        forwards.insert(
            "users".into(),
            vec![Record::owned("a", at(2)).with("id", "bob").with("name", "Mallory")],
        );

        let applied = runner.apply_forwarded(&forwards).unwrap();

        assert_eq!(applied, 0);
        let bob = runner.store().get("users", &[Value::from("bob")]).unwrap().unwrap();
        assert_eq!(bob.host_id(), Some("b"));
        assert_eq!(bob.get("name"), Some(&Value::from("Bob")));

        // Still reported upstream as this runner's own row
        let AckBody::Sync(resp) = runner.handle_sync_request(pull(epoch(), None)) else {
            panic!("expected sync response");
        };
        assert_eq!(resp.tables["users"].len(), 1);
        assert_eq!(resp.tables["users"][0].host_id(), Some("b"));
    }

    #[test]
    fn test_page_size_sets_has_more() {
        let runner = runner("b", 2);
        write(
            &runner,
            "users",
            (1..=3)
                .map(|i| Record::owned("b", at(i)).with("id", format!("u{i}")))
                .collect(),
        );

        let AckBody::Sync(first) = runner.handle_sync_request(pull(epoch(), None)) else {
            panic!("expected sync response");
        };
        assert!(first.has_more);
        assert_eq!(first.tables["users"].len(), 2);

        let AckBody::Sync(second) = runner.handle_sync_request(pull(at(2), None)) else {
            panic!("expected sync response");
        };
        assert!(!second.has_more);
        assert_eq!(second.tables["users"].len(), 1);
    }

    #[test]
    fn test_schema_mismatch_is_refused() {
        let runner = runner("b", 100);
        let mut request = pull(epoch(), None);
        request.schema_version += 1;

        let ack = runner.handle_sync_request(request);

        assert!(matches!(ack, AckBody::Error(ref e) if e.error == ErrorKind::SchemaMismatch));
        assert_eq!(runner.state().status, HubStatus::SchemaMismatch);
    }
}
