//! Catch-up handler
//!
//! Serves a reconnecting runner everything it missed: every forwardable row
//! changed after the runner's cursor that the runner does not own, one page
//! per request. The last page (`has_more = false`) admits the runner into
//! the poll rotation.

use tracing::{debug, error, info, warn};

use super::{ConnId, Hub};
use crate::error::SyncError;
use crate::record::record_count;
use crate::store::{collect_page, HostFilter, RecordStore};
use crate::sync::message::{AckBody, CatchUpRequest, CatchUpResponse, ErrorKind, ErrorPayload};

impl<S: RecordStore + 'static> Hub<S> {
    pub(super) fn handle_catch_up(
        &self,
        host_id: &str,
        conn_id: ConnId,
        request: CatchUpRequest,
    ) -> AckBody {
        if request.host_id != host_id {
            warn!(
                host_id,
                claimed = %request.host_id,
                "Rejecting catch-up for a different host"
            );
            return AckBody::Error(ErrorPayload::new(
                ErrorKind::OwnershipViolation,
                format!(
                    "connection belongs to '{}', catch-up claimed '{}'",
                    host_id, request.host_id
                ),
            ));
        }

        let local = self.shared.settings.schema_version;
        if request.schema_version != local {
            let payload = SyncError::SchemaMismatch {
                local,
                remote: request.schema_version,
            }
            .to_payload();
            error!(host_id, "Schema mismatch during catch-up: {}", payload.message);
            self.sessions().set_error(host_id, conn_id, payload.clone());
            return AckBody::Error(payload);
        }

        let page = match collect_page(
            self.shared.store.as_ref(),
            self.shared.tables.forwardable(),
            request.last_synced_from_hub,
            HostFilter::Excluding(host_id.to_string()),
            self.shared.settings.page_size,
        ) {
            Ok(page) => page,
            Err(e) => {
                warn!(host_id, "Catch-up query failed: {}", e);
                return AckBody::Error(ErrorPayload::new(ErrorKind::InternalError, e.to_string()));
            }
        };

        debug!(
            host_id,
            since = %request.last_synced_from_hub,
            records = record_count(&page.tables),
            has_more = page.has_more,
            "Serving catch-up page"
        );

        if !page.has_more {
            self.sessions().finish_catch_up(host_id, conn_id);
            info!(host_id, "Catch-up complete, runner joins poll rotation");
        }

        AckBody::CatchUp(CatchUpResponse {
            has_more: page.has_more,
            tables: page.tables,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, TimeZone, Utc};

    use crate::record::{epoch, Record, Timestamp};
    use crate::storage::SqliteStore;
    use crate::store::RecordStore;
    use crate::sync::hub::{Hub, HubSettings};
    use crate::sync::link::memory_pair;
    use crate::sync::message::{AckBody, CatchUpRequest, ErrorKind};
    use crate::tables::SyncTables;

    fn at(minute: i64) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn hub(page_size: usize) -> Hub<SqliteStore> {
        let tables = SyncTables::default();
        let store = Arc::new(SqliteStore::open_in_memory(tables.clone()).unwrap());
        let users = tables.get("users").unwrap();
        let log = tables.get("activity_log").unwrap();
        store
            .upsert(
                users,
                &[
                    Record::owned("a", at(1)).with("id", "alice"),
                    Record::owned("c", at(2)).with("id", "carol"),
                    Record::owned("b", at(3)).with("id", "bob"),
                ],
            )
            .unwrap();
        store
            .upsert(log, &[Record::owned("a", at(4)).with("seq", 1)])
            .unwrap();

        let settings = HubSettings {
            page_size,
            ..HubSettings::default()
        };
        Hub::new(store, tables, settings)
    }

    fn request(host: &str, since: Timestamp) -> CatchUpRequest {
        CatchUpRequest {
            host_id: host.into(),
            schema_version: crate::tables::SCHEMA_VERSION,
            last_synced_from_hub: since,
        }
    }

    #[test]
    fn test_catch_up_excludes_own_rows_and_log_tables() {
        let hub = hub(100);
        let ((link, _rx), _) = memory_pair();
        let conn = hub.client_connected("b", link);

        let AckBody::CatchUp(resp) = hub.handle_catch_up("b", conn, request("b", epoch())) else {
            panic!("expected catch-up page");
        };

        assert!(!resp.has_more);
        assert!(!resp.tables.contains_key("activity_log"));
        let hosts: Vec<_> = resp.tables["users"].iter().map(|r| r.host_id().unwrap()).collect();
        assert_eq!(hosts, vec!["a", "c"]);
        assert!(!hub.snapshot()[0].state.catching_up);
    }

    #[test]
    fn test_runner_stays_gated_until_last_page() {
        let hub = hub(1);
        let ((link, _rx), _) = memory_pair();
        let conn = hub.client_connected("b", link);

        let AckBody::CatchUp(first) = hub.handle_catch_up("b", conn, request("b", epoch())) else {
            panic!("expected catch-up page");
        };
        assert!(first.has_more);
        assert!(hub.snapshot()[0].state.catching_up);

        let AckBody::CatchUp(second) = hub.handle_catch_up("b", conn, request("b", at(1))) else {
            panic!("expected catch-up page");
        };
        assert!(!second.has_more);
        assert_eq!(second.tables["users"][0].host_id(), Some("c"));
        assert!(!hub.snapshot()[0].state.catching_up);
    }

    #[test]
    fn test_impersonation_is_rejected_without_state_change() {
        let hub = hub(100);
        let ((link, _rx), _) = memory_pair();
        let conn = hub.client_connected("b", link);

        let ack = hub.handle_catch_up("b", conn, request("a", epoch()));

        assert!(matches!(ack, AckBody::Error(ref e) if e.error == ErrorKind::OwnershipViolation));
        let status = &hub.snapshot()[0];
        assert!(status.state.catching_up);
        assert!(status.state.sync_error.is_none());
    }

    #[test]
    fn test_schema_mismatch_pins_runner() {
        let hub = hub(100);
        let ((link, _rx), _) = memory_pair();
        let conn = hub.client_connected("b", link);

        let mut req = request("b", epoch());
        req.schema_version += 1;
        let ack = hub.handle_catch_up("b", conn, req);

        assert!(matches!(ack, AckBody::Error(ref e) if e.error == ErrorKind::SchemaMismatch));
        let status = &hub.snapshot()[0];
        assert_eq!(
            status.state.sync_error.as_ref().map(|e| e.error),
            Some(ErrorKind::SchemaMismatch)
        );
    }
}
