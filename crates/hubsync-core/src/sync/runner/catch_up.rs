//! Catch-up requester
//!
//! Runs once per hub connection. Each page is applied like a pull's
//! forwards, which advances the persisted cursor, and the next request goes
//! out from the new cursor until the hub reports nothing more.

use tracing::{debug, error, info, warn};

use super::{HubStatus, Runner};
use crate::error::{SyncError, SyncResult};
use crate::record::record_count;
use crate::store::RecordStore;
use crate::sync::link::PeerLink;
use crate::sync::message::{AckBody, CatchUpRequest, ErrorKind, RequestBody};

impl<S: RecordStore + 'static> Runner<S> {
    /// Drain the hub's catch-up feed
    ///
    /// Returns the number of rows written. A `schema_mismatch` from the hub
    /// is recorded as the connection status and returned as an error.
    pub async fn catch_up(&self, link: &PeerLink) -> SyncResult<usize> {
        let settings = &self.shared.settings;
        self.set_status(HubStatus::CatchingUp);

        let mut applied = 0;
        let mut pages = 0;
        loop {
            let since = self.state().last_synced_from_hub;
            let request = CatchUpRequest {
                host_id: settings.host_id.clone(),
                schema_version: settings.schema_version,
                last_synced_from_hub: since,
            };
            debug!(since = %since, "Requesting catch-up page");

            let ack = link
                .request(RequestBody::CatchUp(request), settings.request_timeout)
                .await?;

            let response = match ack {
                AckBody::CatchUp(response) => response,
                AckBody::Error(payload) => {
                    return Err(match payload.error {
                        ErrorKind::SchemaMismatch => {
                            error!("Hub rejected schema version: {}", payload.message);
                            self.record_error(HubStatus::SchemaMismatch, payload.clone());
                            SyncError::Remote(payload)
                        }
                        _ => {
                            warn!("Hub failed catch-up ({}): {}", payload.error, payload.message);
                            self.record_error(HubStatus::InternalError, payload.clone());
                            SyncError::Remote(payload)
                        }
                    });
                }
                other => {
                    return Err(SyncError::Protocol(format!(
                        "unexpected ack to catch_up: {:?}",
                        other
                    )));
                }
            };

            pages += 1;
            applied += self.apply_forwarded(&response.tables)?;

            if !response.has_more {
                break;
            }
            if self.state().last_synced_from_hub <= since {
                return Err(SyncError::Protocol(format!(
                    "catch-up page of {} rows did not advance past {}",
                    record_count(&response.tables),
                    since
                )));
            }
        }

        info!(pages, records = applied, "Caught up with hub");
        Ok(applied)
    }
}
