//! Hub side of replication
//!
//! The hub never originates rows. It pulls each runner's own changes on a
//! fixed tick, stores them, and forwards them to every other runner, either
//! piggybacked on the next pull or through catch-up after a reconnect.
//!
//! ## Lifecycle of a runner connection
//!
//! 1. `client_connected`: session created with `catching_up = true` and the
//!    persisted cursor for that runner as `since`
//! 2. runner drains `catch_up` pages until `has_more = false`
//! 3. runner joins the poll rotation (`tick`)
//! 4. `client_disconnected`: session and forward queue are dropped

mod catch_up;
mod scheduler;
mod server;
mod session;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::record::{epoch, HostId};
use crate::store::{CursorRole, RecordStore};
use crate::sync::link::{Inbound, PeerLink};
use crate::sync::message::{AckBody, Envelope, ErrorKind, ErrorPayload, RequestBody};
use crate::tables::SyncTables;

pub use scheduler::PullOutcome;
pub use server::HubServer;
pub use session::{ClientStatus, ClientSyncState, ConnId, PullTicket, Sessions};

/// Hub tuning knobs
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub schema_version: i64,
    pub max_concurrent_requests: usize,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    /// Rows per catch-up page
    pub page_size: usize,
    /// Follow-up pulls allowed per selection while a runner reports `has_more`
    pub max_drain_pages: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            schema_version: crate::tables::SCHEMA_VERSION,
            max_concurrent_requests: 3,
            poll_interval: Duration::from_millis(1000),
            request_timeout: Duration::from_secs(30),
            page_size: 1000,
            max_drain_pages: 16,
        }
    }
}

impl HubSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            schema_version: config.schema_version,
            max_concurrent_requests: config.hub.max_concurrent_requests.max(1),
            poll_interval: Duration::from_millis(config.hub.poll_interval_ms.max(1)),
            request_timeout: Duration::from_millis(config.hub.request_timeout_ms.max(1)),
            page_size: config.page_size.max(1),
            max_drain_pages: config.hub.max_drain_pages.max(1),
        }
    }
}

struct HubShared<S> {
    store: Arc<S>,
    tables: SyncTables,
    settings: HubSettings,
    sessions: Mutex<Sessions>,
}

/// The central relay
pub struct Hub<S> {
    shared: Arc<HubShared<S>>,
}

impl<S> Clone for Hub<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: RecordStore + 'static> Hub<S> {
    pub fn new(store: Arc<S>, tables: SyncTables, settings: HubSettings) -> Self {
        Self {
            shared: Arc::new(HubShared {
                store,
                tables,
                settings,
                sessions: Mutex::new(Sessions::new()),
            }),
        }
    }

    pub fn settings(&self) -> &HubSettings {
        &self.shared.settings
    }

    pub fn store(&self) -> &Arc<S> {
        &self.shared.store
    }

    /// Register a runner connection
    ///
    /// The new session starts in catch-up and resumes pulling from the
    /// cursor persisted for this runner.
    pub fn client_connected(&self, host_id: &str, link: PeerLink) -> ConnId {
        let since = match self.shared.store.load_cursor(CursorRole::Hub, host_id) {
            Ok(cursor) => cursor.unwrap_or_else(epoch),
            Err(e) => {
                warn!(host_id, "Failed to load cursor, pulling from epoch: {}", e);
                epoch()
            }
        };

        let (conn_id, replaced) = self.sessions().connect(host_id, link, since);
        if let Some(old) = replaced {
            info!(host_id, "Runner reconnected, dropping previous connection");
            old.close();
        }
        info!(host_id, conn_id, since = %since, "Runner connected");
        conn_id
    }

    /// Drop a runner connection with its in-flight accounting and forward queue
    pub fn client_disconnected(&self, host_id: &str, conn_id: ConnId) {
        if self.sessions().disconnect(host_id, conn_id) {
            info!(host_id, conn_id, "Runner disconnected");
        }
    }

    /// Serve one runner connection until its inbound stream ends
    pub async fn serve_connection(
        &self,
        host_id: HostId,
        link: PeerLink,
        mut inbound: mpsc::UnboundedReceiver<Envelope>,
    ) {
        let conn_id = self.client_connected(&host_id, link.clone());

        while let Some(envelope) = inbound.recv().await {
            match link.resolve(envelope) {
                Some(Inbound::Request { id, body }) => {
                    let ack = self.handle_request(&host_id, conn_id, body);
                    if link.reply(id, ack).is_err() {
                        break;
                    }
                }
                Some(Inbound::Push(body)) => {
                    debug!(host_id = %host_id, "Ignoring push from runner: {:?}", body);
                }
                None => {}
            }
        }

        link.close();
        self.client_disconnected(&host_id, conn_id);
    }

    /// Answer a runner-initiated request
    pub fn handle_request(&self, host_id: &str, conn_id: ConnId, body: RequestBody) -> AckBody {
        match body {
            RequestBody::CatchUp(request) => self.handle_catch_up(host_id, conn_id, request),
            RequestBody::SyncRequest(_) => {
                warn!(host_id, "Runner sent a sync_request to the hub");
                AckBody::Error(ErrorPayload::new(
                    ErrorKind::InternalError,
                    "sync_request is only sent by the hub",
                ))
            }
        }
    }

    /// Status of every connected runner
    pub fn snapshot(&self) -> Vec<ClientStatus> {
        self.sessions().snapshot()
    }

    /// Records waiting to be forwarded to a runner
    pub fn pending_forwards(&self, host_id: &str) -> usize {
        self.sessions().pending_forwards(host_id)
    }

    fn sessions(&self) -> MutexGuard<'_, Sessions> {
        self.shared
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}
