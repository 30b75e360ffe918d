//! Runner side of replication
//!
//! A runner owns the rows stamped with its host id. It answers the hub's
//! pulls with those rows, applies whatever the hub forwards from other
//! runners, and drains catch-up after every (re)connect before it lets the
//! hub poll it.

mod catch_up;
mod client;
mod responder;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::record::{epoch, HostId, Timestamp};
use crate::storage::StorageResult;
use crate::store::{CursorRole, RecordStore};
use crate::sync::link::{Inbound, PeerLink};
use crate::sync::message::{AckBody, Envelope, ErrorKind, ErrorPayload, PushBody, RequestBody};
use crate::tables::SyncTables;

pub use client::{spawn_runner_client, RunnerClientConfig, RunnerClientHandle, RunnerCommand};

/// Runner's view of its hub connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HubStatus {
    Disconnected,
    CatchingUp,
    Connected,
    /// Versions differ; no further attempts until upgraded
    SchemaMismatch,
    /// Last catch-up failed on the hub; retried on the next connection
    InternalError,
    /// Sync switched off or shut down
    Disabled,
}

impl HubStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HubStatus::Disconnected => "disconnected",
            HubStatus::CatchingUp => "catching_up",
            HubStatus::Connected => "connected",
            HubStatus::SchemaMismatch => "schema_mismatch",
            HubStatus::InternalError => "internal_error",
            HubStatus::Disabled => "disabled",
        }
    }
}

impl std::fmt::Display for HubStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HubSyncState {
    pub status: HubStatus,
    /// Catch-up cursor; mirrors the persisted runner cursor
    pub last_synced_from_hub: Timestamp,
    pub last_error: Option<ErrorPayload>,
}

/// Runner tuning knobs
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub host_id: HostId,
    /// Peer id the catch-up cursor is stored under
    pub hub_id: String,
    pub schema_version: i64,
    /// Rows per pull response
    pub page_size: usize,
    /// How long to wait for a catch-up ack
    pub request_timeout: Duration,
}

impl RunnerSettings {
    pub fn new(host_id: impl Into<HostId>) -> Self {
        Self {
            host_id: host_id.into(),
            hub_id: "hub".to_string(),
            schema_version: crate::tables::SCHEMA_VERSION,
            page_size: 1000,
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Settings for the configured host, with the hub URL as cursor peer id
    pub fn from_config(config: &Config, host_id: impl Into<HostId>) -> Self {
        Self {
            host_id: host_id.into(),
            hub_id: config
                .runner
                .hub_url
                .clone()
                .unwrap_or_else(|| "hub".to_string()),
            schema_version: config.schema_version,
            page_size: config.page_size.max(1),
            request_timeout: Duration::from_millis(config.hub.request_timeout_ms.max(1)),
        }
    }
}

/// How a hub session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Connection dropped; reconnect later
    Closed,
    /// Versions differ; do not reconnect
    SchemaMismatch,
}

struct RunnerShared<S> {
    store: Arc<S>,
    tables: SyncTables,
    settings: RunnerSettings,
    state: watch::Sender<HubSyncState>,
}

/// One runner's replication endpoint
pub struct Runner<S> {
    shared: Arc<RunnerShared<S>>,
}

impl<S> Clone for Runner<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: RecordStore + 'static> Runner<S> {
    /// Create a runner, resuming from its persisted catch-up cursor
    pub fn new(store: Arc<S>, tables: SyncTables, settings: RunnerSettings) -> StorageResult<Self> {
        let cursor = store
            .load_cursor(CursorRole::Runner, &settings.hub_id)?
            .unwrap_or_else(epoch);
        let (state, _) = watch::channel(HubSyncState {
            status: HubStatus::Disconnected,
            last_synced_from_hub: cursor,
            last_error: None,
        });

        Ok(Self {
            shared: Arc::new(RunnerShared {
                store,
                tables,
                settings,
                state,
            }),
        })
    }

    pub fn host_id(&self) -> &str {
        &self.shared.settings.host_id
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.shared.settings
    }

    pub fn store(&self) -> &Arc<S> {
        &self.shared.store
    }

    pub fn state(&self) -> HubSyncState {
        self.shared.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<HubSyncState> {
        self.shared.state.subscribe()
    }

    pub fn set_status(&self, status: HubStatus) {
        self.shared.state.send_if_modified(|state| {
            let changed = state.status != status;
            state.status = status;
            changed
        });
    }

    fn record_error(&self, status: HubStatus, payload: ErrorPayload) {
        self.shared.state.send_modify(|state| {
            state.status = status;
            state.last_error = Some(payload);
        });
    }

    /// Serve one hub connection
    ///
    /// Drains catch-up, then answers pulls until the hub goes away.
    pub async fn run_session(
        &self,
        link: PeerLink,
        mut inbound: mpsc::UnboundedReceiver<Envelope>,
    ) -> SessionEnd {
        let dispatcher = {
            let runner = self.clone();
            let link = link.clone();
            tokio::spawn(async move {
                while let Some(envelope) = inbound.recv().await {
                    match link.resolve(envelope) {
                        Some(Inbound::Request { id, body }) => {
                            let ack = runner.handle_request(body);
                            if link.reply(id, ack).is_err() {
                                break;
                            }
                        }
                        Some(Inbound::Push(body)) => runner.handle_push(body),
                        None => {}
                    }
                }
                link.close();
            })
        };

        match self.catch_up(&link).await {
            Ok(records) => {
                info!(records, "Catch-up complete");
                self.set_status(HubStatus::Connected);
            }
            Err(e) if e.kind() == ErrorKind::SchemaMismatch => {
                error!("Hub refused catch-up: {}", e);
                link.close();
            }
            Err(e) => {
                warn!("Catch-up failed, will retry on next connection: {}", e);
                link.close();
            }
        }

        dispatcher.await.ok();

        if self.state().status == HubStatus::SchemaMismatch {
            SessionEnd::SchemaMismatch
        } else {
            if self.state().status != HubStatus::InternalError {
                self.set_status(HubStatus::Disconnected);
            }
            SessionEnd::Closed
        }
    }

    /// Answer a hub-initiated request
    pub fn handle_request(&self, body: RequestBody) -> AckBody {
        match body {
            RequestBody::SyncRequest(request) => self.handle_sync_request(request),
            RequestBody::CatchUp(_) => {
                warn!("Hub sent a catch_up request to a runner");
                AckBody::Error(ErrorPayload::new(
                    ErrorKind::InternalError,
                    "catch_up is only served by the hub",
                ))
            }
        }
    }

    /// Record an error the hub pushed for this connection
    pub fn handle_push(&self, body: PushBody) {
        match body {
            PushBody::SyncError(payload) => {
                error!(
                    host_id = %self.shared.settings.host_id,
                    "Hub reported {}: {}", payload.error, payload.message
                );
                self.shared.state.send_modify(|state| {
                    state.last_error = Some(payload);
                });
            }
        }
    }

    /// Persist and publish a new catch-up cursor; never moves backwards
    fn advance_cursor(&self, cursor: Timestamp) -> StorageResult<()> {
        let current = self.shared.state.borrow().last_synced_from_hub;
        if cursor <= current {
            return Ok(());
        }
        self.shared
            .store
            .save_cursor(CursorRole::Runner, &self.shared.settings.hub_id, &cursor)?;
        self.shared.state.send_modify(|state| {
            state.last_synced_from_hub = state.last_synced_from_hub.max(cursor);
        });
        debug!(cursor = %cursor, "Advanced hub cursor");
        Ok(())
    }
}
