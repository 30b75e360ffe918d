//! Per-runner session state on the hub
//!
//! `Sessions` owns every connected runner's `ClientSyncState` together with
//! the forward queue. It is plain data guarded by the hub's mutex; nothing
//! in here awaits.
//!
//! Each connection gets a `ConnId`. Anything that outlives a single lock
//! (an in-flight pull, a disconnect handler) carries the id and is ignored
//! once the runner has reconnected under a newer one.

use std::collections::HashMap;

use serde::Serialize;

use crate::record::{HostId, TableBatch, Timestamp};
use crate::sync::forward::ForwardQueue;
use crate::sync::link::PeerLink;
use crate::sync::message::{ErrorPayload, SyncRequest};
use crate::tables::SyncTables;

/// Identifies one connection of a runner
pub type ConnId = u64;

/// Scheduler view of one connected runner
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientSyncState {
    /// Cursor sent with the next pull
    pub since: Timestamp,
    pub in_flight: bool,
    /// When the last pull was issued; `None` sorts before any time
    pub last_sync_time: Option<Timestamp>,
    /// Excluded from polling until catch-up is exhausted
    pub catching_up: bool,
    /// Terminal fault for this connection; excluded from polling while set
    pub sync_error: Option<ErrorPayload>,
}

impl ClientSyncState {
    fn new(since: Timestamp) -> Self {
        Self {
            since,
            in_flight: false,
            last_sync_time: None,
            catching_up: true,
            sync_error: None,
        }
    }

    fn is_eligible(&self) -> bool {
        !self.in_flight && !self.catching_up && self.sync_error.is_none()
    }
}

/// Operator-visible status of one connection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientStatus {
    pub host_id: HostId,
    pub conn_id: ConnId,
    #[serde(flatten)]
    pub state: ClientSyncState,
    pub pending_forwards: usize,
}

struct ClientSession {
    conn_id: ConnId,
    link: PeerLink,
    state: ClientSyncState,
}

/// Everything needed to send one pull
#[derive(Debug)]
pub struct PullTicket {
    pub conn_id: ConnId,
    pub link: PeerLink,
    pub request: SyncRequest,
}

#[derive(Default)]
pub struct Sessions {
    clients: HashMap<HostId, ClientSession>,
    forwards: ForwardQueue,
    next_conn_id: ConnId,
}

impl Sessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a runner connection, replacing any previous one
    ///
    /// Returns the new connection id and the link it replaced, if any.
    pub fn connect(
        &mut self,
        host_id: &str,
        link: PeerLink,
        since: Timestamp,
    ) -> (ConnId, Option<PeerLink>) {
        self.next_conn_id += 1;
        let conn_id = self.next_conn_id;
        let replaced = self.clients.insert(
            host_id.to_string(),
            ClientSession {
                conn_id,
                link,
                state: ClientSyncState::new(since),
            },
        );
        self.forwards.init_client(host_id);
        (conn_id, replaced.map(|s| s.link))
    }

    /// Forget a runner connection and its forward queue
    ///
    /// Returns false if the connection was already superseded.
    pub fn disconnect(&mut self, host_id: &str, conn_id: ConnId) -> bool {
        if !self.is_current(host_id, conn_id) {
            return false;
        }
        self.clients.remove(host_id);
        self.forwards.remove_client(host_id);
        true
    }

    pub fn is_current(&self, host_id: &str, conn_id: ConnId) -> bool {
        self.clients
            .get(host_id)
            .is_some_and(|s| s.conn_id == conn_id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn in_flight_count(&self) -> usize {
        self.clients.values().filter(|s| s.state.in_flight).count()
    }

    pub fn state(&self, host_id: &str) -> Option<&ClientSyncState> {
        self.clients.get(host_id).map(|s| &s.state)
    }

    /// Pick the eligible runner that was pulled least recently
    ///
    /// Returns `None` when `max_concurrent` pulls are already outstanding or
    /// no runner is eligible. Ties go to the lexically smaller host id.
    pub fn select_next(&self, max_concurrent: usize) -> Option<HostId> {
        if self.in_flight_count() >= max_concurrent {
            return None;
        }
        self.clients
            .iter()
            .filter(|(_, s)| s.state.is_eligible())
            .min_by(|(a_id, a), (b_id, b)| {
                a.state
                    .last_sync_time
                    .cmp(&b.state.last_sync_time)
                    .then_with(|| a_id.cmp(b_id))
            })
            .map(|(host_id, _)| host_id.clone())
    }

    /// Mark a pull as started and build its request
    ///
    /// Drains the runner's forward queue onto the request.
    pub fn begin_pull(
        &mut self,
        host_id: &str,
        now: Timestamp,
        schema_version: i64,
    ) -> Option<PullTicket> {
        let session = self.clients.get_mut(host_id)?;
        if session.state.sync_error.is_some() {
            return None;
        }
        session.state.in_flight = true;
        session.state.last_sync_time = Some(now);

        let forwards = self.forwards.dequeue_for_client(host_id);
        Some(PullTicket {
            conn_id: session.conn_id,
            link: session.link.clone(),
            request: SyncRequest {
                schema_version,
                since: session.state.since,
                forwards,
            },
        })
    }

    /// Clear in-flight accounting for a finished pull
    pub fn finish_pull(&mut self, host_id: &str, conn_id: ConnId) {
        if let Some(session) = self.current_mut(host_id, conn_id) {
            session.state.in_flight = false;
        }
    }

    /// Move the pull cursor forward; never backwards
    pub fn advance_since(&mut self, host_id: &str, conn_id: ConnId, since: Timestamp) {
        if let Some(session) = self.current_mut(host_id, conn_id) {
            session.state.since = session.state.since.max(since);
        }
    }

    /// Pin a terminal fault on a connection
    pub fn set_error(&mut self, host_id: &str, conn_id: ConnId, error: ErrorPayload) {
        if let Some(session) = self.current_mut(host_id, conn_id) {
            session.state.sync_error = Some(error);
            session.state.in_flight = false;
        }
    }

    /// Admit a runner into the poll rotation
    pub fn finish_catch_up(&mut self, host_id: &str, conn_id: ConnId) {
        if let Some(session) = self.current_mut(host_id, conn_id) {
            session.state.catching_up = false;
        }
    }

    /// Queue rows stored from `source` for every other healthy runner
    pub fn enqueue_for_others(
        &mut self,
        source_host_id: &str,
        batch: &TableBatch,
        tables: &SyncTables,
    ) -> usize {
        // Errored runners are never pulled, so their queues would only grow
        let errored: Vec<&str> = self
            .clients
            .iter()
            .filter(|(_, s)| s.state.sync_error.is_some())
            .map(|(host_id, _)| host_id.as_str())
            .collect();
        self.forwards
            .enqueue_for_others(source_host_id, batch, tables, &errored)
    }

    /// Return undelivered forwards to a still-connected runner's queue
    pub fn requeue(&mut self, host_id: &str, conn_id: ConnId, batch: TableBatch) {
        if self.is_current(host_id, conn_id) {
            self.forwards.requeue(host_id, batch);
        }
    }

    pub fn pending_forwards(&self, host_id: &str) -> usize {
        self.forwards.pending_count(host_id)
    }

    /// Status of every connection, sorted by host id
    pub fn snapshot(&self) -> Vec<ClientStatus> {
        let mut statuses: Vec<_> = self
            .clients
            .iter()
            .map(|(host_id, s)| ClientStatus {
                host_id: host_id.clone(),
                conn_id: s.conn_id,
                state: s.state.clone(),
                pending_forwards: self.forwards.pending_count(host_id),
            })
            .collect();
        statuses.sort_by(|a, b| a.host_id.cmp(&b.host_id));
        statuses
    }

    fn current_mut(&mut self, host_id: &str, conn_id: ConnId) -> Option<&mut ClientSession> {
        self.clients
            .get_mut(host_id)
            .filter(|s| s.conn_id == conn_id)
    }
}
