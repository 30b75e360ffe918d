//! Hub sync scheduler
//!
//! A single timer drives `tick`. Each tick starts at most one pull: the
//! eligible runner with the oldest `last_sync_time`, provided fewer than
//! `max_concurrent_requests` pulls are outstanding. The pull itself runs in
//! its own task so the tick loop never waits on a runner.
//!
//! While a runner answers `has_more = true` the same task immediately sends
//! a follow-up pull, up to `max_drain_pages` per selection, after which the
//! runner goes back into the rotation.

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{ConnId, Hub, PullTicket};
use crate::error::{SyncError, SyncResult};
use crate::record::{max_updated_at, record_count, TableBatch};
use crate::store::{CursorRole, RecordStore};
use crate::sync::link::LinkError;
use crate::sync::message::{
    AckBody, ErrorKind, ErrorPayload, PushBody, RequestBody, SyncResponse,
};

/// How one pull ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    /// Rows stored; `more` is true if the drain cap cut the backlog short
    Synced { pages: usize, records: usize, more: bool },
    /// Transport gone or timed out; treated as a disconnect
    Disconnected,
    /// Runner answered with a transient error
    Transient(String),
    /// Connection pinned with a terminal error
    Failed(ErrorKind),
}

impl<S: RecordStore + 'static> Hub<S> {
    /// Run the scheduler until `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.shared.settings.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            interval_ms = self.shared.settings.poll_interval.as_millis() as u64,
            max_concurrent = self.shared.settings.max_concurrent_requests,
            "Sync scheduler started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Sync scheduler stopped");
    }

    /// One scheduler step
    ///
    /// Returns the handle of the pull it started, if any.
    pub fn tick(&self) -> Option<JoinHandle<PullOutcome>> {
        let (host_id, ticket) = {
            let mut sessions = self.sessions();
            let host_id = sessions.select_next(self.shared.settings.max_concurrent_requests)?;
            let ticket =
                sessions.begin_pull(&host_id, Utc::now(), self.shared.settings.schema_version)?;
            (host_id, ticket)
        };

        let hub = self.clone();
        Some(tokio::spawn(async move { hub.pull(host_id, ticket).await }))
    }

    /// Pull from one runner, draining while it reports more data
    async fn pull(&self, host_id: String, mut ticket: PullTicket) -> PullOutcome {
        let conn_id = ticket.conn_id;
        let max_pages = self.shared.settings.max_drain_pages;
        let mut pages = 0;
        let mut records = 0;

        let outcome = loop {
            let forwards = ticket.request.forwards.clone();
            debug!(
                host_id = %host_id,
                since = %ticket.request.since,
                forwards = forwards.as_ref().map_or(0, record_count),
                "Sending pull"
            );

            let ack = ticket
                .link
                .request(
                    RequestBody::SyncRequest(ticket.request.clone()),
                    self.shared.settings.request_timeout,
                )
                .await;

            let response = match ack {
                Ok(AckBody::Sync(response)) => response,
                Ok(AckBody::Error(payload)) => {
                    break self.runner_error(&host_id, conn_id, payload, forwards);
                }
                Ok(other) => {
                    warn!(host_id = %host_id, "Dropping unexpected ack to pull: {:?}", other);
                    break PullOutcome::Transient("unexpected ack".to_string());
                }
                Err(LinkError::Timeout(after)) => {
                    // An ack that never arrives counts as a disconnect
                    warn!(host_id = %host_id, "Pull timed out after {:?}, dropping connection", after);
                    ticket.link.close();
                    break PullOutcome::Disconnected;
                }
                Err(LinkError::Disconnected) => {
                    debug!(host_id = %host_id, "Runner went away during pull");
                    break PullOutcome::Disconnected;
                }
            };

            let received = record_count(&response.tables);
            let has_more = response.has_more;
            match self.ingest(&host_id, conn_id, response) {
                Ok(()) => {
                    pages += 1;
                    records += received;
                }
                Err(err @ SyncError::OwnershipViolation { .. }) => {
                    error!(host_id = %host_id, "Rejecting batch: {}", err);
                    let payload = err.to_payload();
                    let _ = ticket.link.push(PushBody::SyncError(payload.clone()));
                    self.sessions().set_error(&host_id, conn_id, payload);
                    break PullOutcome::Failed(ErrorKind::OwnershipViolation);
                }
                Err(err) => {
                    warn!(host_id = %host_id, "Dropping batch: {}", err);
                    break PullOutcome::Transient(err.to_string());
                }
            }

            if !has_more {
                break PullOutcome::Synced { pages, records, more: false };
            }
            if pages >= max_pages {
                debug!(host_id = %host_id, pages, "Drain cap reached, yielding to other runners");
                break PullOutcome::Synced { pages, records, more: true };
            }

            let next = self.sessions().begin_pull(
                &host_id,
                Utc::now(),
                self.shared.settings.schema_version,
            );
            match next {
                Some(next) if next.conn_id == conn_id => ticket = next,
                _ => break PullOutcome::Disconnected,
            }
        };

        self.sessions().finish_pull(&host_id, conn_id);
        if let PullOutcome::Synced { records, .. } = &outcome {
            if *records > 0 {
                info!(host_id = %host_id, records, "Pulled changes from runner");
            }
        }
        outcome
    }

    /// Handle a typed error ack from a runner
    fn runner_error(
        &self,
        host_id: &str,
        conn_id: ConnId,
        payload: ErrorPayload,
        forwards: Option<TableBatch>,
    ) -> PullOutcome {
        match payload.error {
            ErrorKind::SchemaMismatch | ErrorKind::OwnershipViolation => {
                error!(host_id, "Runner refused pull ({}): {}", payload.error, payload.message);
                let kind = payload.error;
                self.sessions().set_error(host_id, conn_id, payload);
                PullOutcome::Failed(kind)
            }
            ErrorKind::InternalError => {
                warn!(host_id, "Runner failed pull: {}", payload.message);
                // The runner may not have applied the forwards it was sent
                if let Some(forwards) = forwards {
                    self.sessions().requeue(host_id, conn_id, forwards);
                }
                PullOutcome::Transient(payload.message)
            }
        }
    }

    /// Store a runner's pull response and forward it to everyone else
    ///
    /// The whole batch is refused if any record is malformed or owned by a
    /// host other than the one that sent it.
    fn ingest(&self, host_id: &str, conn_id: ConnId, response: SyncResponse) -> SyncResult<()> {
        let tables = &self.shared.tables;

        if response.host_id != host_id {
            return Err(SyncError::OwnershipViolation {
                table: "*".to_string(),
                expected: host_id.to_string(),
                found: response.host_id,
            });
        }

        let mut batch = response.tables;
        for (table, rows) in batch.iter_mut() {
            let spec = tables
                .get(table)
                .ok_or_else(|| SyncError::Protocol(format!("unknown table '{}'", table)))?;
            for record in rows.iter_mut() {
                record
                    .validate(spec)
                    .map_err(|e| SyncError::Protocol(e.to_string()))?;
                let owner = record.host_id().unwrap_or_default();
                if owner != host_id {
                    return Err(SyncError::OwnershipViolation {
                        table: table.clone(),
                        expected: host_id.to_string(),
                        found: owner.to_string(),
                    });
                }
                // A key already owned by another host cannot be claimed
                if let Some(stored) = self.shared.store.stored_owner(spec, record)? {
                    if stored != host_id {
                        return Err(SyncError::OwnershipViolation {
                            table: table.clone(),
                            expected: host_id.to_string(),
                            found: stored,
                        });
                    }
                }
            }
        }
        batch.retain(|_, rows| !rows.is_empty());
        if batch.is_empty() {
            return Ok(());
        }

        for spec in tables.syncable() {
            if let Some(rows) = batch.get(&spec.name) {
                self.shared.store.upsert(spec, rows)?;
            }
        }

        if let Some(max) = max_updated_at(&batch) {
            self.shared.store.save_cursor(CursorRole::Hub, host_id, &max)?;
            self.sessions().advance_since(host_id, conn_id, max);
        }

        let recipients = self.sessions().enqueue_for_others(host_id, &batch, tables);
        debug!(
            host_id,
            records = record_count(&batch),
            recipients,
            "Stored runner batch"
        );
        Ok(())
    }
}
