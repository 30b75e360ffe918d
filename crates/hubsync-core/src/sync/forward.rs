//! Hub-side forward queue
//!
//! One queue per connected runner, holding rows the hub has stored from
//! *other* runners and not yet delivered. The whole queue is drained onto the
//! next pull sent to that runner. A runner that disconnects loses its queue;
//! catch-up on reconnect redelivers anything it missed.
//!
//! Rows are appended without deduplication: delivery ends in an upsert keyed
//! by primary key, so duplicates are harmless.

use std::collections::HashMap;

use crate::record::{record_count, HostId, TableBatch};
use crate::tables::SyncTables;

#[derive(Debug, Default)]
pub struct ForwardQueue {
    queues: HashMap<HostId, TableBatch>,
}

impl ForwardQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a runner with an empty queue, discarding any previous one
    pub fn init_client(&mut self, host_id: &str) {
        self.queues.insert(host_id.to_string(), TableBatch::new());
    }

    pub fn remove_client(&mut self, host_id: &str) {
        self.queues.remove(host_id);
    }

    /// Append the forwardable part of `batch` to every registered runner's
    /// queue except the source's and any in `skip`
    ///
    /// Returns the number of runners the rows were queued for.
    pub fn enqueue_for_others(
        &mut self,
        source_host_id: &str,
        batch: &TableBatch,
        tables: &SyncTables,
        skip: &[&str],
    ) -> usize {
        let forwardable: Vec<_> = batch
            .iter()
            .filter(|(table, rows)| !rows.is_empty() && tables.is_forwardable(table))
            .collect();
        if forwardable.is_empty() {
            return 0;
        }

        let mut recipients = 0;
        for (host_id, queue) in self.queues.iter_mut() {
            if host_id == source_host_id || skip.contains(&host_id.as_str()) {
                continue;
            }
            for (table, rows) in &forwardable {
                queue
                    .entry((*table).clone())
                    .or_default()
                    .extend(rows.iter().cloned());
            }
            recipients += 1;
        }
        recipients
    }

    /// Take everything queued for a runner
    ///
    /// Returns `None` when nothing is pending. The runner stays registered.
    pub fn dequeue_for_client(&mut self, host_id: &str) -> Option<TableBatch> {
        let queue = self.queues.get_mut(host_id)?;
        if queue.values().all(Vec::is_empty) {
            return None;
        }
        Some(std::mem::take(queue))
    }

    /// Put undelivered rows back ahead of anything queued since
    pub fn requeue(&mut self, host_id: &str, batch: TableBatch) {
        let Some(queue) = self.queues.get_mut(host_id) else {
            return;
        };
        for (table, mut rows) in batch {
            let newer = queue.remove(&table).unwrap_or_default();
            rows.extend(newer);
            queue.insert(table, rows);
        }
    }

    /// Total queued records for a runner
    pub fn pending_count(&self, host_id: &str) -> usize {
        self.queues.get(host_id).map_or(0, record_count)
    }
}
