//! Retiring cells: flushes, background saves, and record destruction.
//!
//! A cell leaves memory in two steps. Retirement (levels.rs) strips its
//! slots and queues it here; the unload sweep then writes whatever content
//! survives and destroys the record once the write lands. Reclaims can
//! interrupt the process at any point before destruction, and a failed
//! write puts the cell back in line rather than dropping data.

use std::collections::HashMap;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, info, trace};

use crate::cell::CellPos;
use crate::error::StoreError;
use crate::queue::CellTask;
use crate::store::SavedCell;

use super::commands::{Command, TickReport};
use super::core::{Orchestrator, GENERATION_WORKER, MAINTENANCE_WORKER};
use super::levels::ResidencyRules;

/// What [`Orchestrator::begin_flush`] did.
enum FlushStart {
    /// A write task is now in the maintenance lane.
    Started,
    /// An earlier write is still in flight; its completion finishes the job.
    InFlight,
    /// Nothing worth writing.
    Skip(&'static str),
}

impl Orchestrator {
    // =========================================================================
    // Unload sweep
    // =========================================================================

    /// Works through `unload_order` under the per-tick budget. Cells with
    /// unsaved content get a flush; clean or empty cells are destroyed on
    /// the spot.
    pub(crate) fn run_unload_sweep(&mut self, report: &mut TickReport) {
        let mut remaining = self.config.unload_budget;
        while remaining > 0 {
            let Some(node) = self.unload_order.pop_front() else {
                break;
            };
            if !self.pending_unload.contains(&node) {
                // Reclaimed while waiting its turn.
                continue;
            }
            let cell = CellPos::from_key(node);
            match self.begin_flush(cell) {
                FlushStart::Started => {
                    remaining -= 1;
                    report.flushes_started += 1;
                }
                FlushStart::InFlight => {}
                FlushStart::Skip(reason) => {
                    remaining -= 1;
                    self.destroy_record(node, reason);
                }
            }
        }
    }

    /// Submits a write of the record's current content to the maintenance
    /// lane. At most one write per cell is ever in flight; the store relies
    /// on that.
    fn begin_flush(&mut self, cell: CellPos) -> FlushStart {
        let node = cell.key();
        let Some(rec) = self.records.get_mut(&node) else {
            return FlushStart::Skip("no record");
        };
        if rec.flush.is_some() {
            return FlushStart::InFlight;
        }
        if !rec.accessed_since_save {
            return FlushStart::Skip("already saved");
        }
        let Some(snapshot) = rec.save_snapshot() else {
            return FlushStart::Skip("no content");
        };
        // Clean as of this snapshot. Content arriving while the write is in
        // flight dirties the record again and is picked up by a later save.
        rec.accessed_since_save = false;
        let epoch = rec.epoch;
        let band = rec.band;
        let store = Arc::clone(&self.store);
        let to_core = self.self_tx.clone();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        rec.flush = Some(done_rx.map(|r| r.unwrap_or(false)).boxed().shared());

        let task: CellTask = Box::new(move || {
            async move {
                let result = store.write(cell, snapshot).await;
                let _ = done_tx.send(result.is_ok());
                let _ = to_core.send(Command::FlushFinished { cell, epoch, result });
            }
            .boxed()
        });
        self.sorter.submit(MAINTENANCE_WORKER, node, band, task);
        trace!(cell = %cell, "flush submitted");
        FlushStart::Started
    }

    /// A flush write settled. On success the record is clean and, if still
    /// pending unload with nothing newer waiting, destroyed; on failure it
    /// goes back in line.
    pub(crate) fn handle_flush_finished(
        &mut self,
        cell: CellPos,
        epoch: u64,
        result: Result<(), StoreError>,
    ) {
        let node = cell.key();
        let now = self.now;
        let dirty_again;
        {
            let Some(rec) = self.records.get_mut(&node) else {
                trace!(cell = %cell, "flush completion for a destroyed record dropped");
                return;
            };
            if rec.epoch != epoch {
                trace!(cell = %cell, "flush completion from a previous residency dropped");
                return;
            }
            rec.flush = None;
            match result {
                Ok(()) => {
                    rec.last_save_tick = Some(now);
                    dirty_again = rec.accessed_since_save;
                    self.stats.record_save_completed();
                    trace!(cell = %cell, "cell saved");
                }
                Err(err) => {
                    // The snapshot never landed; the record is dirty again.
                    rec.accessed_since_save = true;
                    self.stats.record_save_failure();
                    error!(cell = %cell, error = %err, "cell save failed");
                    if self.pending_unload.contains(&node) {
                        // Content stays resident until a write lands; try
                        // again on a later sweep.
                        self.unload_order.push_back(node);
                    } else if !rec.in_dirty_queue {
                        rec.in_dirty_queue = true;
                        self.dirty_queue.push_back(node);
                    }
                    return;
                }
            }
        }
        if self.pending_unload.contains(&node) {
            if dirty_again {
                // The write that just landed snapshots older content; the
                // cell goes back in line so a later sweep flushes the rest.
                self.unload_order.push_back(node);
            } else {
                self.destroy_record(node, "flushed");
            }
        }
    }

    /// Removes the record and everything attached to it. In-flight batches
    /// hold cancelled tokens and land as no-ops; their completions fail the
    /// epoch check.
    pub(crate) fn destroy_record(&mut self, node: u64, reason: &'static str) {
        self.pending_unload.remove(&node);
        let Some(rec) = self.records.remove(&node) else {
            return;
        };
        rec.cancel_root.cancel();
        for k in 0..self.config.plan.stage_count() {
            self.pending_drivers.remove(&(node, k as u8));
        }
        // Full clear only after the tokens are cancelled, so anything the
        // queues still hold is inert.
        self.sorter.release(GENERATION_WORKER, node, true);
        self.sorter.release(MAINTENANCE_WORKER, node, true);
        self.observer.cell_unloaded(rec.pos);
        self.stats.record_record_unloaded();
        debug!(cell = %rec.pos, reason, "cell record destroyed");
    }

    // =========================================================================
    // Background saves
    // =========================================================================

    /// Walks the dirty queue and starts saves for records past their
    /// cooldown, up to the per-tick budget.
    pub(crate) fn run_save_sweep(&mut self, report: &mut TickReport) {
        let mut remaining = self.config.save_budget;
        let now = self.now;
        let cooldown = self.config.save_cooldown;
        let mut revisit: Vec<u64> = Vec::new();
        while remaining > 0 {
            let Some(node) = self.dirty_queue.pop_front() else {
                break;
            };
            let keep = {
                let Some(rec) = self.records.get_mut(&node) else {
                    continue;
                };
                if !rec.accessed_since_save {
                    // Cleaned by a flush in the meantime.
                    rec.in_dirty_queue = false;
                    continue;
                }
                if !rec.save_due(now, cooldown) {
                    true
                } else {
                    rec.in_dirty_queue = false;
                    false
                }
            };
            if keep {
                // Cooling down or mid-flush; stays queued.
                revisit.push(node);
                continue;
            }
            remaining -= 1;
            if let FlushStart::Started = self.begin_flush(CellPos::from_key(node)) {
                report.saves_started += 1;
            }
        }
        for node in revisit {
            self.dirty_queue.push_back(node);
        }
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Settles the level field, then writes every record with unsaved
    /// content straight to the store. Worker lanes are bypassed; they are
    /// about to be torn down with the runtime.
    pub(crate) async fn finalize_shutdown(&mut self) {
        {
            let rules = ResidencyRules {
                tickets: &self.tickets,
            };
            self.residency.run_all_updates(&rules, &mut |_, _, _| {});
        }

        // Writes already in the maintenance lane finish on their own; await
        // them first rather than racing a second write for the same cell,
        // and line up a direct retry for any that report failure.
        let in_flight: Vec<_> = self
            .records
            .values()
            .filter_map(|rec| {
                rec.flush
                    .clone()
                    .map(|flush| (rec.pos, rec.save_snapshot(), flush))
            })
            .collect();
        let awaited = in_flight.len();
        let mut to_write: HashMap<u64, (CellPos, SavedCell)> = HashMap::new();
        for (pos, snapshot, flush) in in_flight {
            if !flush.await {
                if let Some(snapshot) = snapshot {
                    to_write.insert(pos.key(), (pos, snapshot));
                }
            }
        }
        // Newer content wins over a retried snapshot of the same cell.
        for rec in self.records.values() {
            if !rec.accessed_since_save {
                continue;
            }
            if let Some(snapshot) = rec.save_snapshot() {
                to_write.insert(rec.pos.key(), (rec.pos, snapshot));
            }
        }
        let total = to_write.len();
        info!(dirty = total, awaited, "shutdown flush started");

        let mut failed = 0usize;
        for (pos, snapshot) in to_write.into_values() {
            match self.store.write(pos, snapshot).await {
                Ok(()) => self.stats.record_save_completed(),
                Err(err) => {
                    failed += 1;
                    self.stats.record_save_failure();
                    error!(cell = %pos, error = %err, "shutdown flush failed");
                }
            }
        }
        info!(saved = total - failed, failed, "shutdown flush complete");
    }
}
