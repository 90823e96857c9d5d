//! Turning settled residency levels into record lifecycle actions.

use std::collections::HashSet;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, trace, warn};

use crate::cell::CellPos;
use crate::graph::{Level, PropagationRules};
use crate::holder::CellRecord;
use crate::store::SharedLoad;
use crate::ticket::TicketRegistry;

use super::commands::TickReport;
use super::core::{Orchestrator, GENERATION_WORKER, MAINTENANCE_WORKER};

/// Residency field rules: sources are per-cell ticket minimums, edges are
/// the eight surrounding cells.
pub(super) struct ResidencyRules<'a> {
    pub tickets: &'a TicketRegistry,
}

impl PropagationRules for ResidencyRules<'_> {
    fn source_level(&self, node: u64) -> Option<Level> {
        let min = self.tickets.min_level(CellPos::from_key(node));
        (min < self.tickets.level_none()).then_some(min)
    }

    fn for_each_neighbor(&self, node: u64, visit: &mut dyn FnMut(u64)) {
        for neighbor in CellPos::from_key(node).neighbors() {
            visit(neighbor.key());
        }
    }
}

impl Orchestrator {
    /// Applies one drain's worth of settled level changes. `dirty` holds
    /// every node whose level moved at least once during the drain; levels
    /// are read back fresh so intermediate hops are invisible here.
    pub(crate) fn apply_level_changes(&mut self, dirty: &HashSet<u64>, report: &mut TickReport) {
        for &node in dirty {
            let cell = CellPos::from_key(node);
            let level = self.residency.level(node);
            self.apply_cell_level(cell, level, report);
        }
    }

    fn apply_cell_level(&mut self, cell: CellPos, level: Level, report: &mut TickReport) {
        let node = cell.key();
        let resident = level <= self.config.max_resident_level();
        if !self.records.contains_key(&node) {
            if resident {
                self.create_record(cell, level, report);
            }
            // Level chatter past the margin tracks nothing.
            return;
        }
        if resident {
            self.update_resident_record(cell, level, report);
        } else {
            self.begin_retirement(cell, level);
        }
    }

    fn create_record(&mut self, cell: CellPos, level: Level, report: &mut TickReport) {
        let node = cell.key();
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        let saved = self.start_load(cell);
        let band = self.config.band_for(level);
        let mut rec = CellRecord::new(cell, level, epoch, band, self.config.plan.stage_count(), saved);
        rec.target = self.config.target_stage(level);
        debug!(cell = %cell, level, target = ?rec.target, epoch, "cell record created");
        self.records.insert(node, rec);
        self.stats.record_record_created();
        report.records_created += 1;
        self.schedule_toward_target(cell);
    }

    /// Kicks off the disk read every stage driver of this record will share.
    /// Read failures degrade to "nothing saved" with a warning; generation
    /// starts over rather than wedging the cell.
    fn start_load(&self, cell: CellPos) -> SharedLoad {
        let store = Arc::clone(&self.store);
        async move {
            match store.read(cell).await {
                Ok(saved) => saved.map(Arc::new),
                Err(err) => {
                    warn!(cell = %cell, error = %err, "cell load failed, regenerating");
                    None
                }
            }
        }
        .boxed()
        .shared()
    }

    fn update_resident_record(&mut self, cell: CellPos, level: Level, report: &mut TickReport) {
        let node = cell.key();
        if self.pending_unload.remove(&node) {
            // Back inside the resident range before the flush sweep got to
            // it. Same record, same epoch; anything still in flight keeps
            // its meaning.
            debug!(cell = %cell, level, "pending unload reclaimed");
            self.stats.record_record_reclaimed();
            report.records_reclaimed += 1;
        }
        let new_target = self.config.target_stage(level);
        let new_band = self.config.band_for(level);
        let (old_band, old_target, dropped, needs_schedule) = {
            let rec = self
                .records
                .get_mut(&node)
                .expect("resident record vanished mid-update");
            let old_band = rec.band;
            let old_target = rec.target;
            rec.level = level;
            rec.band = new_band;
            rec.target = new_target;
            let dropped = if new_target < old_target {
                rec.cancel_slots_above(new_target)
            } else {
                0
            };
            // Promotion, or an earlier pass that stopped short of target.
            let needs_schedule = new_target
                .is_some_and(|t| rec.stage_future(t).is_none());
            (old_band, old_target, dropped, needs_schedule)
        };
        if new_band != old_band {
            self.sorter.resort(GENERATION_WORKER, node, old_band, new_band);
            self.sorter.resort(MAINTENANCE_WORKER, node, old_band, new_band);
        }
        if dropped > 0 {
            trace!(
                cell = %cell,
                level,
                from = ?old_target,
                to = ?new_target,
                dropped,
                "stages cancelled on demotion"
            );
        }
        if needs_schedule {
            self.schedule_toward_target(cell);
        }
    }

    /// The level left the resident range: drop every slot, stop targeting
    /// stages, and queue the cell for the unload sweep.
    fn begin_retirement(&mut self, cell: CellPos, level: Level) {
        let node = cell.key();
        let new_band = self.config.band_for(level);
        let (old_band, dropped) = {
            let rec = self
                .records
                .get_mut(&node)
                .expect("retiring record vanished mid-update");
            let old_band = rec.band;
            rec.level = level;
            rec.band = new_band;
            rec.target = None;
            (old_band, rec.cancel_slots_above(None))
        };
        if old_band != new_band {
            self.sorter.resort(GENERATION_WORKER, node, old_band, new_band);
            self.sorter.resort(MAINTENANCE_WORKER, node, old_band, new_band);
        }
        if self.pending_unload.insert(node) {
            self.unload_order.push_back(node);
            // Keeps the cell cycling through the generation lane so the
            // final full clear lands behind anything already queued there.
            self.sorter.submit_placeholder(GENERATION_WORKER, node, new_band);
            trace!(cell = %cell, level, dropped, "cell queued for unload");
        }
    }
}
