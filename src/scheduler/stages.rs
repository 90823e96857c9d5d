//! Stage slot installation and the drivers that fill them.
//!
//! Scheduling is split in two. Installing a slot is purely local: it gives
//! the cell a shared future and a cancel token, nothing more. Starting the
//! slot's driver needs every dependency record to exist, which during a
//! budgeted drain may lag by a tick; `pending_drivers` holds the slots
//! whose driver is still waiting for that. Dependents can already await
//! the future in the meantime.

use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, trace};

use crate::cell::CellPos;
use crate::error::{invariant_violation, StageFailure};
use crate::generator::GenerationInput;
use crate::holder::{CellContent, SharedStage, StageResult};
use crate::queue::CellTask;
use crate::stage::StageId;

use super::commands::Command;
use super::core::{Orchestrator, GENERATION_WORKER};

impl Orchestrator {
    /// Installs slots from stage zero through the record's target. Idempotent;
    /// slots already present are left alone.
    pub(crate) fn schedule_toward_target(&mut self, cell: CellPos) {
        let Some(rec) = self.records.get(&cell.key()) else {
            return;
        };
        let Some(target) = rec.target else {
            return;
        };
        for k in 0..=target.index() {
            self.ensure_slot(cell, StageId(k as u8));
        }
    }

    /// Returns the slot future for `stage`, installing the slot first if the
    /// record does not have one yet.
    ///
    /// The caller must have established that the record exists; scheduling a
    /// stage on a missing record means the level bookkeeping is broken.
    pub(crate) fn ensure_slot(&mut self, cell: CellPos, stage: StageId) -> SharedStage {
        let node = cell.key();
        let Some(rec) = self.records.get_mut(&node) else {
            invariant_violation(&format!("no record for {cell} while installing {stage}"));
        };
        if let Some(existing) = rec.stage_future(stage) {
            return existing;
        }
        let (resolver, future) = crate::holder::stage_channel();
        let cancel = rec.cancel_root.child_token();
        rec.install_slot(stage, future.clone(), cancel, resolver);
        self.pending_drivers.insert((node, stage.0));
        trace!(cell = %cell, %stage, "stage slot installed");
        future
    }

    /// Starts every pending driver whose dependency records have
    /// materialized. Called after level application and after public slot
    /// installs; entries that cannot start yet stay for the next pass.
    pub(crate) fn start_ready_drivers(&mut self) {
        if self.pending_drivers.is_empty() {
            return;
        }
        let pending: Vec<(u64, u8)> = self.pending_drivers.iter().copied().collect();
        for (node, k) in pending {
            let cell = CellPos::from_key(node);
            let stage = StageId(k);
            let alive = self
                .records
                .get(&node)
                .is_some_and(|rec| rec.slot_state(stage).is_some());
            if !alive {
                // Slot cancelled or record destroyed since installation.
                self.pending_drivers.remove(&(node, k));
                continue;
            }
            if !self.dependencies_materialized(cell, stage) {
                continue;
            }
            self.pending_drivers.remove(&(node, k));
            self.start_driver(cell, stage);
        }
    }

    /// Whether every cell this stage reads from has a record targeting at
    /// least the previous stage. Guaranteed to hold once the residency field
    /// is fully drained; transiently false mid-wave.
    fn dependencies_materialized(&self, cell: CellPos, stage: StageId) -> bool {
        let Some(prev) = stage.previous() else {
            return true;
        };
        let radius = self.config.plan.radius(stage) as u32;
        cell.square(radius).all(|dep| {
            dep == cell
                || self
                    .records
                    .get(&dep.key())
                    .and_then(|rec| rec.target)
                    .is_some_and(|target| target >= prev)
        })
    }

    fn start_driver(&mut self, cell: CellPos, stage: StageId) {
        let node = cell.key();

        // Dependency futures first: the previous stage of every cell within
        // the stage's radius, this cell included.
        let mut deps: Vec<(CellPos, StageId, SharedStage)> = Vec::new();
        if let Some(prev) = stage.previous() {
            let radius = self.config.plan.radius(stage) as u32;
            let neighborhood: Vec<CellPos> = cell.square(radius).collect();
            for dep in neighborhood {
                let future = self.ensure_slot(dep, prev);
                deps.push((dep, prev, future));
            }
        }

        let Some(rec) = self.records.get_mut(&node) else {
            invariant_violation(&format!("record for {cell} vanished before its {stage} driver"));
        };
        let Some(resolver) = rec.take_resolver(stage) else {
            // A driver already claimed this slot.
            return;
        };
        let Some(cancel) = rec.slot_cancel(stage) else {
            return;
        };
        let saved = rec.saved.clone();
        let epoch = rec.epoch;

        let generator = Arc::clone(&self.generator);
        let to_core = self.self_tx.clone();
        trace!(cell = %cell, %stage, "stage driver started");

        tokio::spawn(async move {
            // Await dependencies outside the worker lane so slow neighbors
            // never hold an in-flight slot.
            let mut inputs: Vec<(CellPos, Arc<CellContent>)> = Vec::with_capacity(deps.len());
            for (dep_pos, dep_stage, dep_future) in deps {
                match dep_future.await {
                    Ok(content) => inputs.push((dep_pos, content)),
                    Err(_) => {
                        let outcome = Err(StageFailure::DependencyFailed {
                            cell: dep_pos,
                            stage: dep_stage,
                        });
                        resolver.resolve(outcome.clone());
                        let _ = to_core.send(Command::StageFinished {
                            cell,
                            stage,
                            epoch,
                            fresh: false,
                            outcome,
                        });
                        return;
                    }
                }
            }
            if cancel.is_cancelled() {
                let outcome = Err(StageFailure::Unloaded);
                resolver.resolve(outcome.clone());
                let _ = to_core.send(Command::StageFinished {
                    cell,
                    stage,
                    epoch,
                    fresh: false,
                    outcome,
                });
                return;
            }
            let saved_state = saved.await;

            // The real work goes through the priority lane and runs when the
            // cell's turn comes.
            let completions = to_core.clone();
            let task: CellTask = Box::new(move || {
                async move {
                    let replay = saved_state
                        .as_ref()
                        .filter(|s| s.stage >= stage)
                        .cloned();
                    let (outcome, fresh): (StageResult, bool) = if cancel.is_cancelled() {
                        (Err(StageFailure::Unloaded), false)
                    } else if let Some(saved) = replay {
                        // Disk already holds this stage or better; no need to
                        // regenerate.
                        let content = Arc::new(CellContent {
                            pos: cell,
                            stage: saved.stage,
                            data: saved.data.clone(),
                        });
                        (Ok(content), false)
                    } else {
                        let previous = inputs
                            .iter()
                            .find(|(p, _)| *p == cell)
                            .map(|(_, c)| Arc::clone(c));
                        let neighbors: Vec<(CellPos, Arc<CellContent>)> = inputs
                            .iter()
                            .filter(|(p, _)| *p != cell)
                            .cloned()
                            .collect();
                        let input = GenerationInput {
                            cell,
                            stage,
                            previous,
                            neighbors,
                            saved: saved_state.clone(),
                        };
                        match generator.run(input).await {
                            Ok(data) => {
                                let content = Arc::new(CellContent {
                                    pos: cell,
                                    stage,
                                    data,
                                });
                                (Ok(content), true)
                            }
                            Err(err) => (Err(err.into()), false),
                        }
                    };
                    resolver.resolve(outcome.clone());
                    let _ = completions.send(Command::StageFinished {
                        cell,
                        stage,
                        epoch,
                        fresh,
                        outcome,
                    });
                }
                .boxed()
            });
            // The band is looked up when the orchestrator processes this,
            // not captured here; a resort during the awaits above would
            // otherwise split the cell's pending work across two bands.
            let _ = to_core.send(Command::DispatchGeneration { cell, epoch, task });
        });
    }

    /// A driver assembled its inputs and handed back the task to queue.
    /// Submitting from the orchestrator keeps the band current with any
    /// resort issued since the driver started; a destroyed or re-created
    /// record drops the task, which resolves its slot as unloaded.
    pub(crate) fn handle_dispatch_generation(&mut self, cell: CellPos, epoch: u64, task: CellTask) {
        let node = cell.key();
        let band = match self.records.get(&node) {
            Some(rec) if rec.epoch == epoch => rec.band,
            _ => {
                trace!(cell = %cell, "generation dispatch for a stale record dropped");
                return;
            }
        };
        self.sorter.submit(GENERATION_WORKER, node, band, task);
    }

    /// A driver finished. Epoch and slot checks weed out completions that
    /// outlived their residency.
    pub(crate) fn handle_stage_finished(
        &mut self,
        cell: CellPos,
        stage: StageId,
        epoch: u64,
        fresh: bool,
        outcome: StageResult,
    ) {
        let node = cell.key();
        let Some(rec) = self.records.get_mut(&node) else {
            trace!(cell = %cell, %stage, "completion for a destroyed record dropped");
            return;
        };
        if rec.epoch != epoch {
            trace!(cell = %cell, %stage, "completion from a previous residency dropped");
            return;
        }
        match outcome {
            Ok(content) => {
                if !rec.mark_ready(stage, Arc::clone(&content), fresh) {
                    trace!(cell = %cell, %stage, "completion for a cancelled slot dropped");
                    return;
                }
                self.stats.record_stage_completed();
                trace!(cell = %cell, %stage, fresh, "stage complete");
                if stage == self.config.plan.last() {
                    self.observer.cell_ready(cell, &content);
                }
                if fresh && !rec.in_dirty_queue {
                    rec.in_dirty_queue = true;
                    self.dirty_queue.push_back(node);
                }
            }
            Err(failure) => {
                if !rec.mark_failed(stage) {
                    return;
                }
                self.stats.record_stage_failed();
                debug!(cell = %cell, %stage, %failure, "stage failed");
            }
        }
    }
}
