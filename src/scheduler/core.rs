//! The orchestrator: single-threaded owner of all scheduler state.
//!
//! Every mutation flows through one mailbox consumed by one task, so none
//! of the structures here need locks. Command handling never awaits; the
//! only suspension points are the mailbox itself and the final shutdown
//! flush.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::cell::CellPos;
use crate::config::SchedulerConfig;
use crate::error::StageFailure;
use crate::generator::StageGenerator;
use crate::graph::{Level, LevelPropagator};
use crate::holder::{ready_stage, CellRecord, SharedStage};
use crate::observer::RegionObserver;
use crate::queue::{SorterHandle, WorkerId};
use crate::stage::StageId;
use crate::stats::SchedulerStats;
use crate::store::RegionStore;
use crate::ticket::{Tick, Ticket, TicketDelta, TicketKey, TicketKind, TicketRegistry};

use super::commands::{CellSnapshot, Command, SchedulerSnapshot, TickReport};
use super::levels::ResidencyRules;
use super::simulation::{SectionTracker, SimulationTracker};

/// Lane for stage generation batches.
pub(crate) const GENERATION_WORKER: WorkerId = WorkerId(0);
/// Lane for flush and save batches.
pub(crate) const MAINTENANCE_WORKER: WorkerId = WorkerId(1);

pub(crate) struct Orchestrator {
    pub(crate) config: SchedulerConfig,
    /// Scheduler time. Only `Tick` commands move it.
    pub(crate) now: Tick,
    commands: mpsc::UnboundedReceiver<Command>,
    /// Loopback sender handed to drivers and flush tasks.
    pub(crate) self_tx: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
    pub(crate) store: Arc<dyn RegionStore>,
    pub(crate) generator: Arc<dyn StageGenerator>,
    pub(crate) observer: Arc<dyn RegionObserver>,
    pub(crate) stats: Arc<SchedulerStats>,
    pub(crate) tickets: TicketRegistry,
    /// Residency level field, sourced from ticket minimums.
    pub(crate) residency: LevelPropagator,
    pub(crate) records: HashMap<u64, CellRecord>,
    /// Cells whose level left the resident range and are waiting for the
    /// unload sweep. Membership here is what "pending unload" means.
    pub(crate) pending_unload: HashSet<u64>,
    /// FIFO order for the unload sweep. May contain reclaimed cells; the
    /// sweep skips anything no longer in `pending_unload`.
    pub(crate) unload_order: VecDeque<u64>,
    /// Records with unsaved content, in the order they first became dirty.
    pub(crate) dirty_queue: VecDeque<u64>,
    /// Stage slots installed but whose driver has not started because a
    /// dependency record was still materializing.
    pub(crate) pending_drivers: HashSet<(u64, u8)>,
    pub(crate) simulation: SimulationTracker,
    pub(crate) sections: SectionTracker,
    pub(crate) sorter: SorterHandle,
    /// Next record epoch. Epochs distinguish completions from a previous
    /// residency of the same cell.
    pub(crate) next_epoch: u64,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: SchedulerConfig,
        store: Arc<dyn RegionStore>,
        generator: Arc<dyn StageGenerator>,
        observer: Arc<dyn RegionObserver>,
        sorter: SorterHandle,
        stats: Arc<SchedulerStats>,
        commands: mpsc::UnboundedReceiver<Command>,
        self_tx: mpsc::UnboundedSender<Command>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            residency: LevelPropagator::new(config.level_count),
            simulation: SimulationTracker::new(config.simulation_level),
            sections: SectionTracker::new(config.section_active_radius),
            tickets: TicketRegistry::new(config.level_count),
            config,
            now: 0,
            commands,
            self_tx,
            shutdown,
            store,
            generator,
            observer,
            stats,
            records: HashMap::new(),
            pending_unload: HashSet::new(),
            unload_order: VecDeque::new(),
            dirty_queue: VecDeque::new(),
            pending_drivers: HashSet::new(),
            sorter,
            next_epoch: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!("orchestrator started");
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!("orchestrator cancelled");
                    break;
                }
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.finalize_shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("all scheduler handles dropped, stopping");
                        break;
                    }
                },
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::AddTicket { cell, ticket } => self.handle_add_ticket(cell, ticket),
            Command::RemoveTicket {
                cell,
                kind,
                level,
                key,
            } => self.handle_remove_ticket(cell, kind, level, key),
            Command::SetKindLevel { kind, level } => self.handle_set_kind_level(kind, level),
            Command::SetSectionAnchor { key, section } => self.sections.set_anchor(key, section),
            Command::ClearSectionAnchor { key } => self.sections.clear_anchor(key),
            Command::StageFuture { cell, stage, reply } => {
                let future = self.public_stage_future(cell, stage);
                self.start_ready_drivers();
                let _ = reply.send(future);
            }
            Command::Tick { now, reply } => {
                let report = self.run_tick(now);
                let _ = reply.send(report);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.build_snapshot());
            }
            Command::DispatchGeneration { cell, epoch, task } => {
                self.handle_dispatch_generation(cell, epoch, task)
            }
            Command::StageFinished {
                cell,
                stage,
                epoch,
                fresh,
                outcome,
            } => self.handle_stage_finished(cell, stage, epoch, fresh, outcome),
            Command::FlushFinished { cell, epoch, result } => {
                self.handle_flush_finished(cell, epoch, result)
            }
            // Intercepted by the run loop; it never reaches dispatch.
            Command::Shutdown { .. } => {}
        }
    }

    // =========================================================================
    // Tick
    // =========================================================================

    fn run_tick(&mut self, now: Tick) -> TickReport {
        self.now = now;
        let mut report = TickReport {
            now,
            ..TickReport::default()
        };

        let (deltas, purged) = self.tickets.purge_expired(now);
        if purged > 0 {
            debug!(purged, "expired tickets dropped");
            self.stats.record_tickets_expired(purged as u64);
            report.tickets_expired = purged;
            self.apply_ticket_deltas(&deltas);
        }

        // Drain the residency field under budget, remembering which cells
        // moved. Levels are read back after the drain, so a cell that
        // bounced through an intermediate value is applied once, at its
        // settled level.
        let mut dirty: HashSet<u64> = HashSet::new();
        let applied = {
            let rules = ResidencyRules {
                tickets: &self.tickets,
            };
            self.residency.run_updates(
                &rules,
                self.config.propagation_budget,
                &mut |node, _, _| {
                    dirty.insert(node);
                },
            )
        };
        report.levels_applied = applied;
        report.levels_pending = self.residency.pending_updates();
        self.stats.record_propagation_applied(applied as u64);

        self.apply_level_changes(&dirty, &mut report);
        self.start_ready_drivers();
        self.run_unload_sweep(&mut report);
        self.run_save_sweep(&mut report);
        self.drain_activity(&mut report);

        trace!(
            now,
            applied = report.levels_applied,
            pending = report.levels_pending,
            created = report.records_created,
            flushes = report.flushes_started,
            "tick complete"
        );
        report
    }

    /// Settles both activity fields. These are tiny compared to residency,
    /// so they drain without a budget.
    fn drain_activity(&mut self, report: &mut TickReport) {
        let (activated, deactivated) = self.simulation.drain();
        for cell in &activated {
            trace!(cell = %cell, "simulation started");
        }
        for cell in &deactivated {
            trace!(cell = %cell, "simulation stopped");
        }
        report.simulation_started = activated.len();
        report.simulation_stopped = deactivated.len();

        let (on, off) = self.sections.drain();
        for section in &on {
            trace!(section = %section, "section activated");
        }
        for section in &off {
            trace!(section = %section, "section deactivated");
        }
        report.sections_activated = on.len();
        report.sections_deactivated = off.len();
    }

    // =========================================================================
    // Ticket commands
    // =========================================================================

    fn handle_add_ticket(&mut self, cell: CellPos, ticket: Ticket) {
        trace!(
            cell = %cell,
            kind = %ticket.kind,
            level = ticket.level,
            "ticket added"
        );
        self.stats.record_ticket_added();
        if let Some(delta) = self.tickets.add(cell, ticket) {
            self.apply_ticket_deltas(std::slice::from_ref(&delta));
        }
    }

    fn handle_remove_ticket(
        &mut self,
        cell: CellPos,
        kind: TicketKind,
        level: Level,
        key: TicketKey,
    ) {
        match self.tickets.remove(cell, kind, level, key) {
            Some(delta) => {
                trace!(cell = %cell, kind = %kind, level, "ticket removed");
                self.stats.record_ticket_removed();
                self.apply_ticket_deltas(std::slice::from_ref(&delta));
            }
            None => debug!(cell = %cell, kind = %kind, level, "ticket not found"),
        }
    }

    fn handle_set_kind_level(&mut self, kind: TicketKind, level: Level) {
        let deltas = self.tickets.set_kind_level(kind, level);
        debug!(kind = %kind, level, cells = deltas.len(), "ticket kind re-leveled");
        self.apply_ticket_deltas(&deltas);
    }

    pub(crate) fn apply_ticket_deltas(&mut self, deltas: &[TicketDelta]) {
        for delta in deltas {
            let node = delta.cell.key();
            if let Some((level, decreasing)) = delta.residency {
                let rules = ResidencyRules {
                    tickets: &self.tickets,
                };
                self.residency.update(&rules, node, level, decreasing);
            }
            if let Some((level, decreasing)) = delta.simulation {
                self.simulation.set_source(delta.cell, level, decreasing);
            }
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    fn public_stage_future(&mut self, cell: CellPos, stage: StageId) -> SharedStage {
        if stage.index() >= self.config.plan.stage_count() {
            return ready_stage(Err(StageFailure::NotRequested));
        }
        let within_target = self
            .records
            .get(&cell.key())
            .and_then(|rec| rec.target)
            .is_some_and(|target| stage <= target);
        if !within_target {
            return ready_stage(Err(StageFailure::NotRequested));
        }
        self.ensure_slot(cell, stage)
    }

    fn build_snapshot(&self) -> SchedulerSnapshot {
        let last = self.config.plan.last();
        let mut resident_cells: Vec<CellSnapshot> = self
            .records
            .values()
            .map(|rec| CellSnapshot {
                pos: rec.pos,
                level: rec.level,
                target: rec.target,
                highest_ready: rec.highest_ready(),
                fully_ready: rec.is_fully_ready(last),
                pending_unload: self.pending_unload.contains(&rec.pos.key()),
                simulating: self.simulation.is_active(rec.pos),
            })
            .collect();
        resident_cells.sort_by_key(|c| (c.pos.x, c.pos.z));
        SchedulerSnapshot {
            now: self.now,
            ticket_count: self.tickets.ticket_count(),
            resident_cells,
            pending_unload: self.pending_unload.len(),
            simulating_cells: self.simulation.active_count(),
            active_sections: self.sections.active_positions(),
        }
    }
}
