//! The orchestrator's command protocol and its reply payloads.

use tokio::sync::oneshot;

use crate::cell::{CellPos, SectionPos};
use crate::error::StoreError;
use crate::graph::Level;
use crate::holder::{SharedStage, StageResult};
use crate::queue::CellTask;
use crate::stage::StageId;
use crate::ticket::{Tick, Ticket, TicketKey, TicketKind};

/// Everything the orchestrator can be asked to do. One mailbox, one
/// consumer; commands apply strictly in arrival order.
pub(crate) enum Command {
    AddTicket {
        cell: CellPos,
        ticket: Ticket,
    },
    RemoveTicket {
        cell: CellPos,
        kind: TicketKind,
        level: Level,
        key: TicketKey,
    },
    /// Re-homes every ticket of one kind to a new level in a single step.
    SetKindLevel {
        kind: TicketKind,
        level: Level,
    },
    SetSectionAnchor {
        key: TicketKey,
        section: SectionPos,
    },
    ClearSectionAnchor {
        key: TicketKey,
    },
    StageFuture {
        cell: CellPos,
        stage: StageId,
        reply: oneshot::Sender<SharedStage>,
    },
    /// Advances scheduler time and runs the per-tick sweeps.
    Tick {
        now: Tick,
        reply: oneshot::Sender<TickReport>,
    },
    Snapshot {
        reply: oneshot::Sender<SchedulerSnapshot>,
    },
    /// Posted by a stage driver once its inputs are assembled. The
    /// orchestrator queues the task at the record's current band.
    DispatchGeneration {
        cell: CellPos,
        epoch: u64,
        task: CellTask,
    },
    /// Posted by a stage driver when its outcome is known.
    StageFinished {
        cell: CellPos,
        stage: StageId,
        epoch: u64,
        /// Generator output, as opposed to disk replay. Fresh content
        /// dirties the record.
        fresh: bool,
        outcome: StageResult,
    },
    /// Posted by a flush task when its write settles.
    FlushFinished {
        cell: CellPos,
        epoch: u64,
        result: Result<(), StoreError>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// What one tick accomplished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub now: Tick,
    pub tickets_expired: usize,
    /// Level-field updates applied this tick.
    pub levels_applied: usize,
    /// Updates still queued when the budget ran out.
    pub levels_pending: usize,
    pub records_created: usize,
    pub records_reclaimed: usize,
    pub flushes_started: usize,
    pub saves_started: usize,
    pub simulation_started: usize,
    pub simulation_stopped: usize,
    pub sections_activated: usize,
    pub sections_deactivated: usize,
}

/// Point-in-time picture of the whole scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerSnapshot {
    pub now: Tick,
    pub ticket_count: usize,
    /// Every live record, sorted by position for stable output.
    pub resident_cells: Vec<CellSnapshot>,
    pub pending_unload: usize,
    pub simulating_cells: usize,
    pub active_sections: Vec<SectionPos>,
}

#[derive(Debug, Clone)]
pub struct CellSnapshot {
    pub pos: CellPos,
    pub level: Level,
    pub target: Option<StageId>,
    pub highest_ready: Option<StageId>,
    pub fully_ready: bool,
    pub pending_unload: bool,
    pub simulating: bool,
}

impl SchedulerSnapshot {
    pub fn cell(&self, pos: CellPos) -> Option<&CellSnapshot> {
        self.resident_cells.iter().find(|c| c.pos == pos)
    }
}
