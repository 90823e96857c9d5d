//! Cloneable client handle for the scheduler mailbox.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::cell::{CellPos, SectionPos};
use crate::error::SchedulerError;
use crate::graph::Level;
use crate::holder::{SharedStage, StageResult};
use crate::queue::{SorterHandle, SorterSnapshot};
use crate::stage::StageId;
use crate::stats::{SchedulerStats, StatsSnapshot};
use crate::ticket::{Tick, Ticket, TicketKey, TicketKind};

use super::commands::{Command, SchedulerSnapshot, TickReport};

/// Submits commands to the orchestrator. Cheap to clone and safe to use
/// from any task; fire-and-forget methods return [`SchedulerError::ShutDown`]
/// once the orchestrator is gone.
///
/// Ticket and anchor changes take effect on the next [`tick`]. Only a tick
/// moves levels, schedules work, and retires cells, so a caller that never
/// ticks sees a frozen scheduler no matter how many tickets it files.
///
/// [`tick`]: SchedulerHandle::tick
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Command>,
    stats: Arc<SchedulerStats>,
    sorter: SorterHandle,
}

impl SchedulerHandle {
    pub(crate) fn new(
        tx: mpsc::UnboundedSender<Command>,
        stats: Arc<SchedulerStats>,
        sorter: SorterHandle,
    ) -> Self {
        Self { tx, stats, sorter }
    }

    fn send(&self, command: Command) -> Result<(), SchedulerError> {
        self.tx.send(command).map_err(|_| SchedulerError::ShutDown)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply))?;
        rx.await.map_err(|_| SchedulerError::ReplyDropped)
    }

    /// Files a ticket against a cell.
    pub fn add_ticket(&self, cell: CellPos, ticket: Ticket) -> Result<(), SchedulerError> {
        self.send(Command::AddTicket { cell, ticket })
    }

    /// Withdraws a previously filed ticket. Identity is the full
    /// (kind, level, key) triple.
    pub fn remove_ticket(
        &self,
        cell: CellPos,
        kind: TicketKind,
        level: Level,
        key: TicketKey,
    ) -> Result<(), SchedulerError> {
        self.send(Command::RemoveTicket {
            cell,
            kind,
            level,
            key,
        })
    }

    /// Moves every ticket of one kind to a new level, e.g. a global view
    /// distance change.
    pub fn set_kind_level(&self, kind: TicketKind, level: Level) -> Result<(), SchedulerError> {
        self.send(Command::SetKindLevel { kind, level })
    }

    /// Places or moves a section activity anchor.
    pub fn set_section_anchor(
        &self,
        key: TicketKey,
        section: SectionPos,
    ) -> Result<(), SchedulerError> {
        self.send(Command::SetSectionAnchor { key, section })
    }

    pub fn clear_section_anchor(&self, key: TicketKey) -> Result<(), SchedulerError> {
        self.send(Command::ClearSectionAnchor { key })
    }

    /// Returns the shared future for one stage of one cell. If the cell is
    /// not resident, or the stage lies beyond its current target, the
    /// future is already resolved with [`StageFailure::NotRequested`].
    ///
    /// [`StageFailure::NotRequested`]: crate::error::StageFailure::NotRequested
    pub async fn stage_future(
        &self,
        cell: CellPos,
        stage: StageId,
    ) -> Result<SharedStage, SchedulerError> {
        self.request(|reply| Command::StageFuture { cell, stage, reply })
            .await
    }

    /// Convenience wrapper that awaits the stage outcome itself.
    pub async fn await_stage(
        &self,
        cell: CellPos,
        stage: StageId,
    ) -> Result<StageResult, SchedulerError> {
        Ok(self.stage_future(cell, stage).await?.await)
    }

    /// Advances scheduler time to `now` and runs one maintenance pass.
    pub async fn tick(&self, now: Tick) -> Result<TickReport, SchedulerError> {
        self.request(|reply| Command::Tick { now, reply }).await
    }

    pub async fn snapshot(&self) -> Result<SchedulerSnapshot, SchedulerError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub(crate) async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    /// Counter snapshot. Reads atomics directly, no round-trip to the
    /// orchestrator.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Queue gauges for the worker lanes, or `None` after shutdown.
    pub async fn worker_snapshot(&self) -> Option<SorterSnapshot> {
        self.sorter.snapshot().await
    }
}
