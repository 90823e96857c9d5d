//! The region scheduler: tickets in, staged cells out.
//!
//! # Architecture
//!
//! ```text
//!  SchedulerHandle ──commands──▶ Orchestrator (single task, owns all state)
//!                                 │  tickets ─▶ residency levels ─▶ records
//!                                 │  stage slots ─▶ drivers ─▶ TaskSorter
//!                                 │  retirement ─▶ flushes ─▶ destruction
//!                                 ◀──completions (loopback commands)──┘
//! ```
//!
//! The orchestrator owns every map and never locks; concurrency lives in
//! the stage drivers, the worker lanes, and the shared futures callers
//! hold. Drivers and flush tasks report back through the same mailbox as
//! clients, so completions serialize with commands and the code has one
//! notion of "now".

mod commands;
mod core;
mod handle;
mod levels;
mod simulation;
mod stages;
mod unload;

pub use commands::{CellSnapshot, SchedulerSnapshot, TickReport};
pub use handle::SchedulerHandle;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::SchedulerConfig;
use crate::generator::StageGenerator;
use crate::observer::RegionObserver;
use crate::queue::{TaskSorter, WorkerSpec};
use crate::stats::SchedulerStats;
use crate::store::RegionStore;

use self::commands::Command;
use self::core::Orchestrator;

/// Owns the orchestrator and worker tasks. Dropping it without calling
/// [`shutdown`](RegionScheduler::shutdown) aborts the scheduler without a
/// final flush.
pub struct RegionScheduler {
    handle: SchedulerHandle,
    shutdown: CancellationToken,
    orchestrator_task: JoinHandle<()>,
    sorter_task: JoinHandle<()>,
}

impl RegionScheduler {
    /// Spawns the scheduler onto the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if `config` fails validation.
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn RegionStore>,
        generator: Arc<dyn StageGenerator>,
        observer: Arc<dyn RegionObserver>,
    ) -> Self {
        config.validate();
        info!(
            stages = config.plan.stage_count(),
            full_level = config.full_stage_level,
            level_count = config.level_count,
            "region scheduler starting"
        );
        let shutdown = CancellationToken::new();
        let (sorter, sorter_handle) = TaskSorter::new(
            &[
                WorkerSpec {
                    name: "generation",
                    bands: config.band_count(),
                    cap: config.generation_cap,
                },
                WorkerSpec {
                    name: "maintenance",
                    bands: config.band_count(),
                    cap: config.maintenance_cap,
                },
            ],
            shutdown.child_token(),
        );
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let stats = Arc::new(SchedulerStats::new());
        let orchestrator = Orchestrator::new(
            config,
            store,
            generator,
            observer,
            sorter_handle.clone(),
            Arc::clone(&stats),
            rx,
            tx.clone(),
            shutdown.child_token(),
        );
        let handle = SchedulerHandle::new(tx, stats, sorter_handle);
        let sorter_task = tokio::spawn(sorter.run());
        let orchestrator_task = tokio::spawn(orchestrator.run());
        Self {
            handle,
            shutdown,
            orchestrator_task,
            sorter_task,
        }
    }

    /// A fresh client handle.
    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Flushes dirty cells, then stops the orchestrator and worker lanes.
    pub async fn shutdown(self) {
        if self.handle.shutdown().await.is_err() {
            debug!("orchestrator already stopped");
        }
        self.shutdown.cancel();
        let _ = self.orchestrator_task.await;
        let _ = self.sorter_task.await;
        info!("region scheduler stopped");
    }
}
