//! The sorter actor: one consumer loop owning every worker queue.
//!
//! # Architecture
//!
//! ```text
//!  scheduler ──Submit/Resort/Release──▶ ┌────────────┐
//!                                       │ TaskSorter │──spawn──▶ cell batch
//!  batch end ──────Release────────────▶ │  (1 task)  │           (runs items
//!                                       └────────────┘            in order)
//! ```
//!
//! Ops arrive on an unbounded channel and are applied strictly in order, so
//! a release queued behind a submit can never overtake it. After every op
//! that can unblock work the sorter pops ready batches and spawns them; each
//! batch runs its cell's items sequentially and posts its own release op
//! when done.

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::cell_queue::PriorityCellQueue;

/// A queued unit of work: called once when its batch runs, yielding the
/// future to drive to completion.
pub type CellTask = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send + 'static>;

/// Index of one worker lane inside the sorter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerId(pub usize);

/// Static description of a worker lane.
#[derive(Debug, Clone, Copy)]
pub struct WorkerSpec {
    pub name: &'static str,
    pub bands: usize,
    pub cap: usize,
}

enum SorterOp {
    Submit {
        worker: WorkerId,
        cell: u64,
        band: usize,
        task: Option<CellTask>,
    },
    Resort {
        worker: WorkerId,
        cell: u64,
        from: usize,
        to: usize,
    },
    Release {
        worker: WorkerId,
        cell: u64,
        full_clear: bool,
    },
    Snapshot {
        reply: oneshot::Sender<SorterSnapshot>,
    },
}

/// Cheap cloneable sender for sorter ops. Sends after shutdown are dropped
/// silently.
#[derive(Clone)]
pub struct SorterHandle {
    tx: mpsc::UnboundedSender<SorterOp>,
}

impl SorterHandle {
    pub fn submit(&self, worker: WorkerId, cell: u64, band: usize, task: CellTask) {
        let _ = self.tx.send(SorterOp::Submit {
            worker,
            cell,
            band,
            task: Some(task),
        });
    }

    /// Queues a placeholder, keeping `cell`'s list live at `band` so that a
    /// later release is ordered after everything already queued.
    pub fn submit_placeholder(&self, worker: WorkerId, cell: u64, band: usize) {
        let _ = self.tx.send(SorterOp::Submit {
            worker,
            cell,
            band,
            task: None,
        });
    }

    pub fn resort(&self, worker: WorkerId, cell: u64, from: usize, to: usize) {
        let _ = self.tx.send(SorterOp::Resort {
            worker,
            cell,
            from,
            to,
        });
    }

    pub fn release(&self, worker: WorkerId, cell: u64, full_clear: bool) {
        let _ = self.tx.send(SorterOp::Release {
            worker,
            cell,
            full_clear,
        });
    }

    pub async fn snapshot(&self) -> Option<SorterSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(SorterOp::Snapshot { reply }).ok()?;
        rx.await.ok()
    }
}

/// Point-in-time queue gauges, one entry per worker lane.
#[derive(Debug, Clone)]
pub struct SorterSnapshot {
    pub workers: Vec<WorkerSnapshot>,
}

#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub name: &'static str,
    pub queued: usize,
    pub acquired: usize,
    pub peak_acquired: usize,
    pub cap: usize,
    pub batches_dispatched: u64,
}

struct WorkerLane {
    name: &'static str,
    queue: PriorityCellQueue<CellTask>,
    batches_dispatched: u64,
}

/// Owns the worker queues; see the module docs for the op protocol.
pub struct TaskSorter {
    lanes: Vec<WorkerLane>,
    ops: mpsc::UnboundedReceiver<SorterOp>,
    handle: SorterHandle,
    shutdown: CancellationToken,
}

impl TaskSorter {
    pub fn new(specs: &[WorkerSpec], shutdown: CancellationToken) -> (Self, SorterHandle) {
        let (tx, ops) = mpsc::unbounded_channel();
        let handle = SorterHandle { tx };
        let lanes = specs
            .iter()
            .map(|spec| WorkerLane {
                name: spec.name,
                queue: PriorityCellQueue::new(spec.bands, spec.cap),
                batches_dispatched: 0,
            })
            .collect();
        (
            Self {
                lanes,
                ops,
                handle: handle.clone(),
                shutdown,
            },
            handle,
        )
    }

    /// Consumer loop. Runs until shutdown is signalled or every handle is
    /// gone.
    pub async fn run(mut self) {
        debug!(lanes = self.lanes.len(), "task sorter started");
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    debug!("task sorter shutting down");
                    break;
                }

                op = self.ops.recv() => {
                    match op {
                        Some(op) => self.handle_op(op),
                        None => {
                            debug!("all sorter handles dropped; stopping");
                            break;
                        }
                    }
                }
            }
        }
    }

    fn handle_op(&mut self, op: SorterOp) {
        match op {
            SorterOp::Submit {
                worker,
                cell,
                band,
                task,
            } => {
                self.lane_mut(worker).queue.submit(cell, band, task);
                self.dispatch(worker);
            }
            SorterOp::Resort {
                worker,
                cell,
                from,
                to,
            } => {
                self.lane_mut(worker).queue.resort(cell, from, to);
            }
            SorterOp::Release {
                worker,
                cell,
                full_clear,
            } => {
                self.lane_mut(worker).queue.release(cell, full_clear);
                self.dispatch(worker);
            }
            SorterOp::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn lane_mut(&mut self, worker: WorkerId) -> &mut WorkerLane {
        &mut self.lanes[worker.0]
    }

    /// Spawns every batch the lane can currently run within its cap.
    fn dispatch(&mut self, worker: WorkerId) {
        loop {
            let lane = &mut self.lanes[worker.0];
            let Some((cell, items)) = lane.queue.pop() else {
                break;
            };
            lane.batches_dispatched += 1;
            trace!(
                lane = lane.name,
                cell,
                items = items.len(),
                "dispatching cell batch"
            );
            let handle = self.handle.clone();
            tokio::spawn(async move {
                for task in items.into_iter().flatten() {
                    task().await;
                }
                handle.release(worker, cell, false);
            });
        }
    }

    fn snapshot(&self) -> SorterSnapshot {
        SorterSnapshot {
            workers: self
                .lanes
                .iter()
                .map(|lane| WorkerSnapshot {
                    name: lane.name,
                    queued: lane.queue.queued_len(),
                    acquired: lane.queue.acquired_count(),
                    peak_acquired: lane.queue.peak_acquired(),
                    cap: lane.queue.cap(),
                    batches_dispatched: lane.batches_dispatched,
                })
                .collect(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use futures::FutureExt;
    use tokio::sync::watch;

    use super::*;

    const GEN: WorkerId = WorkerId(0);

    fn start_sorter(cap: usize) -> (SorterHandle, CancellationToken) {
        let shutdown = CancellationToken::new();
        let (sorter, handle) = TaskSorter::new(
            &[WorkerSpec {
                name: "generation",
                bands: 8,
                cap,
            }],
            shutdown.clone(),
        );
        tokio::spawn(sorter.run());
        (handle, shutdown)
    }

    fn recording_task(log: Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> CellTask {
        Box::new(move || {
            async move {
                log.lock().unwrap().push(tag);
            }
            .boxed()
        })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn test_batch_runs_items_in_submission_order() {
        let (handle, shutdown) = start_sorter(4);
        let log = Arc::new(Mutex::new(Vec::new()));

        handle.submit(GEN, 7, 2, recording_task(log.clone(), "first"));
        handle.submit(GEN, 7, 2, recording_task(log.clone(), "second"));
        handle.submit(GEN, 7, 2, recording_task(log.clone(), "third"));
        settle().await;

        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_cap_limits_concurrent_cells() {
        let (handle, shutdown) = start_sorter(2);
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let (gate_tx, gate_rx) = watch::channel(false);

        for cell in 0..4u64 {
            let started = started.clone();
            let finished = finished.clone();
            let mut gate = gate_rx.clone();
            handle.submit(
                GEN,
                cell,
                1,
                Box::new(move || {
                    async move {
                        started.fetch_add(1, Ordering::SeqCst);
                        while !*gate.borrow() {
                            if gate.changed().await.is_err() {
                                break;
                            }
                        }
                        finished.fetch_add(1, Ordering::SeqCst);
                    }
                    .boxed()
                }),
            );
        }
        settle().await;
        assert_eq!(started.load(Ordering::SeqCst), 2, "cap must hold at 2");

        gate_tx.send(true).unwrap();
        settle().await;
        assert_eq!(started.load(Ordering::SeqCst), 4);
        assert_eq!(finished.load(Ordering::SeqCst), 4);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_release_full_clear_drops_queued_work() {
        let (handle, shutdown) = start_sorter(1);
        let log = Arc::new(Mutex::new(Vec::new()));
        let (gate_tx, gate_rx) = watch::channel(false);

        // Occupy the single slot with another cell so cell 9's tasks stay
        // queued.
        {
            let mut gate = gate_rx.clone();
            handle.submit(
                GEN,
                1,
                0,
                Box::new(move || {
                    async move {
                        while !*gate.borrow() {
                            if gate.changed().await.is_err() {
                                break;
                            }
                        }
                    }
                    .boxed()
                }),
            );
        }
        handle.submit(GEN, 9, 1, recording_task(log.clone(), "doomed"));
        handle.release(GEN, 9, true);
        gate_tx.send(true).unwrap();
        settle().await;

        assert!(log.lock().unwrap().is_empty(), "cleared task must not run");
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.workers[0].queued, 0);
        assert_eq!(snapshot.workers[0].acquired, 0);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_snapshot_reports_peak_acquired() {
        let (handle, shutdown) = start_sorter(2);
        let log = Arc::new(Mutex::new(Vec::new()));
        for cell in 0..5u64 {
            handle.submit(GEN, cell, 0, recording_task(log.clone(), "x"));
        }
        settle().await;

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.workers[0].name, "generation");
        assert!(snapshot.workers[0].peak_acquired <= 2);
        assert_eq!(snapshot.workers[0].batches_dispatched, 5);
        assert_eq!(log.lock().unwrap().len(), 5);
        shutdown.cancel();
    }
}
