//! Cell-keyed priority queues and the sorter actor that owns them.
//!
//! Workers never touch queue state directly. Every mutation is an op sent
//! to the [`TaskSorter`], whose single consumer loop applies ops in arrival
//! order and spawns ready batches. That one-writer discipline is what makes
//! the acquire/release accounting reliable without locks.

pub mod cell_queue;
pub mod sorter;

pub use cell_queue::PriorityCellQueue;
pub use sorter::{
    CellTask, SorterHandle, SorterSnapshot, TaskSorter, WorkerId, WorkerSnapshot, WorkerSpec,
};
