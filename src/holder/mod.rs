//! Per-cell state: immutable content snapshots, shared stage futures, and
//! the record tracking one resident cell through its lifecycle.

pub mod content;
pub mod record;

pub use content::{CellContent, SharedStage, StageResult};
pub(crate) use content::{ready_stage, stage_channel};
pub(crate) use record::CellRecord;
