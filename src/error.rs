//! Error taxonomy for the scheduler.
//!
//! Failures split into two families with different propagation rules:
//!
//! - [`StageFailure`] is a *value* carried inside shared stage futures. Many
//!   dependents may observe the same failure, so it is cheap to clone and
//!   never tears down the scheduler.
//! - [`StoreError`], [`GenerateError`] and [`SchedulerError`] are ordinary
//!   `Result` errors returned from the seams where callers can act on them.

use std::sync::Arc;

use thiserror::Error;

use crate::cell::CellPos;
use crate::stage::StageId;

/// Why a stage future resolved without content.
///
/// Cloned freely: every holder of a shared stage future receives the same
/// failure value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageFailure {
    /// A neighborhood prerequisite did not reach the required stage.
    #[error("dependency {cell} never reached {stage}")]
    DependencyFailed { cell: CellPos, stage: StageId },

    /// The generator itself reported an error for this cell.
    #[error("generation failed: {0}")]
    Generator(Arc<str>),

    /// The cell was demoted or unloaded before the stage could complete.
    #[error("cell unloaded before the stage completed")]
    Unloaded,

    /// No ticket keeps the cell at a level that schedules this stage.
    #[error("cell is not requested at a level that reaches this stage")]
    NotRequested,
}

impl StageFailure {
    pub fn generator(message: impl Into<String>) -> Self {
        Self::Generator(Arc::from(message.into()))
    }
}

/// Errors from the persistence backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o failure: {0}")]
    Io(String),

    #[error("stored cell state is corrupt: {0}")]
    Corrupt(String),
}

/// Errors reported by a stage generator.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct GenerateError {
    pub message: String,
}

impl GenerateError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<GenerateError> for StageFailure {
    fn from(err: GenerateError) -> Self {
        StageFailure::Generator(Arc::from(err.message))
    }
}

/// Errors surfaced through [`SchedulerHandle`](crate::scheduler::SchedulerHandle).
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The orchestrator task has exited; no further commands are accepted.
    #[error("scheduler is shut down")]
    ShutDown,

    /// The orchestrator dropped a reply channel without answering.
    #[error("scheduler dropped the reply channel")]
    ReplyDropped,
}

/// Records a state desync and escalates.
///
/// The level tables and the record map must agree at all times; once they
/// diverge, every subsequent scheduling decision is suspect, so the only safe
/// move is to report and stop.
pub(crate) fn invariant_violation(report: &str) -> ! {
    tracing::error!(%report, "scheduler invariant violated");
    panic!("scheduler invariant violated: {report}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_failure_display() {
        let failure = StageFailure::DependencyFailed {
            cell: CellPos::new(3, -1),
            stage: StageId(2),
        };
        assert_eq!(failure.to_string(), "dependency (3, -1) never reached stage 2");
    }

    #[test]
    fn test_generator_failure_from_error() {
        let failure: StageFailure = GenerateError::new("noise overflow").into();
        assert_eq!(failure, StageFailure::generator("noise overflow"));
        assert_eq!(failure.to_string(), "generation failed: noise overflow");
    }

    #[test]
    fn test_failure_clones_compare_equal() {
        let failure = StageFailure::Unloaded;
        assert_eq!(failure.clone(), failure);
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::Io("disk detached".into());
        assert_eq!(err.to_string(), "store i/o failure: disk detached");
    }
}
