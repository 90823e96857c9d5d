//! Incremental minimum fixed point over node neighborhoods.
//!
//! The scheduler expresses residency, simulation activity and section
//! activity as *level fields*: every node carries the minimum of its own
//! source level and `neighbor + 1` over all neighbors. [`LevelPropagator`]
//! maintains such a field incrementally as sources come and go, and
//! [`PropagationRules`] supplies the two facts that differ per field: where
//! the sources are and who neighbors whom.

pub mod propagator;

pub use propagator::{LevelPropagator, PropagationRules};

/// Priority level within a field. Smaller is more urgent; the propagator's
/// `level_count` acts as the "no level" sentinel.
pub type Level = u8;
