//! Notification seam for consumers of finished cells.

use std::sync::Arc;

use crate::cell::CellPos;
use crate::holder::CellContent;

/// Callbacks fired from the orchestrator as cells cross the boundaries
/// consumers care about.
///
/// Implementations must be quick and non-blocking; they run on the
/// orchestrator task between commands.
pub trait RegionObserver: Send + Sync {
    /// The cell completed its final stage and is fully usable.
    fn cell_ready(&self, cell: CellPos, content: &Arc<CellContent>);

    /// The cell's record was destroyed after its flush completed.
    fn cell_unloaded(&self, cell: CellPos);
}

/// Discards every notification.
pub struct NullObserver;

impl RegionObserver for NullObserver {
    fn cell_ready(&self, _cell: CellPos, _content: &Arc<CellContent>) {}

    fn cell_unloaded(&self, _cell: CellPos) {}
}
