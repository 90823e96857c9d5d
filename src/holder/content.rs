//! Cell content snapshots and the futures that deliver them.
//!
//! A stage future resolves exactly once, to either an immutable content
//! snapshot or a [`StageFailure`] value. Failure is data here, never a
//! panic: every dependent cloning the future sees the same outcome and
//! decides for itself what to do about it.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::sync::oneshot;

use crate::cell::CellPos;
use crate::error::StageFailure;
use crate::stage::StageId;

/// Immutable snapshot of one cell's generated data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellContent {
    pub pos: CellPos,
    /// Stage the data was actually produced at. At least the stage of any
    /// slot resolving to this snapshot, and higher when disk had more.
    pub stage: StageId,
    pub data: Bytes,
}

/// What a stage slot resolves to.
pub type StageResult = Result<Arc<CellContent>, StageFailure>;

/// Cloneable completion future for one stage slot.
pub type SharedStage = Shared<BoxFuture<'static, StageResult>>;

/// Builds a slot future together with its single-use resolver.
///
/// Dropping the resolver unresolved makes the future yield
/// [`StageFailure::Unloaded`], so an abandoned driver can never wedge its
/// dependents.
pub(crate) fn stage_channel() -> (StageResolver, SharedStage) {
    let (tx, rx) = oneshot::channel();
    let future = rx
        .map(|received| received.unwrap_or(Err(StageFailure::Unloaded)))
        .boxed()
        .shared();
    (StageResolver { tx }, future)
}

/// A stage future that is already settled.
pub(crate) fn ready_stage(result: StageResult) -> SharedStage {
    futures::future::ready(result).boxed().shared()
}

/// Resolves one stage slot.
pub(crate) struct StageResolver {
    tx: oneshot::Sender<StageResult>,
}

impl StageResolver {
    pub(crate) fn resolve(self, result: StageResult) {
        // The slot may already be gone; nobody is listening and that is fine.
        let _ = self.tx.send(result);
    }
}
