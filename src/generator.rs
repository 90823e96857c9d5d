//! Generation seam: how stage content actually gets made.
//!
//! The scheduler is content-agnostic. It assembles the inputs a stage is
//! entitled to read, hands them to the [`StageGenerator`], and files the
//! bytes that come back. What those bytes mean is entirely the caller's
//! business.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::cell::CellPos;
use crate::error::GenerateError;
use crate::holder::CellContent;
use crate::stage::StageId;
use crate::store::SavedCell;

/// Everything a stage run may read.
pub struct GenerationInput {
    pub cell: CellPos,
    pub stage: StageId,
    /// This cell's own content at the previous stage; `None` only for the
    /// first stage.
    pub previous: Option<Arc<CellContent>>,
    /// Previous-stage content of every other cell within the stage's
    /// radius, paired with its position.
    pub neighbors: Vec<(CellPos, Arc<CellContent>)>,
    /// Whatever persistence had for this cell, for generators that refine
    /// rather than rebuild.
    pub saved: Option<Arc<SavedCell>>,
}

/// Produces the content for one `(cell, stage)` pair.
///
/// Runs on worker tasks under the generation lane's concurrency cap. An
/// error is recorded as a stage failure for that cell; it does not stop the
/// scheduler.
pub trait StageGenerator: Send + Sync {
    fn run(&self, input: GenerationInput) -> BoxFuture<'static, Result<Bytes, GenerateError>>;
}
