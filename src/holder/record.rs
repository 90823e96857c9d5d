//! The mutable record tracking one resident cell.
//!
//! Records are owned exclusively by the orchestrator task and are never
//! shared or locked. Everything concurrent about a cell flows through the
//! shared futures a record hands out, and through the epoch stamp that lets
//! the orchestrator ignore completions from a previous residency.

use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use tokio_util::sync::CancellationToken;

use crate::cell::CellPos;
use crate::graph::Level;
use crate::stage::StageId;
use crate::store::{SavedCell, SharedLoad};
use crate::ticket::Tick;

use super::content::{CellContent, SharedStage, StageResolver};

/// Resolution state of one installed stage slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    Pending,
    Ready,
    Failed,
}

/// One scheduled stage: the future dependents hold, the token that aborts
/// its driver, and where it got to.
///
/// The resolver sits here from installation until a driver claims it. A
/// slot dropped with the resolver still in place resolves its future as
/// unloaded, which is exactly right for work torn down before it began.
pub(crate) struct StageSlot {
    pub future: SharedStage,
    pub cancel: CancellationToken,
    pub state: SlotState,
    pub resolver: Option<StageResolver>,
}

/// Completion future for an in-flight save; `true` means the write landed.
pub(crate) type FlushFuture = Shared<BoxFuture<'static, bool>>;

pub(crate) struct CellRecord {
    pub pos: CellPos,
    pub level: Level,
    /// Highest stage the current level asks for; `None` for bare scaffolding
    /// past the margin.
    pub target: Option<StageId>,
    /// Bumped on every create; completions stamped with an older epoch
    /// belong to a previous residency and are dropped.
    pub epoch: u64,
    /// Current queue band; kept in sync with `level` via resorts.
    pub band: usize,
    slots: Vec<Option<StageSlot>>,
    /// Best content produced so far. Survives demotion so the work is not
    /// lost if the cell is saved later.
    content: Option<Arc<CellContent>>,
    /// Lazily-started disk read, shared by every stage driver.
    pub saved: SharedLoad,
    /// In-flight save, if any. A second save request joins it instead of
    /// writing twice.
    pub flush: Option<FlushFuture>,
    pub accessed_since_save: bool,
    /// Guards against duplicate entries in the orchestrator's dirty queue.
    pub in_dirty_queue: bool,
    pub last_save_tick: Option<Tick>,
    /// Parent of every slot token; cancelled once on destruction.
    pub cancel_root: CancellationToken,
}

impl CellRecord {
    pub fn new(
        pos: CellPos,
        level: Level,
        epoch: u64,
        band: usize,
        stage_count: usize,
        saved: SharedLoad,
    ) -> Self {
        Self {
            pos,
            level,
            target: None,
            epoch,
            band,
            slots: (0..stage_count).map(|_| None).collect(),
            content: None,
            saved,
            flush: None,
            accessed_since_save: false,
            in_dirty_queue: false,
            last_save_tick: None,
            cancel_root: CancellationToken::new(),
        }
    }

    /// The slot future for `stage`, if one has been installed.
    pub fn stage_future(&self, stage: StageId) -> Option<SharedStage> {
        self.slots
            .get(stage.index())?
            .as_ref()
            .map(|slot| slot.future.clone())
    }

    pub fn slot_state(&self, stage: StageId) -> Option<SlotState> {
        self.slots.get(stage.index())?.as_ref().map(|s| s.state)
    }

    pub fn install_slot(
        &mut self,
        stage: StageId,
        future: SharedStage,
        cancel: CancellationToken,
        resolver: StageResolver,
    ) {
        debug_assert!(
            self.slots[stage.index()].is_none(),
            "slot {stage} installed twice"
        );
        self.slots[stage.index()] = Some(StageSlot {
            future,
            cancel,
            state: SlotState::Pending,
            resolver: Some(resolver),
        });
    }

    /// Claims the resolver for `stage`, marking its driver as started.
    /// Returns `None` if the slot is gone or a driver already claimed it.
    pub fn take_resolver(&mut self, stage: StageId) -> Option<StageResolver> {
        self.slots
            .get_mut(stage.index())?
            .as_mut()?
            .resolver
            .take()
    }

    pub fn slot_cancel(&self, stage: StageId) -> Option<CancellationToken> {
        self.slots
            .get(stage.index())?
            .as_ref()
            .map(|slot| slot.cancel.clone())
    }

    /// Records a completed stage. Returns `false` when the slot was removed
    /// while the result was in flight, in which case nothing is updated.
    ///
    /// `fresh` marks generator output, which dirties the record; content
    /// replayed from disk does not.
    pub fn mark_ready(&mut self, stage: StageId, content: Arc<CellContent>, fresh: bool) -> bool {
        let Some(slot) = self.slots.get_mut(stage.index()).and_then(Option::as_mut) else {
            return false;
        };
        slot.state = SlotState::Ready;
        let better = self
            .content
            .as_ref()
            .map_or(true, |held| content.stage >= held.stage);
        if better {
            self.content = Some(content);
        }
        if fresh {
            self.accessed_since_save = true;
        }
        true
    }

    pub fn mark_failed(&mut self, stage: StageId) -> bool {
        match self.slots.get_mut(stage.index()).and_then(Option::as_mut) {
            Some(slot) => {
                slot.state = SlotState::Failed;
                true
            }
            None => false,
        }
    }

    /// Whether the final stage has resolved with content.
    pub fn is_fully_ready(&self, last: StageId) -> bool {
        self.slot_state(last) == Some(SlotState::Ready)
    }

    /// Highest stage currently holding a ready slot.
    pub fn highest_ready(&self) -> Option<StageId> {
        (0..self.slots.len())
            .rev()
            .map(|k| StageId(k as u8))
            .find(|&k| self.slot_state(k) == Some(SlotState::Ready))
    }

    /// Best content produced so far, at whatever stage it reached.
    pub fn latest_content(&self) -> Option<Arc<CellContent>> {
        self.content.clone()
    }

    /// Cancels and removes every slot above the new target. Returns how many
    /// were dropped. Content is kept; only the in-flight work is aborted.
    pub fn cancel_slots_above(&mut self, target: Option<StageId>) -> usize {
        let keep_through = target.map_or(0, |t| t.index() + 1);
        let mut dropped = 0;
        for slot in self.slots.iter_mut().skip(keep_through) {
            if let Some(slot) = slot.take() {
                slot.cancel.cancel();
                dropped += 1;
            }
        }
        dropped
    }

    /// What a save would write, if there is anything to write.
    pub fn save_snapshot(&self) -> Option<SavedCell> {
        self.content.as_ref().map(|c| SavedCell {
            stage: c.stage,
            data: c.data.clone(),
        })
    }

    /// Whether the background sweep should save this record now.
    pub fn save_due(&self, now: Tick, cooldown: Tick) -> bool {
        self.accessed_since_save
            && self.flush.is_none()
            && self
                .last_save_tick
                .map_or(true, |last| now.saturating_sub(last) >= cooldown)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures::FutureExt;

    use super::*;
    use crate::holder::content::{ready_stage, stage_channel};

    fn no_saved() -> SharedLoad {
        futures::future::ready(None).boxed().shared()
    }

    fn record() -> CellRecord {
        CellRecord::new(CellPos::new(0, 0), 30, 1, 30, 4, no_saved())
    }

    fn content_at(stage: StageId) -> Arc<CellContent> {
        Arc::new(CellContent {
            pos: CellPos::new(0, 0),
            stage,
            data: Bytes::from_static(b"x"),
        })
    }

    #[test]
    fn test_mark_ready_tracks_best_content() {
        let mut rec = record();
        for k in 0..3u8 {
            let (resolver, future) = stage_channel();
            rec.install_slot(StageId(k), future, CancellationToken::new(), resolver);
        }
        assert!(rec.mark_ready(StageId(0), content_at(StageId(0)), true));
        assert!(rec.mark_ready(StageId(2), content_at(StageId(2)), true));
        assert!(rec.mark_ready(StageId(1), content_at(StageId(1)), true));

        assert_eq!(rec.latest_content().unwrap().stage, StageId(2));
        assert_eq!(rec.highest_ready(), Some(StageId(2)));
        assert!(rec.accessed_since_save);
        assert!(!rec.is_fully_ready(StageId(3)));
    }

    #[test]
    fn test_disk_replay_does_not_dirty() {
        let mut rec = record();
        let (resolver, future) = stage_channel();
        rec.install_slot(StageId(0), future, CancellationToken::new(), resolver);
        rec.mark_ready(StageId(0), content_at(StageId(0)), false);
        assert!(!rec.accessed_since_save);
        assert_eq!(rec.save_snapshot().unwrap().stage, StageId(0));
    }

    #[test]
    fn test_cancel_slots_above_keeps_target() {
        let mut rec = record();
        let mut tokens = Vec::new();
        for k in 0..4u8 {
            let (resolver, future) = stage_channel();
            let token = CancellationToken::new();
            tokens.push(token.clone());
            rec.install_slot(StageId(k), future, token, resolver);
        }
        let dropped = rec.cancel_slots_above(Some(StageId(1)));
        assert_eq!(dropped, 2);
        assert!(!tokens[0].is_cancelled());
        assert!(!tokens[1].is_cancelled());
        assert!(tokens[2].is_cancelled());
        assert!(tokens[3].is_cancelled());
        assert!(rec.stage_future(StageId(2)).is_none());
        assert!(rec.stage_future(StageId(1)).is_some());
    }

    #[test]
    fn test_stale_completion_is_ignored() {
        let mut rec = record();
        let (resolver, future) = stage_channel();
        rec.install_slot(StageId(2), future, CancellationToken::new(), resolver);
        rec.cancel_slots_above(Some(StageId(0)));
        assert!(!rec.mark_ready(StageId(2), content_at(StageId(2)), true));
        assert!(!rec.accessed_since_save);
    }

    #[test]
    fn test_take_resolver_claims_once() {
        let mut rec = record();
        let (resolver, _future) = stage_channel();
        rec.install_slot(StageId(1), ready_stage(Err(crate::error::StageFailure::Unloaded)), CancellationToken::new(), resolver);
        assert!(rec.take_resolver(StageId(1)).is_some());
        assert!(rec.take_resolver(StageId(1)).is_none(), "second claim");
        assert!(rec.take_resolver(StageId(0)).is_none(), "no slot there");
    }

    #[tokio::test]
    async fn test_dropped_slot_resolves_unloaded() {
        let mut rec = record();
        let (resolver, future) = stage_channel();
        rec.install_slot(StageId(3), future.clone(), CancellationToken::new(), resolver);
        rec.cancel_slots_above(Some(StageId(0)));
        assert_eq!(future.await, Err(crate::error::StageFailure::Unloaded));
    }

    #[test]
    fn test_save_due_honors_cooldown_and_flush() {
        let mut rec = record();
        assert!(!rec.save_due(100, 10), "clean record never due");

        rec.accessed_since_save = true;
        assert!(rec.save_due(100, 10));

        rec.last_save_tick = Some(95);
        assert!(!rec.save_due(100, 10), "cooling down");
        assert!(rec.save_due(105, 10));

        rec.flush = Some(futures::future::ready(true).boxed().shared());
        assert!(!rec.save_due(200, 10), "flush already in flight");
    }
}
