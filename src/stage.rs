//! The staged readiness ladder cells climb while loading.
//!
//! Cells do not become usable in one step. They pass through an ordered list
//! of stages, each of which may read neighbor content produced by the
//! previous stage within some radius. [`StagePlan`] owns the list and the
//! arithmetic that maps a cell's priority level to the highest stage it
//! should reach.
//!
//! # Reach arithmetic
//!
//! For stage `k`, `reach(k)` is the sum of the radii of every stage above
//! `k`. A cell whose level sits `m` steps above the full-stage threshold is
//! targeted at the highest stage `k` with `reach(k) >= m`. Because levels
//! grow by at most one per grid step, a radius-`r` dependency of a stage-`k`
//! cell lies at offset `m + r` or less, and `reach(k - 1) = reach(k) +
//! radius(k)` then guarantees the dependency's own target is at least
//! `k - 1`. Scaffolding rings around loaded areas therefore always hold the
//! content their inner neighbors need next.

use std::fmt;

/// Index of one stage within a [`StagePlan`]. Ordered: later stages depend
/// on earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StageId(pub u8);

impl StageId {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn previous(self) -> Option<StageId> {
        self.0.checked_sub(1).map(StageId)
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage {}", self.0)
    }
}

/// One step of the ladder: a human-readable name and the neighbor radius its
/// generator reads at the previous stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSpec {
    pub name: &'static str,
    pub radius: u8,
}

impl StageSpec {
    pub const fn new(name: &'static str, radius: u8) -> Self {
        Self { name, radius }
    }
}

/// Ordered stage list plus the precomputed reach table.
#[derive(Debug, Clone)]
pub struct StagePlan {
    specs: Vec<StageSpec>,
    reach: Vec<u8>,
}

impl StagePlan {
    /// Builds a plan from an ordered stage list.
    ///
    /// # Panics
    ///
    /// Panics if the list is empty or the first stage has a non-zero radius.
    /// The first stage must be self-contained so that an isolated cell can
    /// always start climbing.
    pub fn new(specs: Vec<StageSpec>) -> Self {
        assert!(!specs.is_empty(), "stage plan must name at least one stage");
        assert_eq!(
            specs[0].radius, 0,
            "the first stage cannot depend on neighbors"
        );
        let mut reach = vec![0u8; specs.len()];
        for k in (0..specs.len().saturating_sub(1)).rev() {
            reach[k] = reach[k + 1].saturating_add(specs[k + 1].radius);
        }
        Self { specs, reach }
    }

    /// The default four-stage ladder.
    pub fn standard() -> Self {
        Self::new(vec![
            StageSpec::new("outline", 0),
            StageSpec::new("terrain", 1),
            StageSpec::new("decoration", 1),
            StageSpec::new("finalize", 2),
        ])
    }

    pub fn stage_count(&self) -> usize {
        self.specs.len()
    }

    /// The final stage, whose completion makes a cell fully ready.
    pub fn last(&self) -> StageId {
        StageId((self.specs.len() - 1) as u8)
    }

    pub fn name(&self, stage: StageId) -> &'static str {
        self.specs[stage.index()].name
    }

    /// Neighbor radius read by `stage` at the previous stage.
    pub fn radius(&self, stage: StageId) -> u8 {
        self.specs[stage.index()].radius
    }

    /// Sum of the radii of every stage above `stage`.
    pub fn reach(&self, stage: StageId) -> u8 {
        self.reach[stage.index()]
    }

    /// How many levels above the full-stage threshold still hold content.
    /// Cells further out than this carry no stages at all.
    pub fn margin(&self) -> u8 {
        self.reach[0]
    }

    /// Highest stage targeted by a cell `offset` levels above the full-stage
    /// threshold. `offset == 0` is the full target; past the margin there is
    /// no target.
    pub fn target_for_offset(&self, offset: u8) -> Option<StageId> {
        if offset == 0 {
            return Some(self.last());
        }
        (0..self.specs.len())
            .rev()
            .find(|&k| self.reach[k] >= offset)
            .map(|k| StageId(k as u8))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_plan_reach_table() {
        let plan = StagePlan::standard();
        assert_eq!(plan.stage_count(), 4);
        assert_eq!(plan.reach(StageId(3)), 0);
        assert_eq!(plan.reach(StageId(2)), 2);
        assert_eq!(plan.reach(StageId(1)), 3);
        assert_eq!(plan.reach(StageId(0)), 4);
        assert_eq!(plan.margin(), 4);
    }

    #[test]
    fn test_target_for_offset() {
        let plan = StagePlan::standard();
        assert_eq!(plan.target_for_offset(0), Some(StageId(3)));
        assert_eq!(plan.target_for_offset(1), Some(StageId(2)));
        assert_eq!(plan.target_for_offset(2), Some(StageId(2)));
        assert_eq!(plan.target_for_offset(3), Some(StageId(1)));
        assert_eq!(plan.target_for_offset(4), Some(StageId(0)));
        assert_eq!(plan.target_for_offset(5), None);
    }

    #[test]
    fn test_neighbor_targets_cover_dependencies() {
        // Every stage's radius-r dependencies must themselves be targeted at
        // the previous stage, even when the dependency sits r levels further
        // out.
        let plan = StagePlan::standard();
        for offset in 0..=plan.margin() {
            let Some(target) = plan.target_for_offset(offset) else {
                continue;
            };
            for k in 1..=target.index() {
                let stage = StageId(k as u8);
                let dep_offset = offset.saturating_add(plan.radius(stage));
                let dep_target = plan
                    .target_for_offset(dep_offset)
                    .expect("dependency outside the margin");
                assert!(
                    dep_target.index() + 1 >= k,
                    "offset {offset} stage {k}: dependency target {dep_target} too low"
                );
            }
        }
    }

    #[test]
    fn test_single_stage_plan() {
        let plan = StagePlan::new(vec![StageSpec::new("only", 0)]);
        assert_eq!(plan.margin(), 0);
        assert_eq!(plan.target_for_offset(0), Some(StageId(0)));
        assert_eq!(plan.target_for_offset(1), None);
    }

    #[test]
    #[should_panic(expected = "first stage")]
    fn test_first_stage_radius_must_be_zero() {
        let _ = StagePlan::new(vec![StageSpec::new("bad", 1)]);
    }
}
