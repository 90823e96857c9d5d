//! Activity fields: which cells simulate, and which 3D sections are near
//! an anchor.
//!
//! Both trackers own a small level field of their own, sourced from
//! mirrors they maintain themselves. The fields are truncated: levels past
//! the activity threshold all mean "inactive", so they stop one band
//! beyond it and churn far from any anchor costs nothing.

use std::collections::{HashMap, HashSet};

use crate::cell::{CellPos, SectionPos};
use crate::graph::{Level, LevelPropagator, PropagationRules};
use crate::ticket::TicketKey;

// ============================================================================
// Cell simulation
// ============================================================================

struct CellFieldRules<'a> {
    sources: &'a HashMap<u64, Level>,
}

impl PropagationRules for CellFieldRules<'_> {
    fn source_level(&self, node: u64) -> Option<Level> {
        self.sources.get(&node).copied()
    }

    fn for_each_neighbor(&self, node: u64, visit: &mut dyn FnMut(u64)) {
        for neighbor in CellPos::from_key(node).neighbors() {
            visit(neighbor.key());
        }
    }
}

/// Tracks which cells a simulation-driving ticket currently reaches.
///
/// A cell is active while its field level is at or below the threshold.
/// Transitions are reported once per drain, after the field settles.
pub(crate) struct SimulationTracker {
    propagator: LevelPropagator,
    sources: HashMap<u64, Level>,
    threshold: Level,
    active: HashSet<u64>,
}

impl SimulationTracker {
    pub fn new(threshold: Level) -> Self {
        Self {
            // One band past the threshold is enough to see cells go dark.
            propagator: LevelPropagator::new(threshold + 2),
            sources: HashMap::new(),
            threshold,
            active: HashSet::new(),
        }
    }

    /// Mirrors a change in a cell's simulation ticket minimum. Levels past
    /// the truncated field collapse into "no source".
    pub fn set_source(&mut self, cell: CellPos, level: Level, decreasing: bool) {
        let node = cell.key();
        let clamped = level.min(self.propagator.level_none());
        if clamped >= self.propagator.level_none() {
            self.sources.remove(&node);
        } else {
            self.sources.insert(node, clamped);
        }
        let rules = CellFieldRules {
            sources: &self.sources,
        };
        self.propagator.update(&rules, node, clamped, decreasing);
    }

    /// Settles the field and reports `(activated, deactivated)` cells.
    pub fn drain(&mut self) -> (Vec<CellPos>, Vec<CellPos>) {
        let mut touched: HashSet<u64> = HashSet::new();
        {
            let rules = CellFieldRules {
                sources: &self.sources,
            };
            self.propagator
                .run_all_updates(&rules, &mut |node, _, _| {
                    touched.insert(node);
                });
        }
        let mut activated = Vec::new();
        let mut deactivated = Vec::new();
        for node in touched {
            let now_active = self.propagator.level(node) <= self.threshold;
            if now_active {
                if self.active.insert(node) {
                    activated.push(CellPos::from_key(node));
                }
            } else if self.active.remove(&node) {
                deactivated.push(CellPos::from_key(node));
            }
        }
        (activated, deactivated)
    }

    pub fn is_active(&self, cell: CellPos) -> bool {
        self.active.contains(&cell.key())
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

// ============================================================================
// Section activity
// ============================================================================

struct SectionFieldRules<'a> {
    anchored: &'a HashMap<u64, usize>,
}

impl PropagationRules for SectionFieldRules<'_> {
    fn source_level(&self, node: u64) -> Option<Level> {
        self.anchored.contains_key(&node).then_some(0)
    }

    fn for_each_neighbor(&self, node: u64, visit: &mut dyn FnMut(u64)) {
        for neighbor in SectionPos::from_key(node).neighbors() {
            visit(neighbor.key());
        }
    }
}

/// Tracks sections within an activity radius of at least one anchor in the
/// 26-connected 3D field. Anchors are keyed so a mover re-anchors with one
/// call and two anchors may share a section.
pub(crate) struct SectionTracker {
    propagator: LevelPropagator,
    /// Anchor position per key.
    anchors: HashMap<u64, SectionPos>,
    /// Anchor count per section; a section is a source while nonzero.
    anchored: HashMap<u64, usize>,
    radius: Level,
    active: HashSet<u64>,
}

impl SectionTracker {
    pub fn new(radius: Level) -> Self {
        Self {
            propagator: LevelPropagator::new(radius + 2),
            anchors: HashMap::new(),
            anchored: HashMap::new(),
            radius,
            active: HashSet::new(),
        }
    }

    pub fn set_anchor(&mut self, key: TicketKey, section: SectionPos) {
        let prev = self.anchors.insert(key.0, section);
        if prev == Some(section) {
            return;
        }
        if let Some(old) = prev {
            self.release(old);
        }
        let node = section.key();
        let count = self.anchored.entry(node).or_insert(0);
        *count += 1;
        if *count == 1 {
            let rules = SectionFieldRules {
                anchored: &self.anchored,
            };
            self.propagator.update(&rules, node, 0, true);
        }
    }

    pub fn clear_anchor(&mut self, key: TicketKey) {
        if let Some(old) = self.anchors.remove(&key.0) {
            self.release(old);
        }
    }

    fn release(&mut self, section: SectionPos) {
        let node = section.key();
        if let Some(count) = self.anchored.get_mut(&node) {
            *count -= 1;
            if *count == 0 {
                self.anchored.remove(&node);
                let none = self.propagator.level_none();
                let rules = SectionFieldRules {
                    anchored: &self.anchored,
                };
                self.propagator.update(&rules, node, none, false);
            }
        }
    }

    /// Settles the field and reports `(activated, deactivated)` sections.
    pub fn drain(&mut self) -> (Vec<SectionPos>, Vec<SectionPos>) {
        let mut touched: HashSet<u64> = HashSet::new();
        {
            let rules = SectionFieldRules {
                anchored: &self.anchored,
            };
            self.propagator
                .run_all_updates(&rules, &mut |node, _, _| {
                    touched.insert(node);
                });
        }
        let mut activated = Vec::new();
        let mut deactivated = Vec::new();
        for node in touched {
            let now_active = self.propagator.level(node) <= self.radius;
            if now_active {
                if self.active.insert(node) {
                    activated.push(SectionPos::from_key(node));
                }
            } else if self.active.remove(&node) {
                deactivated.push(SectionPos::from_key(node));
            }
        }
        (activated, deactivated)
    }

    /// Every active section, ordered for stable output.
    pub fn active_positions(&self) -> Vec<SectionPos> {
        let mut positions: Vec<SectionPos> =
            self.active.iter().map(|&k| SectionPos::from_key(k)).collect();
        positions.sort_by_key(|s| (s.x, s.y, s.z));
        positions
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulation_activates_a_square_around_the_source() {
        let mut tracker = SimulationTracker::new(2);
        tracker.set_source(CellPos::new(0, 0), 0, true);
        let (activated, deactivated) = tracker.drain();

        // Levels grow one per step, so the active square is radius 2.
        assert_eq!(activated.len(), 25);
        assert!(deactivated.is_empty());
        assert!(tracker.is_active(CellPos::new(2, -2)));
        assert!(!tracker.is_active(CellPos::new(3, 0)));

        let (activated, deactivated) = tracker.drain();
        assert!(activated.is_empty() && deactivated.is_empty(), "drain is idempotent");
    }

    #[test]
    fn test_simulation_deactivates_when_the_source_leaves() {
        let mut tracker = SimulationTracker::new(2);
        tracker.set_source(CellPos::new(0, 0), 0, true);
        tracker.drain();
        assert_eq!(tracker.active_count(), 25);

        tracker.set_source(CellPos::new(0, 0), 200, false);
        let (activated, deactivated) = tracker.drain();
        assert!(activated.is_empty());
        assert_eq!(deactivated.len(), 25);
        assert_eq!(tracker.active_count(), 0);
    }

    #[test]
    fn test_source_past_the_threshold_is_inert() {
        let mut tracker = SimulationTracker::new(2);
        tracker.set_source(CellPos::new(0, 0), 10, true);
        let (activated, _) = tracker.drain();
        assert!(activated.is_empty());
        assert_eq!(tracker.active_count(), 0);
    }

    #[test]
    fn test_section_anchor_activates_a_cube() {
        let mut tracker = SectionTracker::new(1);
        tracker.set_anchor(TicketKey(7), SectionPos::new(0, 4, 0));
        let (activated, _) = tracker.drain();

        assert_eq!(activated.len(), 27);
        assert!(activated.contains(&SectionPos::new(1, 5, 1)));
        assert!(!activated.contains(&SectionPos::new(2, 4, 0)));
    }

    #[test]
    fn test_moving_an_anchor_swaps_the_active_set() {
        let mut tracker = SectionTracker::new(1);
        tracker.set_anchor(TicketKey(7), SectionPos::new(0, 0, 0));
        tracker.drain();

        tracker.set_anchor(TicketKey(7), SectionPos::new(10, 0, 10));
        let (activated, deactivated) = tracker.drain();
        assert_eq!(activated.len(), 27);
        assert_eq!(deactivated.len(), 27);
        assert!(activated.contains(&SectionPos::new(10, 0, 10)));
        assert!(deactivated.contains(&SectionPos::new(0, 0, 0)));
    }

    #[test]
    fn test_shared_section_survives_one_anchor_leaving() {
        let mut tracker = SectionTracker::new(1);
        let spot = SectionPos::new(3, 3, 3);
        tracker.set_anchor(TicketKey(1), spot);
        tracker.set_anchor(TicketKey(2), spot);
        tracker.drain();
        assert_eq!(tracker.active_positions().len(), 27);

        tracker.clear_anchor(TicketKey(1));
        let (activated, deactivated) = tracker.drain();
        assert!(activated.is_empty() && deactivated.is_empty());

        tracker.clear_anchor(TicketKey(2));
        let (_, deactivated) = tracker.drain();
        assert_eq!(deactivated.len(), 27);
        assert!(tracker.active_positions().is_empty());
    }
}
