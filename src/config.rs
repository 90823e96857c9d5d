//! Scheduler tuning knobs.

use crate::graph::Level;
use crate::stage::{StageId, StagePlan};
use crate::ticket::Tick;

/// Everything the orchestrator needs to know up front.
///
/// The defaults describe a medium world: a four-stage ladder, full cells at
/// level 33 and below, simulation two levels tighter, and budgets sized so
/// one tick never monopolizes the runtime.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// The staged readiness ladder.
    pub plan: StagePlan,
    /// Cells at or below this level target the final stage.
    pub full_stage_level: Level,
    /// Cells at or below this level simulate, when a driving ticket reaches
    /// them through the simulation field.
    pub simulation_level: Level,
    /// Section activity threshold in the 3D field; sections within this
    /// many steps of an anchor are reported active.
    pub section_active_radius: Level,
    /// Size of every level field. Levels run `0..level_count` with
    /// `level_count` itself meaning "no level".
    pub level_count: Level,
    /// In-flight cell cap for the generation worker.
    pub generation_cap: usize,
    /// In-flight cell cap for the save/flush worker.
    pub maintenance_cap: usize,
    /// Level-field updates applied per tick.
    pub propagation_budget: usize,
    /// Unload flushes started per tick.
    pub unload_budget: usize,
    /// Background saves started per tick.
    pub save_budget: usize,
    /// Minimum ticks between two saves of the same cell.
    pub save_cooldown: Tick,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let plan = StagePlan::standard();
        // Room for the scaffolding margin plus one band of "tracked but
        // empty" cells beyond it.
        let level_count = 33 + plan.margin() + 2;
        Self {
            plan,
            full_stage_level: 33,
            simulation_level: 31,
            section_active_radius: 2,
            level_count,
            generation_cap: 8,
            maintenance_cap: 4,
            propagation_budget: 1024,
            unload_budget: 16,
            save_budget: 8,
            save_cooldown: 200,
        }
    }
}

impl SchedulerConfig {
    /// Replaces the stage plan and re-derives `level_count` from its margin.
    pub fn with_plan(mut self, plan: StagePlan) -> Self {
        self.level_count = self.full_stage_level + plan.margin() + 2;
        self.plan = plan;
        self
    }

    pub fn with_caps(mut self, generation: usize, maintenance: usize) -> Self {
        self.generation_cap = generation;
        self.maintenance_cap = maintenance;
        self
    }

    pub fn with_budgets(mut self, propagation: usize, unload: usize, save: usize) -> Self {
        self.propagation_budget = propagation;
        self.unload_budget = unload;
        self.save_budget = save;
        self
    }

    pub fn with_save_cooldown(mut self, ticks: Tick) -> Self {
        self.save_cooldown = ticks;
        self
    }

    /// Highest level at which a record exists at all. Anything above holds
    /// no stages and is a candidate for unload.
    pub fn max_resident_level(&self) -> Level {
        self.full_stage_level + self.plan.margin()
    }

    /// Highest stage a record at `level` should reach, or `None` when the
    /// level keeps no content resident.
    pub fn target_stage(&self, level: Level) -> Option<StageId> {
        if level <= self.full_stage_level {
            return Some(self.plan.last());
        }
        self.plan.target_for_offset(level - self.full_stage_level)
    }

    /// Queue band for a record at `level`.
    pub fn band_for(&self, level: Level) -> usize {
        level.min(self.level_count - 1) as usize
    }

    /// Number of priority bands in each worker queue.
    pub fn band_count(&self) -> usize {
        self.level_count as usize
    }

    /// Sanity-checks relationships the rest of the scheduler assumes.
    ///
    /// # Panics
    ///
    /// Panics when thresholds fall outside the level field or a cap or
    /// budget is zero.
    pub(crate) fn validate(&self) {
        // Each activity field spans `threshold + 2` levels and a level field
        // tops out at 254. Checked here so a bad threshold fails with the
        // knob's name instead of deep in field construction.
        assert!(
            self.simulation_level < Level::MAX - 2,
            "simulation level {} leaves no room for its activity field",
            self.simulation_level
        );
        assert!(
            self.section_active_radius < Level::MAX - 2,
            "section radius {} leaves no room for its activity field",
            self.section_active_radius
        );
        assert!(
            self.max_resident_level() < self.level_count,
            "level_count {} too small for full level {} plus margin {}",
            self.level_count,
            self.full_stage_level,
            self.plan.margin()
        );
        assert!(
            self.simulation_level <= self.full_stage_level,
            "simulation must not outrun full residency"
        );
        assert!(self.generation_cap > 0, "generation cap must be positive");
        assert!(self.maintenance_cap > 0, "maintenance cap must be positive");
        assert!(self.propagation_budget > 0, "propagation budget must be positive");
        assert!(self.unload_budget > 0, "unload budget must be positive");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::StageSpec;

    #[test]
    fn test_default_config_is_valid() {
        let config = SchedulerConfig::default();
        config.validate();
        assert_eq!(config.max_resident_level(), 37);
        assert_eq!(config.level_count, 39);
    }

    #[test]
    fn test_target_stage_follows_the_ladder() {
        let config = SchedulerConfig::default();
        let last = config.plan.last();
        assert_eq!(config.target_stage(0), Some(last));
        assert_eq!(config.target_stage(33), Some(last));
        assert_eq!(config.target_stage(34), Some(StageId(2)));
        assert_eq!(config.target_stage(35), Some(StageId(2)));
        assert_eq!(config.target_stage(36), Some(StageId(1)));
        assert_eq!(config.target_stage(37), Some(StageId(0)));
        assert_eq!(config.target_stage(38), None);
    }

    #[test]
    #[should_panic(expected = "simulation level")]
    fn test_validate_rejects_simulation_level_without_field_room() {
        let config = SchedulerConfig {
            full_stage_level: 253,
            simulation_level: 253,
            ..SchedulerConfig::default()
        };
        config.validate();
    }

    #[test]
    #[should_panic(expected = "section radius")]
    fn test_validate_rejects_oversized_section_radius() {
        let config = SchedulerConfig {
            section_active_radius: 253,
            ..SchedulerConfig::default()
        };
        config.validate();
    }

    #[test]
    fn test_with_plan_rederives_level_count() {
        let config = SchedulerConfig::default().with_plan(StagePlan::new(vec![
            StageSpec::new("only", 0),
        ]));
        assert_eq!(config.max_resident_level(), 33);
        assert_eq!(config.level_count, 35);
        config.validate();
    }
}
