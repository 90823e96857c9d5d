//! Scheduler counters.
//!
//! Plain atomics bumped from the orchestrator and read from anywhere via
//! [`SchedulerStats::snapshot`]. Counters only ever go up; rates are the
//! reader's job.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lifetime totals for one scheduler instance.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    tickets_added: AtomicU64,
    tickets_removed: AtomicU64,
    tickets_expired: AtomicU64,
    propagation_applied: AtomicU64,
    records_created: AtomicU64,
    records_reclaimed: AtomicU64,
    records_unloaded: AtomicU64,
    stages_completed: AtomicU64,
    stages_failed: AtomicU64,
    saves_completed: AtomicU64,
    save_failures: AtomicU64,
}

impl SchedulerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_ticket_added(&self) {
        self.tickets_added.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ticket_removed(&self) {
        self.tickets_removed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_tickets_expired(&self, count: u64) {
        self.tickets_expired.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_propagation_applied(&self, count: u64) {
        self.propagation_applied.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_record_created(&self) {
        self.records_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_record_reclaimed(&self) {
        self.records_reclaimed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_record_unloaded(&self) {
        self.records_unloaded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stage_completed(&self) {
        self.stages_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stage_failed(&self) {
        self.stages_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_save_completed(&self) {
        self.saves_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_save_failure(&self) {
        self.save_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tickets_added: self.tickets_added.load(Ordering::Relaxed),
            tickets_removed: self.tickets_removed.load(Ordering::Relaxed),
            tickets_expired: self.tickets_expired.load(Ordering::Relaxed),
            propagation_applied: self.propagation_applied.load(Ordering::Relaxed),
            records_created: self.records_created.load(Ordering::Relaxed),
            records_reclaimed: self.records_reclaimed.load(Ordering::Relaxed),
            records_unloaded: self.records_unloaded.load(Ordering::Relaxed),
            stages_completed: self.stages_completed.load(Ordering::Relaxed),
            stages_failed: self.stages_failed.load(Ordering::Relaxed),
            saves_completed: self.saves_completed.load(Ordering::Relaxed),
            save_failures: self.save_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub tickets_added: u64,
    pub tickets_removed: u64,
    pub tickets_expired: u64,
    pub propagation_applied: u64,
    pub records_created: u64,
    pub records_reclaimed: u64,
    pub records_unloaded: u64,
    pub stages_completed: u64,
    pub stages_failed: u64,
    pub saves_completed: u64,
    pub save_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = SchedulerStats::new();
        stats.record_ticket_added();
        stats.record_ticket_added();
        stats.record_tickets_expired(3);
        stats.record_record_created();
        stats.record_save_failure();

        let snap = stats.snapshot();
        assert_eq!(snap.tickets_added, 2);
        assert_eq!(snap.tickets_expired, 3);
        assert_eq!(snap.records_created, 1);
        assert_eq!(snap.save_failures, 1);
        assert_eq!(snap.records_unloaded, 0);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let stats = SchedulerStats::new();
        let before = stats.snapshot();
        stats.record_stage_completed();
        assert_eq!(before.stages_completed, 0);
        assert_eq!(stats.snapshot().stages_completed, 1);
    }
}
