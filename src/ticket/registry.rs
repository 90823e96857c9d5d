//! Ticket storage and per-cell minimum bookkeeping.

use std::collections::HashMap;

use crate::cell::CellPos;
use crate::graph::Level;

use super::types::{Tick, Ticket, TicketKey, TicketKind};

/// What a registry mutation did to one cell's minimums.
///
/// Each field carries `(new_minimum, decreasing)` ready to feed straight
/// into the matching propagation field. `decreasing: false` updates are
/// issued even when the minimum did not move, because only the engine can
/// tell whether the cell's level was really resting on that source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TicketDelta {
    pub cell: CellPos,
    pub residency: Option<(Level, bool)>,
    pub simulation: Option<(Level, bool)>,
}

/// All live tickets, indexed by cell.
///
/// Per-cell lists stay sorted by `(level, kind, key)` so the minimum is the
/// first element and bulk operations can dedup in one pass.
pub struct TicketRegistry {
    tickets: HashMap<u64, Vec<Ticket>>,
    level_none: Level,
}

impl TicketRegistry {
    /// `level_none` is the sentinel reported for cells without tickets; it
    /// must match the propagation field's `level_count`.
    pub fn new(level_none: Level) -> Self {
        Self {
            tickets: HashMap::new(),
            level_none,
        }
    }

    /// The sentinel reported for cells without tickets.
    pub fn level_none(&self) -> Level {
        self.level_none
    }

    /// Minimum level over every ticket on `cell`, or the sentinel.
    pub fn min_level(&self, cell: CellPos) -> Level {
        match self.tickets.get(&cell.key()) {
            Some(list) => Self::mins(list, self.level_none).0,
            None => self.level_none,
        }
    }

    /// Minimum level over the simulation-driving tickets on `cell`.
    pub fn min_simulation_level(&self, cell: CellPos) -> Level {
        match self.tickets.get(&cell.key()) {
            Some(list) => Self::mins(list, self.level_none).1,
            None => self.level_none,
        }
    }

    pub fn ticket_count(&self) -> usize {
        self.tickets.values().map(Vec::len).sum()
    }

    pub fn cell_count(&self) -> usize {
        self.tickets.len()
    }

    pub fn tickets_at(&self, cell: CellPos) -> &[Ticket] {
        self.tickets
            .get(&cell.key())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn cells(&self) -> impl Iterator<Item = (CellPos, &[Ticket])> {
        self.tickets
            .iter()
            .map(|(&key, list)| (CellPos::from_key(key), list.as_slice()))
    }

    /// Adds a ticket. Re-adding an identical `(kind, level, key)` refreshes
    /// its timestamp and expiry in place.
    ///
    /// Returns a delta only when a minimum actually improved.
    pub fn add(&mut self, cell: CellPos, ticket: Ticket) -> Option<TicketDelta> {
        let level_none = self.level_none;
        let list = self.tickets.entry(cell.key()).or_default();
        let (old_res, old_sim) = Self::mins(list, level_none);

        if let Some(existing) = list
            .iter_mut()
            .find(|t| t.same_identity(ticket.kind, ticket.level, ticket.key))
        {
            existing.created_at = ticket.created_at;
            existing.expiry = ticket.expiry;
            return None;
        }

        let at = list.partition_point(|t| Self::order_key(t) <= Self::order_key(&ticket));
        list.insert(at, ticket);
        let (new_res, new_sim) = Self::mins(list, level_none);

        let delta = TicketDelta {
            cell,
            residency: (new_res < old_res).then_some((new_res, true)),
            simulation: (new_sim < old_sim).then_some((new_sim, true)),
        };
        (delta.residency.is_some() || delta.simulation.is_some()).then_some(delta)
    }

    /// Removes the ticket with this exact identity, if present.
    ///
    /// A successful removal always yields a `decreasing: false` residency
    /// entry, even when the minimum is unchanged; whether the cell's level
    /// actually rested on this ticket is the engine's call.
    pub fn remove(
        &mut self,
        cell: CellPos,
        kind: TicketKind,
        level: Level,
        key: TicketKey,
    ) -> Option<TicketDelta> {
        let level_none = self.level_none;
        let list = self.tickets.get_mut(&cell.key())?;
        let at = list.iter().position(|t| t.same_identity(kind, level, key))?;
        let removed = list.remove(at);
        let (new_res, new_sim) = Self::mins(list, level_none);
        if list.is_empty() {
            self.tickets.remove(&cell.key());
        }
        Some(TicketDelta {
            cell,
            residency: Some((new_res, false)),
            simulation: removed
                .kind
                .drives_simulation()
                .then_some((new_sim, false)),
        })
    }

    /// Drops every ticket whose lifetime has elapsed. Returns the per-cell
    /// deltas plus the number of tickets dropped.
    pub fn purge_expired(&mut self, now: Tick) -> (Vec<TicketDelta>, usize) {
        let level_none = self.level_none;
        let mut deltas = Vec::new();
        let mut purged = 0;
        self.tickets.retain(|&key, list| {
            if !list.iter().any(|t| t.expired(now)) {
                return true;
            }
            let dropped_sim = list
                .iter()
                .any(|t| t.expired(now) && t.kind.drives_simulation());
            let before = list.len();
            list.retain(|t| !t.expired(now));
            purged += before - list.len();
            let (new_res, new_sim) = Self::mins(list, level_none);
            deltas.push(TicketDelta {
                cell: CellPos::from_key(key),
                residency: Some((new_res, false)),
                simulation: dropped_sim.then_some((new_sim, false)),
            });
            !list.is_empty()
        });
        (deltas, purged)
    }

    /// Moves every ticket of `kind` to `level` in one sweep, e.g. when a
    /// global view-distance style setting changes.
    ///
    /// The whole move is applied before any delta is computed, so each cell
    /// reports one net change rather than a remove/add pair.
    pub fn set_kind_level(&mut self, kind: TicketKind, level: Level) -> Vec<TicketDelta> {
        let level_none = self.level_none;
        let mut deltas = Vec::new();
        for (&key, list) in self.tickets.iter_mut() {
            if !list.iter().any(|t| t.kind == kind) {
                continue;
            }
            let (old_res, old_sim) = Self::mins(list, level_none);
            for t in list.iter_mut() {
                if t.kind == kind {
                    t.level = level;
                }
            }
            list.sort_by_key(Self::order_key);
            list.dedup_by(|a, b| a.same_identity(b.kind, b.level, b.key));
            let (new_res, new_sim) = Self::mins(list, level_none);

            let delta = TicketDelta {
                cell: CellPos::from_key(key),
                residency: (new_res != old_res).then_some((new_res, new_res < old_res)),
                simulation: (new_sim != old_sim).then_some((new_sim, new_sim < old_sim)),
            };
            if delta.residency.is_some() || delta.simulation.is_some() {
                deltas.push(delta);
            }
        }
        deltas
    }

    fn order_key(t: &Ticket) -> (Level, u8, u64) {
        (t.level, t.kind.rank(), t.key.0)
    }

    /// `(residency_min, simulation_min)` for one cell's sorted list.
    fn mins(list: &[Ticket], level_none: Level) -> (Level, Level) {
        let res = list
            .first()
            .map_or(level_none, |t| t.level.min(level_none));
        let sim = list
            .iter()
            .filter(|t| t.kind.drives_simulation())
            .map(|t| t.level.min(level_none))
            .min()
            .unwrap_or(level_none);
        (res, sim)
    }
}

// ============================================================================
// Tests
// ============================================================================
