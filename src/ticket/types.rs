//! Ticket value types.

use std::fmt;

use crate::graph::Level;

/// Scheduler time, advanced externally one tick at a time.
pub type Tick = u64;

/// What kind of actor is asking for the cell.
///
/// Kinds matter in two places: bulk re-homing moves every ticket of one kind
/// at once, and only some kinds drive the simulation field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TicketKind {
    /// Follows a player-like observer around.
    Player,
    /// Pinned by an operator; keeps the cell resident but not simulating.
    Forced,
    /// Demands active simulation, e.g. around an ongoing event.
    Simulation,
    /// Startup anchor around the world origin.
    Bootstrap,
}

impl TicketKind {
    /// Whether tickets of this kind feed the simulation field in addition
    /// to the residency field.
    pub fn drives_simulation(self) -> bool {
        matches!(self, TicketKind::Player | TicketKind::Simulation)
    }

    pub(crate) fn rank(self) -> u8 {
        match self {
            TicketKind::Player => 0,
            TicketKind::Forced => 1,
            TicketKind::Simulation => 2,
            TicketKind::Bootstrap => 3,
        }
    }
}

impl fmt::Display for TicketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TicketKind::Player => "player",
            TicketKind::Forced => "forced",
            TicketKind::Simulation => "simulation",
            TicketKind::Bootstrap => "bootstrap",
        };
        f.write_str(name)
    }
}

/// Opaque discriminator so one source can hold several independent claims
/// of the same kind and level (say, two observers on the same cell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TicketKey(pub u64);

impl fmt::Display for TicketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One claim keeping a cell at or below a level.
///
/// Identity for removal purposes is `(kind, level, key)`. Re-adding an
/// identical ticket refreshes its timestamp instead of duplicating it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub kind: TicketKind,
    pub level: Level,
    pub key: TicketKey,
    pub created_at: Tick,
    /// Lifetime in ticks from `created_at`; `None` lives until removed.
    pub expiry: Option<Tick>,
}

impl Ticket {
    pub fn new(kind: TicketKind, level: Level, key: TicketKey, created_at: Tick) -> Self {
        Self {
            kind,
            level,
            key,
            created_at,
            expiry: None,
        }
    }

    pub fn with_expiry(mut self, ticks: Tick) -> Self {
        self.expiry = Some(ticks);
        self
    }

    pub fn expired(&self, now: Tick) -> bool {
        match self.expiry {
            Some(ticks) => now.saturating_sub(self.created_at) >= ticks,
            None => false,
        }
    }

    pub(crate) fn same_identity(&self, kind: TicketKind, level: Level, key: TicketKey) -> bool {
        self.kind == kind && self.level == level && self.key == key
    }
}
