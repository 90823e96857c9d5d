//! Tickets: the demand side of the scheduler.
//!
//! Every reason a cell should stay resident is expressed as a [`Ticket`]
//! held against that cell. The [`TicketRegistry`] stores them and reduces
//! each cell to two numbers the propagation engine consumes: the minimum
//! level over all tickets, and the minimum over the simulation-driving
//! kinds.

pub mod registry;
pub mod types;

pub use registry::{TicketDelta, TicketRegistry};
pub use types::{Tick, Ticket, TicketKey, TicketKind};
