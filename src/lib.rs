//! RegionFlow - Ticket-driven region lifecycle scheduling
//!
//! This library keeps a grid of world cells loaded, generated, simulated,
//! saved, and unloaded in response to tickets. Tickets seed a level field
//! that spreads to neighboring cells; levels decide which generation stage
//! each cell targets, and a tick-driven orchestrator moves every cell
//! toward its target through prioritized worker lanes.
//!
//! # High-Level API
//!
//! For most use cases, the [`scheduler`] module provides the facade:
//!
//! ```ignore
//! use std::sync::Arc;
//! use regionflow::cell::CellPos;
//! use regionflow::config::SchedulerConfig;
//! use regionflow::scheduler::RegionScheduler;
//! use regionflow::store::MemoryStore;
//! use regionflow::ticket::{Ticket, TicketKey, TicketKind};
//!
//! let scheduler = RegionScheduler::new(
//!     SchedulerConfig::default(),
//!     Arc::new(MemoryStore::new()),
//!     generator,
//!     observer,
//! );
//! let handle = scheduler.handle();
//!
//! handle.add_ticket(
//!     CellPos::new(0, 0),
//!     Ticket::new(TicketKind::Player, 31, TicketKey(1), 0),
//! )?;
//! handle.tick(1).await?;
//! let content = handle.await_stage(CellPos::new(0, 0), plan.last()).await?;
//! ```

pub mod cell;
pub mod config;
pub mod error;
pub mod generator;
pub mod graph;
pub mod holder;
pub mod logging;
pub mod observer;
pub mod queue;
pub mod scheduler;
pub mod stage;
pub mod stats;
pub mod store;
pub mod ticket;

/// Version of the RegionFlow library.
///
/// The version is defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
