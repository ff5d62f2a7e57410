#![deny(unsafe_code)]

//! The allocator side of the shared-memory protocol.
//!
//! A [`Coordinator`] owns the [`PageTable`] and the [`ConnectionRegistry`] for
//! the whole run. It admits `total_nodes` workers, then serves their requests
//! one at a time: allocations, barriers, broadcasts and page faults.
//! Collectives and faults are driven as explicit state machines
//! ([`Rendezvous`], [`FaultResolution`]) so ordinary traffic keeps flowing
//! while they wait.

mod collective;
mod config;
mod coordinator;
mod dispatch;
mod error;
mod fault;
mod page_table;
mod queue;
mod registry;
mod stats;

pub use collective::*;
pub use config::*;
pub use coordinator::*;
pub use dispatch::*;
pub use error::*;
pub use fault::*;
pub use page_table::*;
pub use queue::*;
pub use registry::*;
pub use stats::*;

/// Tracing target for the human-readable operations trace
/// (allocations, faults, ownership changes).
pub const OPS_TARGET: &str = "dsm::ops";
