#![deny(unsafe_code)]

//! Worker side of the shared-memory protocol.
//!
//! [`Node`] registers with the allocator and exposes the shared region as
//! plain `read`/`write` calls. Pages live in a local [`Region`]; touching a
//! page without the right access sends a READ_FAULT or WRITE_FAULT and
//! installs the returned contents, the same contract a signal-based fault
//! handler would honour. A background task answers the allocator's page
//! requests and invalidations while the caller is blocked.

mod client;
mod error;
mod region;

pub use client::*;
pub use error::*;
pub use region::*;
