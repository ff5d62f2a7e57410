#![deny(unsafe_code)]

//! Wire format shared by the allocator and worker nodes.
//!
//! Every message is a 3-byte header `[type][total_length][sender]` followed by
//! `total_length - 3` body bytes. [`Frame`] is the raw form, [`Message`] the
//! typed one. Pages are larger than a single frame can carry, so page contents
//! travel as a run of [`PageChunk`]s.

mod chunk;
mod error;
mod frame;
mod message;
mod types;

pub use chunk::*;
pub use error::*;
pub use frame::*;
pub use message::*;
pub use types::*;
