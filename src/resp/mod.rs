//! # RESP: Redis Serialization Protocol
//!
//! Split into the two components spec.md treats separately: [`reply`] (C1,
//! the typed reply model and its wire serialization) and [`parser`] (C2,
//! the incremental decoder). Grounded on the teacher's `src/resp.rs`, which
//! combined both concerns in one file; here they are pulled apart along the
//! same seam the specification draws.

pub mod parser;
pub mod reply;

pub use parser::{parse_one, FramedReader};
pub use reply::{ErrorReply, Reply};
