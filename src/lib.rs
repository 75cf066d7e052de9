//! # RESP Protocol Engine
//!
//! The core of a Redis-compatible in-memory data server: the RESP wire
//! codec ([`resp`]), per-connection transaction/auth state ([`connection`]),
//! the command dispatcher tying them together ([`dispatch`]), the keyspace
//! contract it drives ([`engine`]), a minimal reference keyspace
//! implementing that contract ([`keyspace`]), and the thin TCP server shell
//! ([`server`]) that wires all of the above into a runnable binary.

pub mod cli;
pub mod connection;
pub mod constants;
pub mod dispatch;
pub mod engine;
pub mod errors;
pub mod keyspace;
#[macro_use]
pub mod macros;
pub mod resp;
pub mod server;
