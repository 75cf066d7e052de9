//! # The Command-Line Arguments

use crate::constants::{DEFAULT_MAX_CONNECTIONS, DEFAULT_PORT};
use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "RESP Engine")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// The server's listening port.
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Maximum number of simultaneously connected clients.
    #[arg(short, long, default_value_t = DEFAULT_MAX_CONNECTIONS)]
    pub max_conn: usize,

    /// Optional password stored on each accepted connection. Not enforced
    /// by this crate: individual command handlers (including AUTH) are out
    /// of scope per spec.md §1 (see SPEC_FULL.md's AUTH note).
    #[arg(long, default_value = "")]
    pub password: String,
}
