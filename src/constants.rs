//! # Constants
//!
//! Constants used throughout the application.

/// Local host IPv4 address, used when binding the listener.
pub const LOCAL_SOCKET_ADDR_STR: &str = "127.0.0.1";

/// Default listening port if none is given on the command line.
pub const DEFAULT_PORT: u16 = 6379;

/// Default cap on simultaneously connected clients.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;

/// How long [`crate::server::Server::acquire_socket_permit`] waits for a
/// connection permit before giving up on a pending accept.
pub const CONNECTION_PERMIT_TIMEOUT_MS: u64 = 5_000;

/// Application exit codes.
#[derive(Debug, Clone, Copy)]
pub enum ExitCode {
    Ok = 0,
    Shutdown = -1,
}
