//! # Errors
//!
//! Typed error enums for each module boundary, plus the `anyhow`-based
//! error the binary surfaces at its edge. Mirrors the teacher's split: a
//! `thiserror` enum per library concern, `anyhow::Error` only where the
//! application stops being a library.

use thiserror::Error;

/// Errors raised while decoding RESP bytes (C2, §4.2).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RespError {
    #[error("missing the CR (\\r) character")]
    CrMissing,

    #[error("missing the LF (\\n) character")]
    LfMissing,

    #[error("CRLF (\\r\\n) characters not present at end")]
    CrlfNotAtEnd,

    #[error("received negative length")]
    NegativeLength,

    #[error("unsupported RESP type: {0}")]
    UnsupportedType(u8),

    #[error("couldn't parse '{0}' to integer")]
    IntegerParse(String),

    #[error("a decode panic was caught and treated as a protocol error")]
    DecodePanic,
}

/// Distinguishes the two ways a parse step can fail, per spec.md §7: a
/// protocol error resets parser state and the stream continues; an I/O
/// error terminates the stream after this one frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Protocol(#[from] RespError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by [`crate::connection::ConnState::write`] / `close`.
#[derive(Debug, Error)]
pub enum ConnError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors an engine implementation may need to signal that do not already
/// have a dedicated [`crate::resp::reply::ErrorReply`] variant.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("wrong kind of value")]
    WrongType,

    #[error("no such key")]
    NoSuchKey,

    #[error("value is not an integer or out of range")]
    NotAnInteger,

    #[error("value is not a valid float")]
    NotAFloat,

    #[error("{0}")]
    Other(String),
}

/// Errors raised by the server shell (out of core scope, kept minimal).
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("timed out acquiring a connection permit after {0}")]
    Elapsed(String),

    #[error("connection semaphore closed")]
    AcquireError,
}

/// Top-level error surfaced by `main`.
#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
