//! Error types and the status-code taxonomy.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Status codes surfaced through callbacks and the write path.
///
/// These are returned values, never panics: the engine reports the outcome of
/// an operation and the caller decides what to do with it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Ok,
    /// Transient precondition failure; retrying later may succeed.
    Again,
    /// Version conflict: the supplied base version is behind the state.
    Stale,
    /// Backpressure: too many operations already queued.
    NoBufs,
    /// The configuration prohibits this operation.
    NotSupported,
    /// Decode failure.
    BadMsg,
    /// A timer fired before the operation completed.
    TimedOut,
    /// Generic failure.
    Failed,
    NotFound,
    InProgress,
    TooBig,
    Empty,
    UpToDate,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Ok => "OK",
            Status::Again => "AGAIN",
            Status::Stale => "STALE",
            Status::NoBufs => "NOBUFS",
            Status::NotSupported => "NOTSUPPORTED",
            Status::BadMsg => "BADMSG",
            Status::TimedOut => "TIMEDOUT",
            Status::Failed => "FAILED",
            Status::NotFound => "NOTFOUND",
            Status::InProgress => "INPROGRESS",
            Status::TooBig => "TOOBIG",
            Status::Empty => "EMPTY",
            Status::UpToDate => "UPTODATE",
        };
        f.write_str(name)
    }
}

/// Errors produced while decoding wire payloads or user state.
#[derive(Debug, Error)]
pub enum RsmError {
    #[error("truncated snapshot header ({0} bytes)")]
    TruncatedSnapshotHeader(usize),

    #[error("unsupported snapshot format version {0}")]
    UnsupportedFormatVersion(u8),

    #[error("snapshot compression failed: {0}")]
    Compress(String),

    #[error("snapshot decompression failed: {0}")]
    Decompress(String),

    #[error("state decode failed: {0}")]
    StateDecode(String),

    #[error("delta decode failed: {0}")]
    DeltaDecode(String),
}

impl RsmError {
    /// The status code this error maps to when reported through callbacks.
    pub fn status(&self) -> Status {
        Status::BadMsg
    }
}

/// Result type for engine decode paths.
pub type Result<T> = std::result::Result<T, RsmError>;
