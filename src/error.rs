//! Error types
//!
//! Producer tasks (GPS feed, card signal) never surface errors past their own
//! loop. `JourneyError` is what the journey controller returns when persisted
//! state can no longer be trusted, and is fatal to the process.

use crate::domain::types::RouteId;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, JourneyError>;

#[derive(Debug, Error)]
pub enum JourneyError {
    #[error("ledger io error on {path}: {source}")]
    LedgerIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt ledger {path}: {reason}")]
    CorruptLedger { path: PathBuf, reason: String },
    #[error("path log io error on {path}: {source}")]
    PathLogIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unrecognised path log file name: {name}")]
    BadPathLogName { name: String },
    #[error("route {route_id} has more than one path log: {names:?}")]
    DuplicatePathLog { route_id: RouteId, names: Vec<String> },
    #[error("path log {path} is truncated: {reason}")]
    TruncatedPathLog { path: PathBuf, reason: String },
    #[error("malformed path log row {line} in {path}: {reason}")]
    MalformedPathLogRow { path: PathBuf, line: usize, reason: String },
    #[error("card signal channel closed")]
    SignalChannelClosed,
    #[error("no active route")]
    NoActiveRoute,
}

/// Reasons a GPS sentence yields no position
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RmcError {
    #[error("not an RMC sentence")]
    NotRmc,
    #[error("checksum mismatch: expected {expected:02X}, computed {computed:02X}")]
    Checksum { expected: u8, computed: u8 },
    #[error("receiver reports no valid fix")]
    VoidFix,
    #[error("missing or malformed field `{0}`")]
    Field(&'static str),
}
