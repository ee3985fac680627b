//! Error types for tally-group.

use std::fmt;
use std::io;

use crate::op::OpId;

/// Errors that can occur in process-group operations.
///
/// Contract violations (a wrong root, mismatched buffer sizes, point-to-point
/// calls on a single participant) are programming errors and panic instead.
#[derive(Debug)]
pub enum GroupError {
    /// Transport-level error (TCP, framing, runtime).
    Transport(String),
    /// RPC call failed.
    Rpc(String),
    /// The coordinator rejected or could not complete a collective round.
    Collective(String),
    /// The coordinator refused this participant during the handshake.
    Handshake(String),
    /// A custom reduction operator is not registered.
    UnknownOp(OpId),
    /// A buffer does not hold a whole number of records for a custom operator.
    Misaligned { op: OpId, width: usize, len: usize },
    /// The group configuration is unusable.
    InvalidConfig(String),
    /// I/O error while setting up the transport.
    Io(io::Error),
}

impl fmt::Display for GroupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Rpc(msg) => write!(f, "rpc error: {msg}"),
            Self::Collective(msg) => write!(f, "collective failed: {msg}"),
            Self::Handshake(msg) => write!(f, "handshake rejected: {msg}"),
            Self::UnknownOp(id) => write!(f, "unknown reduction operator {id}"),
            Self::Misaligned { op, width, len } => write!(
                f,
                "buffer of {len} elements is not a whole number of {width}-element records for {op}"
            ),
            Self::InvalidConfig(msg) => write!(f, "invalid group configuration: {msg}"),
            Self::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

impl std::error::Error for GroupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for GroupError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<tokio::task::JoinError> for GroupError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Transport(e.to_string())
    }
}
