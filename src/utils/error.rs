//! Unified error type for the coordinator membership subsystem.

use std::fmt;
use std::io;
use std::net;

use crate::ids::ServerId;

/// Errors surfaced by the coordinator server list.
///
/// Only `NoSuchServer` is ever returned to inbound API callers for semantic
/// reasons; the other variants describe infrastructure failures. A `Journal`
/// error means the replicated log rejected an append or invalidate, which the
/// coordinator treats as fatal (fail-stop): callers should tear the process
/// down and rely on replay.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum RosterError {
    /// The id does not name a live entry (unknown index or stale generation).
    NoSuchServer(ServerId),

    /// An outbound RPC failed to send, timed out, or lost its connection.
    Transport(String),

    /// The replicated log rejected an operation. Fatal by design.
    Journal(String),

    /// Fewer than three eligible backups exist; group formation is retried
    /// when membership next changes.
    ReplicationGroupImpossible,

    /// Anything else, carried as its string representation.
    Msg(String),
}

impl RosterError {
    /// Wraps any displayable value as a `Msg` error.
    pub fn msg(e: impl fmt::Display) -> Self {
        RosterError::Msg(e.to_string())
    }
}

impl fmt::Display for RosterError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RosterError::NoSuchServer(id) => {
                write!(f, "no such server: {}", id)
            }
            RosterError::Transport(s) => write!(f, "transport failure: {}", s),
            RosterError::Journal(s) => write!(f, "journal failure: {}", s),
            RosterError::ReplicationGroupImpossible => {
                write!(f, "not enough free backups for a replication group")
            }
            RosterError::Msg(s) => write!(f, "{}", s),
        }
    }
}

impl std::error::Error for RosterError {}

// Helper macro saving boiler-plate `impl From<T>`s for transparent conversion
// from common library error types to `RosterError::Msg`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for RosterError {
            fn from(e: $error) -> Self {
                RosterError::Msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::sync::watch::error::RecvError);
impl_from_error!(tokio::task::JoinError);

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for RosterError {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        RosterError::Msg(e.to_string())
    }
}

impl<T> From<tokio::sync::watch::error::SendError<T>> for RosterError {
    fn from(e: tokio::sync::watch::error::SendError<T>) -> Self {
        RosterError::Msg(e.to_string())
    }
}
