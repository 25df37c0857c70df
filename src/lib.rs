//! Cluster coordinator membership subsystem for a distributed in-memory
//! storage system.
//!
//! The crate holds the coordinator's authoritative server list: it
//! allocates `(index, generation)` server ids, journals every membership
//! mutation in an external replicated log before externalizing it, pushes
//! incremental and full list updates to every live member with at most one
//! RPC in flight per target, and rebuilds all of its state by replaying the
//! journal after a coordinator restart.

#![allow(clippy::uninlined_format_args)]

#[macro_use]
mod utils;

mod coord;
mod ids;
mod journal;
mod list;
mod message;
mod transport;

pub use coord::{
    Context, CrashPoints, NullRecoveryManager, RecoveryManager, Roster,
    RosterConfig,
};
pub use ids::{Service, ServerId, ServerStatus, ServiceMask};
pub use journal::{EntryId, FileLog, LogClient, MemLog, Record};
pub use list::{
    Entry, TrackerEvent, TrackerEventKind, UpdatePair, MAX_UPDATES_PER_RPC,
    UNINITIALIZED_VERSION,
};
pub use message::{
    EntryMsg, ListKind, ListMessage, ListPayload, UpdateReply,
};
pub use transport::{
    MockSessionFactory, Session, SessionFactory, TcpSessionFactory,
};
pub use utils::RosterError;
