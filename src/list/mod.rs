//! In-memory server-list state: entries, the update history, and the core
//! state machine driven by the coordinator's operations and updater.

mod core;
mod entry;
mod updates;

pub use self::core::{RosterCore, ScanMetadata, WorkUnit};
pub use entry::Entry;
pub use updates::UpdatePair;

use crate::ids::{ServerId, ServiceMask};

use serde::{Deserialize, Serialize};

/// Version number of servers that have never been sent any update.
pub const UNINITIALIZED_VERSION: u64 = 0;

/// Maximum number of incremental updates batched into one RPC.
pub const MAX_UPDATES_PER_RPC: usize = 100;

/// Kind of membership change delivered to registered trackers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackerEventKind {
    /// A server enlisted.
    Add,

    /// A server was declared crashed.
    Crashed,

    /// A server finished recovery and left the list.
    Removed,
}

/// One membership change, delivered to trackers in exactly the order it was
/// applied to the local list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerEvent {
    /// What happened.
    pub kind: TrackerEventKind,

    /// Which server it happened to.
    pub server_id: ServerId,

    /// The server's services.
    pub services: ServiceMask,

    /// The server's locator string.
    pub service_locator: String,
}
