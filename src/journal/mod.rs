//! Durability journal: record types and the replicated-log client interface.
//!
//! Every membership mutation is appended to an external linearizable log
//! before it is externalized, and the coordinator rebuilds its whole state by
//! replaying the live records after a restart. Records for the same server
//! form a chain: each append names the entry ids it supersedes, so the log's
//! live set stays bounded by the set of live servers.

mod filelog;
mod memlog;

pub use filelog::FileLog;
pub use memlog::MemLog;

use crate::ids::{ServerId, ServiceMask};
use crate::utils::RosterError;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Stable identifier of one record in the replicated log. Strictly
/// increasing in append order; consumers may rely on monotonicity.
pub type EntryId = u64;

/// One durable membership record.
///
/// The `update_version` fields carry the server-list version at which the
/// corresponding change is (or will be) published; replay uses the maximum
/// of all observed versions to restore the version counter so no version is
/// ever reused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    /// A server finished enlisting; written before the new id becomes
    /// externally visible. Replay recreates the entry as UP without
    /// publishing anything.
    ServerUp {
        server_id: ServerId,
        services: ServiceMask,
        service_locator: String,
        read_speed_mbs: u32,
        update_version: u64,
    },

    /// The enlistment above still has to be announced to the cluster.
    /// Invalidated once every updatable member has confirmed the version.
    ServerUpUpdate {
        server_id: ServerId,
        update_version: u64,
    },

    /// Latest server-list version; re-appended (superseding its predecessor)
    /// on every version bump.
    ServerListVersion { version: u64 },

    /// A server was declared crashed. Replay re-schedules its crash
    /// recovery.
    ServerCrashed {
        server_id: ServerId,
        update_version: u64,
    },

    /// Crash recovery for this server has started but not completed; replay
    /// must start it over. Invalidated when recovery completes.
    ServerNeedsRecovery { server_id: ServerId },

    /// Recovery completed; the REMOVE for this server still has to reach the
    /// cluster. Invalidated, along with the entry's whole chain, once the
    /// removal is confirmed everywhere.
    ServerRemoveUpdate {
        server_id: ServerId,
        update_version: u64,
    },

    /// Replacement of the opaque master-recovery blob for a server. Not
    /// published to the cluster.
    ServerUpdate {
        server_id: ServerId,
        recovery_info: Vec<u8>,
    },

    /// A server's replication group assignment changed.
    ServerReplicationUpdate {
        server_id: ServerId,
        replication_id: u64,
        update_version: u64,
    },

    /// The replication change above still has to be announced to the
    /// cluster. Invalidated once the version is confirmed everywhere.
    ServerReplicationUpUpdate {
        server_id: ServerId,
        update_version: u64,
    },
}

impl Record {
    /// The server a record is about, if any.
    pub fn server_id(&self) -> Option<ServerId> {
        match *self {
            Record::ServerUp { server_id, .. }
            | Record::ServerUpUpdate { server_id, .. }
            | Record::ServerCrashed { server_id, .. }
            | Record::ServerNeedsRecovery { server_id }
            | Record::ServerRemoveUpdate { server_id, .. }
            | Record::ServerUpdate { server_id, .. }
            | Record::ServerReplicationUpdate { server_id, .. }
            | Record::ServerReplicationUpUpdate { server_id, .. } => {
                Some(server_id)
            }
            Record::ServerListVersion { .. } => None,
        }
    }

    /// The published version a record carries, if any.
    pub fn update_version(&self) -> Option<u64> {
        match *self {
            Record::ServerUp { update_version, .. }
            | Record::ServerUpUpdate { update_version, .. }
            | Record::ServerCrashed { update_version, .. }
            | Record::ServerRemoveUpdate { update_version, .. }
            | Record::ServerReplicationUpdate { update_version, .. }
            | Record::ServerReplicationUpUpdate { update_version, .. } => {
                Some(update_version)
            }
            Record::ServerListVersion { version } => Some(version),
            Record::ServerNeedsRecovery { .. } | Record::ServerUpdate { .. } => {
                None
            }
        }
    }
}

/// Client handle onto the external replicated log.
///
/// The log is linearizable and append-only; appends return strictly
/// increasing entry ids. An append may atomically invalidate a set of older
/// records, which is how per-server chains stay short. Implementations must
/// treat any failure as fatal to the coordinator (fail-stop); there is no
/// internal retry.
#[async_trait]
pub trait LogClient: Send + Sync {
    /// Appends one record, atomically invalidating `invalidates` if
    /// non-empty. Returns the new record's entry id.
    async fn append(
        &self,
        record: Record,
        invalidates: &[EntryId],
    ) -> Result<EntryId, RosterError>;

    /// Invalidates a set of records without appending anything.
    async fn invalidate(&self, ids: &[EntryId]) -> Result<(), RosterError>;

    /// Reads all live records in entry-id order. Used only during replay.
    async fn read_all(&self) -> Result<Vec<(EntryId, Record)>, RosterError>;
}
