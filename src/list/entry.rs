//! One server's entry in the coordinator server list.

use crate::ids::{Service, ServerId, ServerStatus, ServiceMask};
use crate::journal::EntryId;
use crate::list::UNINITIALIZED_VERSION;
use crate::message::EntryMsg;

/// Coordinator-side state for one enlisted server.
///
/// The `verified_version` / `update_version` pair implements a per-target
/// two-phase commit of pushed server-list updates:
///
/// - `update_version` is the speculative version: the last version handed to
///   an update RPC that is either still in flight or already succeeded.
/// - `verified_version` is the committed version: the last version the
///   server applied and acknowledged.
///
/// When the two are equal there is no RPC in flight for this server;
/// when they differ, exactly one is. Issuing a unit sets
/// `update_version = tail`, a failure rolls it back to `verified_version`,
/// and a success commits `verified_version = update_version`. Both start at
/// [`UNINITIALIZED_VERSION`], which marks a server that has never received
/// any update and must be sent a full snapshot first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Primary key; never reused across entries.
    pub server_id: ServerId,

    /// Life-cycle status.
    pub status: ServerStatus,

    /// Services this server runs.
    pub services: ServiceMask,

    /// Opaque transport address.
    pub service_locator: String,

    /// Advertised backup read speed in MB/s, used to shape replication
    /// groups.
    pub read_speed_mbs: u32,

    /// True from the start of this server's crash recovery until the
    /// external recovery manager reports completion.
    pub needs_recovery: bool,

    /// Replication group membership; 0 means no group.
    pub replication_id: u64,

    /// Opaque recovery blob owned by the master subsystem; journaled but
    /// never interpreted here.
    pub master_recovery_info: Vec<u8>,

    /// Committed half of the two-phase update bookkeeping (see above).
    pub verified_version: u64,

    /// Speculative half of the two-phase update bookkeeping (see above).
    pub update_version: u64,

    /// Journal record holding this server's enlistment information.
    pub log_id_server_up: Option<EntryId>,

    /// Journal record holding the latest master-recovery blob.
    pub log_id_server_update: Option<EntryId>,

    /// Journal record of this server's crash.
    pub log_id_server_crashed: Option<EntryId>,

    /// Journal record marking crash recovery as started-but-unfinished.
    pub log_id_server_needs_recovery: Option<EntryId>,

    /// Journal record (and the published version) of the pending REMOVE
    /// announcement; cleared when the cluster has confirmed that version.
    pub log_id_server_remove_update: Option<(EntryId, u64)>,

    /// Journal record (and the published version) of the pending UP
    /// announcement; cleared when the cluster has confirmed that version.
    pub log_id_server_up_update: Option<(EntryId, u64)>,

    /// Journal record holding the latest replication-group assignment.
    pub log_id_server_replication_update: Option<EntryId>,

    /// Journal record (and the published version) of the pending
    /// replication-change announcement; cleared once confirmed.
    pub log_id_server_replication_up_update: Option<(EntryId, u64)>,
}

impl Entry {
    /// Creates a fresh UP entry with no update history.
    pub fn new(
        server_id: ServerId,
        service_locator: String,
        services: ServiceMask,
        read_speed_mbs: u32,
    ) -> Self {
        Entry {
            server_id,
            status: ServerStatus::Up,
            services,
            service_locator,
            read_speed_mbs,
            needs_recovery: false,
            replication_id: 0,
            master_recovery_info: Vec::new(),
            verified_version: UNINITIALIZED_VERSION,
            update_version: UNINITIALIZED_VERSION,
            log_id_server_up: None,
            log_id_server_update: None,
            log_id_server_crashed: None,
            log_id_server_needs_recovery: None,
            log_id_server_remove_update: None,
            log_id_server_up_update: None,
            log_id_server_replication_update: None,
            log_id_server_replication_up_update: None,
        }
    }

    /// An UP server offering the master service.
    #[inline]
    pub fn is_master(&self) -> bool {
        self.status == ServerStatus::Up && self.services.has(Service::Master)
    }

    /// An UP server offering the backup service.
    #[inline]
    pub fn is_backup(&self) -> bool {
        self.status == ServerStatus::Up && self.services.has(Service::Backup)
    }

    /// Whether this server receives pushed server-list updates.
    #[inline]
    pub fn accepts_updates(&self) -> bool {
        self.services.has(Service::Membership)
    }

    /// The published form of this entry at its current status.
    pub fn to_msg(&self) -> EntryMsg {
        EntryMsg {
            server_id: self.server_id,
            status: self.status,
            services: self.services.clone(),
            service_locator: self.service_locator.clone(),
            read_speed_mbs: self.read_speed_mbs,
            replication_id: self.replication_id,
        }
    }

    /// All journal records currently chained to this entry, for the final
    /// invalidate when the entry is retired.
    pub fn chained_log_ids(&self) -> Vec<EntryId> {
        let mut ids = Vec::new();
        if let Some(id) = self.log_id_server_up {
            ids.push(id);
        }
        if let Some(id) = self.log_id_server_update {
            ids.push(id);
        }
        if let Some(id) = self.log_id_server_crashed {
            ids.push(id);
        }
        if let Some(id) = self.log_id_server_needs_recovery {
            ids.push(id);
        }
        if let Some((id, _)) = self.log_id_server_remove_update {
            ids.push(id);
        }
        if let Some((id, _)) = self.log_id_server_up_update {
            ids.push(id);
        }
        if let Some(id) = self.log_id_server_replication_update {
            ids.push(id);
        }
        if let Some((id, _)) = self.log_id_server_replication_up_update {
            ids.push(id);
        }
        ids
    }
}
