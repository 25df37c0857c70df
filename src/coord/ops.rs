//! Membership mutations as two-phase operations.
//!
//! Every mutation follows the same skeleton: `execute` appends its journal
//! record (the durability barrier), then hands the returned entry id to
//! `complete`, which applies the in-memory change and may append follow-up
//! records. Replay re-enters at the completion side with the journaled
//! record as input. Named crash points between the steps let tests
//! terminate the coordinator at any interleaving and assert that replay
//! converges.

use crate::coord::Context;
use crate::ids::{ServerId, ServiceMask};
use crate::journal::{EntryId, Record};
use crate::list::RosterCore;
use crate::utils::RosterError;

/// Re-appends the server-list-version record, superseding its predecessor.
/// Called after every version bump so that no version is ever reused after
/// a restart, even once the records that carried it are invalidated.
pub(crate) async fn persist_list_version(
    core: &mut RosterCore,
    ctx: &Context,
) -> Result<(), RosterError> {
    let version = core.current_version();
    let invalidates: Vec<EntryId> =
        core.log_id_list_version.into_iter().collect();
    let log_id = ctx
        .log
        .append(Record::ServerListVersion { version }, &invalidates)
        .await?;
    core.log_id_list_version = Some(log_id);
    Ok(())
}

/// Enlists one new server under a freshly allocated id.
pub(crate) struct EnlistServer {
    pub new_server_id: ServerId,
    pub services: ServiceMask,
    pub read_speed_mbs: u32,
    pub service_locator: String,

    /// The version the enlistment will publish at.
    pub update_version: u64,
}

impl EnlistServer {
    pub(crate) async fn execute(
        self,
        core: &mut RosterCore,
        ctx: &Context,
    ) -> Result<ServerId, RosterError> {
        ctx.crash_points.reached("enlist_1")?;
        let log_id = ctx
            .log
            .append(
                Record::ServerUp {
                    server_id: self.new_server_id,
                    services: self.services.clone(),
                    service_locator: self.service_locator.clone(),
                    read_speed_mbs: self.read_speed_mbs,
                    update_version: self.update_version,
                },
                &[],
            )
            .await?;
        ctx.crash_points.reached("enlist_2")?;
        self.complete(core, ctx, log_id).await
    }

    pub(crate) async fn complete(
        self,
        core: &mut RosterCore,
        ctx: &Context,
        log_id: EntryId,
    ) -> Result<ServerId, RosterError> {
        let id = self.new_server_id;
        core.add(
            id,
            self.service_locator,
            self.services,
            self.read_speed_mbs,
        )?;
        if let Some(entry) = core.entry_mut(id) {
            entry.log_id_server_up = Some(log_id);
        }

        let version = core.push_update().ok_or_else(|| {
            RosterError::msg("enlist staged nothing to publish")
        })?;
        debug_assert_eq!(version, self.update_version);
        persist_list_version(core, ctx).await?;

        ctx.crash_points.reached("enlist_3")?;
        // commit point: after this record the enlistment is re-published on
        // any restart until the cluster has confirmed it
        let up_id = ctx
            .log
            .append(
                Record::ServerUpUpdate {
                    server_id: id,
                    update_version: version,
                },
                &[],
            )
            .await?;
        if let Some(entry) = core.entry_mut(id) {
            entry.log_id_server_up_update = Some((up_id, version));
        }
        pf_info!(
            "r";
            "enlisted server {} at '{}', version {}",
            id,
            core.entry(id).map(|e| e.service_locator.as_str()).unwrap_or("?"),
            version
        );
        Ok(id)
    }
}

/// Declares one UP server crashed. When `push` is false the staged crash
/// rides along in the caller's batch (enlistment with `replaces_id`).
pub(crate) struct ServerCrashed {
    pub server_id: ServerId,
    pub update_version: u64,
    pub push: bool,
}

impl ServerCrashed {
    pub(crate) async fn execute(
        self,
        core: &mut RosterCore,
        ctx: &Context,
    ) -> Result<Vec<u8>, RosterError> {
        ctx.crash_points.reached("crashed_1")?;
        let log_id = ctx
            .log
            .append(
                Record::ServerCrashed {
                    server_id: self.server_id,
                    update_version: self.update_version,
                },
                &[],
            )
            .await?;
        ctx.crash_points.reached("crashed_2")?;
        self.complete(core, ctx, log_id).await
    }

    /// Applies the crash and returns the server's opaque recovery blob; the
    /// caller hands it to the recovery manager once the lock is released.
    pub(crate) async fn complete(
        self,
        core: &mut RosterCore,
        ctx: &Context,
        log_id: EntryId,
    ) -> Result<Vec<u8>, RosterError> {
        core.crashed(self.server_id)?;
        let (group, recovery_info) = {
            let entry = core
                .entry_mut(self.server_id)
                .ok_or(RosterError::NoSuchServer(self.server_id))?;
            entry.log_id_server_crashed = Some(log_id);
            (entry.replication_id, entry.master_recovery_info.clone())
        };

        // a crashed backup dissolves its replication group; the zeroed
        // members ride in the same published batch
        if group != 0 {
            remove_replication_group(core, ctx, group, self.update_version)
                .await?;
        }

        if self.push {
            let version = core.push_update().ok_or_else(|| {
                RosterError::msg("crash staged nothing to publish")
            })?;
            debug_assert_eq!(version, self.update_version);
            persist_list_version(core, ctx).await?;
        }

        ServerNeedsRecovery {
            server_id: self.server_id,
        }
        .execute(core, ctx)
        .await?;

        pf_warn!(
            "r";
            "server {} crashed, version {}",
            self.server_id,
            self.update_version
        );
        Ok(recovery_info)
    }
}

/// Marks a crashed server's recovery as started-but-unfinished, so a
/// coordinator restart runs it again.
pub(crate) struct ServerNeedsRecovery {
    pub server_id: ServerId,
}

impl ServerNeedsRecovery {
    pub(crate) async fn execute(
        self,
        core: &mut RosterCore,
        ctx: &Context,
    ) -> Result<(), RosterError> {
        ctx.crash_points.reached("needs_recovery_1")?;
        let log_id = ctx
            .log
            .append(
                Record::ServerNeedsRecovery {
                    server_id: self.server_id,
                },
                &[],
            )
            .await?;
        self.complete(core, log_id)
    }

    pub(crate) fn complete(
        self,
        core: &mut RosterCore,
        log_id: EntryId,
    ) -> Result<(), RosterError> {
        let entry = core
            .entry_mut(self.server_id)
            .ok_or(RosterError::NoSuchServer(self.server_id))?;
        entry.needs_recovery = true;
        entry.log_id_server_needs_recovery = Some(log_id);
        Ok(())
    }
}

/// Retires a crashed server whose recovery finished: publishes the REMOVE
/// and arranges for the slot to be released once the cluster confirms it.
pub(crate) struct ServerRemoveUpdate {
    pub server_id: ServerId,
    pub update_version: u64,
}

impl ServerRemoveUpdate {
    pub(crate) async fn execute(
        self,
        core: &mut RosterCore,
        ctx: &Context,
    ) -> Result<(), RosterError> {
        ctx.crash_points.reached("remove_1")?;
        // recovery is done: the needs-recovery marker dies in the same
        // atomic append
        let invalidates: Vec<EntryId> = core
            .entry(self.server_id)
            .and_then(|e| e.log_id_server_needs_recovery)
            .into_iter()
            .collect();
        let log_id = ctx
            .log
            .append(
                Record::ServerRemoveUpdate {
                    server_id: self.server_id,
                    update_version: self.update_version,
                },
                &invalidates,
            )
            .await?;
        ctx.crash_points.reached("remove_2")?;
        self.complete(core, ctx, log_id).await
    }

    pub(crate) async fn complete(
        self,
        core: &mut RosterCore,
        ctx: &Context,
        log_id: EntryId,
    ) -> Result<(), RosterError> {
        {
            let entry = core
                .entry_mut(self.server_id)
                .ok_or(RosterError::NoSuchServer(self.server_id))?;
            entry.needs_recovery = false;
            entry.log_id_server_needs_recovery = None;
            entry.log_id_server_remove_update =
                Some((log_id, self.update_version));
        }
        core.stage_removal(self.server_id)?;
        let version = core.push_update().ok_or_else(|| {
            RosterError::msg("removal staged nothing to publish")
        })?;
        debug_assert_eq!(version, self.update_version);
        persist_list_version(core, ctx).await?;
        pf_info!(
            "r";
            "server {} recovery completed, removal publishing at version {}",
            self.server_id,
            version
        );
        Ok(())
    }
}

/// Replaces a server's opaque master-recovery blob. Journaled, never
/// published.
pub(crate) struct ServerUpdate {
    pub server_id: ServerId,
    pub recovery_info: Vec<u8>,
}

impl ServerUpdate {
    pub(crate) async fn execute(
        self,
        core: &mut RosterCore,
        ctx: &Context,
    ) -> Result<(), RosterError> {
        ctx.crash_points.reached("update_1")?;
        let invalidates: Vec<EntryId> = core
            .entry(self.server_id)
            .and_then(|e| e.log_id_server_update)
            .into_iter()
            .collect();
        let log_id = ctx
            .log
            .append(
                Record::ServerUpdate {
                    server_id: self.server_id,
                    recovery_info: self.recovery_info.clone(),
                },
                &invalidates,
            )
            .await?;
        self.complete(core, log_id)
    }

    pub(crate) fn complete(
        self,
        core: &mut RosterCore,
        log_id: EntryId,
    ) -> Result<(), RosterError> {
        let entry = core
            .entry_mut(self.server_id)
            .ok_or(RosterError::NoSuchServer(self.server_id))?;
        entry.master_recovery_info = self.recovery_info;
        entry.log_id_server_update = Some(log_id);
        Ok(())
    }
}

/// Assigns `members` (exactly three UP backups) to replication group
/// `replication_id`, journaling and staging each member's change.
pub(crate) async fn assign_replication_group(
    core: &mut RosterCore,
    ctx: &Context,
    replication_id: u64,
    members: &[ServerId],
    update_version: u64,
    push: bool,
) -> Result<(), RosterError> {
    if members.len() != 3 {
        return Err(RosterError::ReplicationGroupImpossible);
    }
    for &id in members {
        match core.entry(id) {
            Some(entry) if entry.is_backup() => {}
            Some(_) => return Err(RosterError::ReplicationGroupImpossible),
            None => return Err(RosterError::NoSuchServer(id)),
        }
    }

    ctx.crash_points.reached("replication_1")?;
    for &id in members {
        let invalidates: Vec<EntryId> = core
            .entry(id)
            .and_then(|e| e.log_id_server_replication_update)
            .into_iter()
            .collect();
        let log_id = ctx
            .log
            .append(
                Record::ServerReplicationUpdate {
                    server_id: id,
                    replication_id,
                    update_version,
                },
                &invalidates,
            )
            .await?;
        ctx.crash_points.reached("replication_2")?;
        let stale_up: Vec<EntryId> = core
            .entry(id)
            .and_then(|e| e.log_id_server_replication_up_update)
            .map(|(old, _)| old)
            .into_iter()
            .collect();
        let up_id = ctx
            .log
            .append(
                Record::ServerReplicationUpUpdate {
                    server_id: id,
                    update_version,
                },
                &stale_up,
            )
            .await?;
        if let Some(entry) = core.entry_mut(id) {
            entry.replication_id = replication_id;
            entry.log_id_server_replication_update = Some(log_id);
            entry.log_id_server_replication_up_update =
                Some((up_id, update_version));
        }
        core.stage_refresh(id)?;
    }

    if push {
        let version = core.push_update().ok_or_else(|| {
            RosterError::msg("replication change staged nothing to publish")
        })?;
        debug_assert_eq!(version, update_version);
        persist_list_version(core, ctx).await?;
    }
    pf_info!(
        "r";
        "replication group {} assigned at version {}",
        replication_id,
        update_version
    );
    Ok(())
}

/// Forms as many new replication groups of three as the free UP backups
/// allow. Running short is not an error; formation is retried whenever
/// membership changes.
pub(crate) async fn create_replication_groups(
    core: &mut RosterCore,
    ctx: &Context,
) -> Result<(), RosterError> {
    loop {
        let free: Vec<ServerId> = core
            .iter()
            .filter(|e| e.is_backup() && e.replication_id == 0)
            .map(|e| e.server_id)
            .collect();
        if free.len() < 3 {
            if !free.is_empty() {
                pf_debug!(
                    "r";
                    "{} free backup(s), not enough for a replication group",
                    free.len()
                );
            }
            return Ok(());
        }
        let members = free[..3].to_vec();
        let replication_id = core.take_replication_id();
        let update_version = core.current_version() + 1;
        assign_replication_group(
            core,
            ctx,
            replication_id,
            &members,
            update_version,
            true,
        )
        .await?;
    }
}

/// Dissolves replication group `group`: every member is journaled and (if
/// still UP) staged back to group 0 in the caller's batch.
pub(crate) async fn remove_replication_group(
    core: &mut RosterCore,
    ctx: &Context,
    group: u64,
    update_version: u64,
) -> Result<(), RosterError> {
    let members: Vec<ServerId> = core
        .iter()
        .filter(|e| e.replication_id == group)
        .map(|e| e.server_id)
        .collect();
    for id in members {
        let invalidates: Vec<EntryId> = core
            .entry(id)
            .and_then(|e| e.log_id_server_replication_update)
            .into_iter()
            .collect();
        let log_id = ctx
            .log
            .append(
                Record::ServerReplicationUpdate {
                    server_id: id,
                    replication_id: 0,
                    update_version,
                },
                &invalidates,
            )
            .await?;
        let is_up = {
            let entry = core
                .entry_mut(id)
                .ok_or(RosterError::NoSuchServer(id))?;
            entry.replication_id = 0;
            entry.log_id_server_replication_update = Some(log_id);
            entry.is_backup()
        };
        if is_up {
            let stale_up: Vec<EntryId> = core
                .entry(id)
                .and_then(|e| e.log_id_server_replication_up_update)
                .map(|(old, _)| old)
                .into_iter()
                .collect();
            let up_id = ctx
                .log
                .append(
                    Record::ServerReplicationUpUpdate {
                        server_id: id,
                        update_version,
                    },
                    &stale_up,
                )
                .await?;
            if let Some(entry) = core.entry_mut(id) {
                entry.log_id_server_replication_up_update =
                    Some((up_id, update_version));
            }
            core.stage_refresh(id)?;
        }
    }
    pf_debug!("r"; "replication group {} dissolved", group);
    Ok(())
}

// Unit tests are done together with `coord::roster` and `coord::recovery`.
