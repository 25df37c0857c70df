//! Journal replay: rebuilds the whole server-list state after a coordinator
//! restart.
//!
//! Records are dispatched in entry-id order; each handler reinstates the
//! in-memory effect of the operation whose completion the record proves.
//! Afterwards, announcements that were never confirmed by the cluster are
//! consolidated into one freshly published version, and crash recoveries
//! that had not finished are handed back to the recovery manager.

use crate::coord::ops::persist_list_version;
use crate::coord::Context;
use crate::ids::{ServerId, ServerStatus};
use crate::journal::Record;
use crate::list::{Entry, RosterCore};
use crate::utils::RosterError;

/// What replay asks the surrounding service to do once the lock is
/// released.
pub(crate) struct ReplayOutcome {
    /// Crash recoveries to (re-)initiate, with each server's opaque blob.
    pub recoveries: Vec<(ServerId, Vec<u8>)>,
}

/// Replays all live journal records into `core`.
pub(crate) async fn replay(
    core: &mut RosterCore,
    ctx: &Context,
) -> Result<ReplayOutcome, RosterError> {
    let records = ctx.log.read_all().await?;
    let record_count = records.len();
    let mut max_version = 0u64;

    for (log_id, record) in records {
        if let Some(version) = record.update_version() {
            max_version = max_version.max(version);
        }
        match record {
            Record::ServerUp {
                server_id,
                services,
                service_locator,
                read_speed_mbs,
                ..
            } => {
                if core.entry(server_id).is_some() {
                    pf_warn!("r"; "duplicate ServerUp for {}", server_id);
                    continue;
                }
                let mut entry = Entry::new(
                    server_id,
                    service_locator,
                    services,
                    read_speed_mbs,
                );
                entry.log_id_server_up = Some(log_id);
                core.recover_entry(entry);
            }

            Record::ServerUpUpdate {
                server_id,
                update_version,
            } => with_entry(core, server_id, "ServerUpUpdate", |e| {
                e.log_id_server_up_update = Some((log_id, update_version));
            }),

            Record::ServerListVersion { .. } => {
                core.log_id_list_version = Some(log_id);
            }

            Record::ServerCrashed { server_id, .. } => {
                with_entry(core, server_id, "ServerCrashed", |e| {
                    e.status = ServerStatus::Crashed;
                    e.log_id_server_crashed = Some(log_id);
                })
            }

            Record::ServerNeedsRecovery { server_id } => {
                with_entry(core, server_id, "ServerNeedsRecovery", |e| {
                    e.needs_recovery = true;
                    e.log_id_server_needs_recovery = Some(log_id);
                })
            }

            Record::ServerRemoveUpdate {
                server_id,
                update_version,
            } => with_entry(core, server_id, "ServerRemoveUpdate", |e| {
                // recovery finished before the crash; only the REMOVE
                // announcement is still owed to the cluster
                e.status = ServerStatus::Crashed;
                e.needs_recovery = false;
                e.log_id_server_remove_update =
                    Some((log_id, update_version));
            }),

            Record::ServerUpdate {
                server_id,
                recovery_info,
            } => with_entry(core, server_id, "ServerUpdate", |e| {
                e.master_recovery_info = recovery_info;
                e.log_id_server_update = Some(log_id);
            }),

            Record::ServerReplicationUpdate {
                server_id,
                replication_id,
                ..
            } => {
                core.observe_replication_id(replication_id);
                with_entry(core, server_id, "ServerReplicationUpdate", |e| {
                    e.replication_id = replication_id;
                    e.log_id_server_replication_update = Some(log_id);
                })
            }

            Record::ServerReplicationUpUpdate {
                server_id,
                update_version,
            } => {
                with_entry(core, server_id, "ServerReplicationUpUpdate", |e| {
                    e.log_id_server_replication_up_update =
                        Some((log_id, update_version));
                })
            }
        }
    }

    core.recount();
    core.observe_version(max_version);

    // consolidate all unconfirmed announcements into one new version; after
    // a restart every member gets a full snapshot anyway, so one batch is
    // enough to drive the pending records to confirmation
    let pending_refresh: Vec<ServerId> = core
        .iter()
        .filter(|e| {
            e.log_id_server_remove_update.is_none()
                && (e.log_id_server_up_update.is_some()
                    || e.log_id_server_replication_up_update.is_some())
        })
        .map(|e| e.server_id)
        .collect();
    let pending_removal: Vec<ServerId> = core
        .iter()
        .filter(|e| e.log_id_server_remove_update.is_some())
        .map(|e| e.server_id)
        .collect();
    for id in pending_refresh {
        core.stage_refresh(id)?;
    }
    for id in pending_removal {
        core.stage_removal(id)?;
    }
    if core.has_staged() {
        let version = core.push_update().ok_or_else(|| {
            RosterError::msg("replay staged nothing to publish")
        })?;
        core.retarget_pending_publications(version);
        persist_list_version(core, ctx).await?;
    }

    // crash recoveries that never completed get started over
    let recoveries: Vec<(ServerId, Vec<u8>)> = core
        .iter()
        .filter(|e| {
            e.status == ServerStatus::Crashed
                && e.log_id_server_remove_update.is_none()
        })
        .map(|e| (e.server_id, e.master_recovery_info.clone()))
        .collect();

    // confirmations that became due during replay (e.g. no updatable
    // members remain) are applied to the journal right away
    let invalidations = core.take_confirm_invalidations();
    if !invalidations.is_empty() {
        ctx.log.invalidate(&invalidations).await?;
    }

    pf_info!(
        "r";
        "replayed {} journal records: version {}, {} live entries, \
         {} recoveries to restart",
        record_count,
        core.current_version(),
        core.iter().count(),
        recoveries.len()
    );
    Ok(ReplayOutcome { recoveries })
}

fn with_entry(
    core: &mut RosterCore,
    id: ServerId,
    tag: &str,
    apply: impl FnOnce(&mut Entry),
) {
    match core.entry_mut(id) {
        Some(entry) => apply(entry),
        None => {
            pf_warn!("r"; "{} record for unknown server {}", tag, id);
        }
    }
}
