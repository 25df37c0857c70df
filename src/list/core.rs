//! Core membership state machine: slots, identity allocation, update
//! staging/publication, and the work-selection half of the updater.
//!
//! Everything in here is plain synchronous state, driven under the
//! coordinator's coarse lock. Journal and network I/O happen in the layers
//! above; the core only records what must be invalidated or sent.

use std::sync::Arc;

use crate::ids::{ServerId, ServerStatus, ServiceMask};
use crate::journal::EntryId;
use crate::list::updates::UpdateLog;
use crate::list::{
    Entry, TrackerEvent, TrackerEventKind, UpdatePair, MAX_UPDATES_PER_RPC,
    UNINITIALIZED_VERSION,
};
use crate::message::{ListKind, ListMessage, ListPayload};
use crate::utils::RosterError;

use tokio::sync::mpsc;

/// One slot of the server list: a generation counter that survives entry
/// turnover, plus the entry currently allocated to the slot, if any.
#[derive(Debug, Default)]
struct Slot {
    /// Generation the next allocation of this slot will receive.
    next_generation: u32,

    /// The live entry, if the slot is taken.
    entry: Option<Entry>,
}

/// State of partial scans through the server list for update work.
#[derive(Debug)]
pub struct ScanMetadata {
    /// The version at which a complete scan last found no assignable work.
    /// The updater blocks until the version moves past this epoch (or a
    /// rollback clears it).
    pub no_work_found_for_epoch: u64,

    /// Where the next scan pass resumes.
    pub search_index: usize,

    /// Minimum verified version seen so far in the current pass.
    pub min_version: u64,

    /// Completed passes since the updater started; useful for debugging.
    pub complete_scans: u64,
}

impl ScanMetadata {
    fn new() -> Self {
        ScanMetadata {
            no_work_found_for_epoch: 0,
            search_index: 0,
            min_version: u64::MAX,
            complete_scans: 0,
        }
    }
}

/// One batch of update work for a single target server.
///
/// The contract attached to a handed-out unit: until the matching
/// `work_success`/`work_failed` call, (a) no second unit is issued for the
/// same target, and (b) the captured range of update pairs stays readable;
/// the `Arc`s here are what keep the pairs alive independent of pruning.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    /// Whom to send the update.
    pub target: ServerId,

    /// The target's locator, snapshotted at selection time.
    pub locator: String,

    /// Send the full list instead of incrementals.
    pub send_full: bool,

    /// The captured pair range; a single pair when `send_full`.
    pub updates: Vec<Arc<UpdatePair>>,

    /// Version the target will be at once this unit is acknowledged.
    pub tail_version: u64,
}

impl WorkUnit {
    /// Assembles the RPC payload. Called by the RPC task without any lock;
    /// it only reads the shared pairs captured at selection time.
    pub fn payload(&self) -> ListPayload {
        if self.send_full {
            ListPayload::Full(self.updates[0].full.clone())
        } else {
            ListPayload::Increments(
                self.updates.iter().map(|p| p.incremental.clone()).collect(),
            )
        }
    }
}

/// The canonical membership map plus update-propagation bookkeeping.
pub struct RosterCore {
    /// Slot table; index 0 is reserved so that the all-zero id stays
    /// invalid.
    slots: Vec<Slot>,

    /// Number of UP servers offering the master service.
    num_masters: u32,

    /// Number of UP servers offering the backup service.
    num_backups: u32,

    /// Version of the latest published update; 0 before the first one.
    current_version: u64,

    /// Staged changes and sealed update history.
    updates: UpdateLog,

    /// Scan cursor state for work selection.
    scan: ScanMetadata,

    /// Oldest version any updatable server may still be at. Safe for
    /// pruning: no updatable server is behind this.
    min_confirmed_version: u64,

    /// Number of work units currently handed out.
    num_updating: u32,

    /// Next replication group id; starts at 1, never reused. Group id 0
    /// marks servers outside any group.
    next_replication_id: u64,

    /// Journal handle of the current server-list-version record.
    pub(crate) log_id_list_version: Option<EntryId>,

    /// Registered membership-event sinks, fed in application order.
    trackers: Vec<mpsc::UnboundedSender<TrackerEvent>>,

    /// Journal records whose invalidation became due (confirmed
    /// publications, retired entries). Drained by the caller after the lock
    /// is released.
    confirm_invalidations: Vec<EntryId>,
}

impl RosterCore {
    /// Creates an empty server list.
    pub fn new() -> Self {
        RosterCore {
            slots: vec![Slot::default()],
            num_masters: 0,
            num_backups: 0,
            current_version: 0,
            updates: UpdateLog::new(),
            scan: ScanMetadata::new(),
            min_confirmed_version: 0,
            num_updating: 0,
            next_replication_id: 1,
            log_id_list_version: None,
            trackers: Vec::new(),
            confirm_invalidations: Vec::new(),
        }
    }

    /// Version of the latest published update.
    #[inline]
    pub fn current_version(&self) -> u64 {
        self.current_version
    }

    /// Oldest version any updatable server may still be at.
    #[inline]
    pub fn min_confirmed_version(&self) -> u64 {
        self.min_confirmed_version
    }

    /// Number of UP masters.
    #[inline]
    pub fn master_count(&self) -> u32 {
        self.num_masters
    }

    /// Number of UP backups.
    #[inline]
    pub fn backup_count(&self) -> u32 {
        self.num_backups
    }

    /// Number of slots (including empty and the reserved zeroth).
    #[inline]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Scan bookkeeping, for the updater's wait heuristic.
    #[inline]
    pub fn scan_metadata(&self) -> &ScanMetadata {
        &self.scan
    }

    /// Whether every updatable server has confirmed the latest version and
    /// nothing awaits publication.
    pub fn is_cluster_up_to_date(&self) -> bool {
        !self.updates.has_staged()
            && self.min_confirmed_version == self.current_version
    }

    /// Number of retained update pairs.
    pub fn update_count(&self) -> usize {
        self.updates.len()
    }

    /// Version of the oldest retained update pair.
    pub fn oldest_update_version(&self) -> Option<u64> {
        self.updates.front_version()
    }

    /// The most recently published update pair.
    pub fn latest_pair(&self) -> Option<Arc<UpdatePair>> {
        self.updates.latest()
    }
}

// RosterCore identity allocation
impl RosterCore {
    /// Index of the first free slot, growing the table if none is free.
    /// Slots whose generation counter is exhausted are never reused.
    fn first_free_index(&mut self) -> u32 {
        for (index, slot) in self.slots.iter().enumerate().skip(1) {
            if slot.entry.is_none() && slot.next_generation < u32::MAX {
                return index as u32;
            }
        }
        self.slots.push(Slot::default());
        (self.slots.len() - 1) as u32
    }

    /// Allocates a fresh, never-before-used server id. The slot's generation
    /// advances immediately, so stale ids can never match a later occupant.
    pub fn generate_unique_id(&mut self) -> ServerId {
        let index = self.first_free_index();
        let slot = &mut self.slots[index as usize];
        let id = ServerId::new(index, slot.next_generation);
        slot.next_generation += 1;
        id
    }
}

// RosterCore entry lookup
impl RosterCore {
    /// Borrow the live entry named by `id`, if any. A stale generation never
    /// matches.
    pub fn entry(&self, id: ServerId) -> Option<&Entry> {
        self.slots
            .get(id.index() as usize)
            .and_then(|slot| slot.entry.as_ref())
            .filter(|e| e.server_id == id)
    }

    /// Mutable borrow of the live entry named by `id`.
    pub(crate) fn entry_mut(&mut self, id: ServerId) -> Option<&mut Entry> {
        self.slots
            .get_mut(id.index() as usize)
            .and_then(|slot| slot.entry.as_mut())
            .filter(|e| e.server_id == id)
    }

    /// Snapshot of the entry named by `id`.
    pub fn get(&self, id: ServerId) -> Result<Entry, RosterError> {
        self.entry(id)
            .cloned()
            .ok_or(RosterError::NoSuchServer(id))
    }

    /// Snapshot of whatever entry occupies slot `index`.
    pub fn get_by_index(&self, index: u32) -> Option<Entry> {
        self.slots
            .get(index as usize)
            .and_then(|slot| slot.entry.clone())
    }

    /// Iterates over all live entries.
    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.slots.iter().filter_map(|slot| slot.entry.as_ref())
    }
}

// RosterCore membership mutation (staging side)
impl RosterCore {
    /// Installs a new UP entry for `id` and stages its addition for the next
    /// published update.
    pub(crate) fn add(
        &mut self,
        id: ServerId,
        service_locator: String,
        services: ServiceMask,
        read_speed_mbs: u32,
    ) -> Result<(), RosterError> {
        let index = id.index() as usize;
        if index == 0 || index >= self.slots.len() {
            return Err(RosterError::msg(format!(
                "add: id {} names no allocated slot",
                id
            )));
        }
        if self.slots[index].entry.is_some() {
            return Err(RosterError::msg(format!(
                "add: slot {} already taken",
                index
            )));
        }
        debug_assert!(id.generation() < self.slots[index].next_generation);

        let entry =
            Entry::new(id, service_locator, services, read_speed_mbs);
        if entry.is_master() {
            self.num_masters += 1;
        }
        if entry.is_backup() {
            self.num_backups += 1;
        }
        self.updates.stage_addition(entry.to_msg());
        self.emit_tracker(TrackerEvent {
            kind: TrackerEventKind::Add,
            server_id: id,
            services: entry.services.clone(),
            service_locator: entry.service_locator.clone(),
        });
        self.slots[index].entry = Some(entry);
        Ok(())
    }

    /// Transitions `id` to CRASHED and stages the crash event.
    pub(crate) fn crashed(&mut self, id: ServerId) -> Result<(), RosterError> {
        let entry = self
            .entry_mut(id)
            .ok_or(RosterError::NoSuchServer(id))?;
        debug_assert_eq!(entry.status, ServerStatus::Up);
        let was_master = entry.is_master();
        let was_backup = entry.is_backup();
        entry.status = ServerStatus::Crashed;
        let msg = entry.to_msg();
        let event = TrackerEvent {
            kind: TrackerEventKind::Crashed,
            server_id: id,
            services: entry.services.clone(),
            service_locator: entry.service_locator.clone(),
        };
        if was_master {
            self.num_masters -= 1;
        }
        if was_backup {
            self.num_backups -= 1;
        }
        self.updates.stage_departure(msg);
        self.emit_tracker(event);
        // a crashed server no longer gates pruning
        self.recompute_min_confirmed();
        Ok(())
    }

    /// Transitions a CRASHED `id` to REMOVED and stages the removal event.
    /// The slot itself is released only once the cluster confirms the
    /// removal's version.
    pub(crate) fn stage_removal(
        &mut self,
        id: ServerId,
    ) -> Result<(), RosterError> {
        let entry = self
            .entry_mut(id)
            .ok_or(RosterError::NoSuchServer(id))?;
        debug_assert_eq!(entry.status, ServerStatus::Crashed);
        entry.status = ServerStatus::Removed;
        let msg = entry.to_msg();
        let event = TrackerEvent {
            kind: TrackerEventKind::Removed,
            server_id: id,
            services: entry.services.clone(),
            service_locator: entry.service_locator.clone(),
        };
        self.updates.stage_departure(msg);
        self.emit_tracker(event);
        Ok(())
    }

    /// Stages a refreshed copy of an UP entry (used when a published field
    /// such as the replication id changes).
    pub(crate) fn stage_refresh(
        &mut self,
        id: ServerId,
    ) -> Result<(), RosterError> {
        let msg = self
            .entry(id)
            .ok_or(RosterError::NoSuchServer(id))?
            .to_msg();
        self.updates.stage_addition(msg);
        Ok(())
    }

    /// Whether changes are staged for the next `push_update`.
    pub(crate) fn has_staged(&self) -> bool {
        self.updates.has_staged()
    }

    /// Atomically publishes the staged batch: bumps the version, seals the
    /// incremental together with a freshly computed full snapshot, and
    /// appends the pair to the update history. Returns the new version, or
    /// `None` when nothing was staged.
    pub(crate) fn push_update(&mut self) -> Option<u64> {
        if !self.updates.has_staged() {
            return None;
        }
        self.current_version += 1;
        let full = self.full_snapshot(self.current_version);
        self.updates.seal(self.current_version, full);
        self.recompute_min_confirmed();
        Some(self.current_version)
    }

    /// Grabs the next replication group id.
    pub(crate) fn take_replication_id(&mut self) -> u64 {
        let id = self.next_replication_id;
        self.next_replication_id += 1;
        id
    }

    /// Lifts the replication-id floor during replay.
    pub(crate) fn observe_replication_id(&mut self, replication_id: u64) {
        if replication_id >= self.next_replication_id {
            self.next_replication_id = replication_id + 1;
        }
    }

    /// Reinstalls a replayed entry at its recorded slot, growing the table
    /// and lifting the slot's generation floor as needed. Counts are not
    /// touched; replay calls [`RosterCore::recount`] once at the end.
    pub(crate) fn recover_entry(&mut self, entry: Entry) {
        let index = entry.server_id.index() as usize;
        while self.slots.len() <= index {
            self.slots.push(Slot::default());
        }
        let slot = &mut self.slots[index];
        if entry.server_id.generation() >= slot.next_generation {
            slot.next_generation = entry.server_id.generation() + 1;
        }
        slot.entry = Some(entry);
    }

    /// Recomputes the master/backup counts from the entries. Used after
    /// replay, where status transitions are applied out of band.
    pub(crate) fn recount(&mut self) {
        self.num_masters =
            self.iter().filter(|e| e.is_master()).count() as u32;
        self.num_backups =
            self.iter().filter(|e| e.is_backup()).count() as u32;
    }

    /// Resets the scan cursor; invoked when the updater (re)starts.
    pub(crate) fn reset_scan(&mut self) {
        self.scan = ScanMetadata::new();
    }

    /// Forces the version counter during replay; never moves it backwards.
    pub(crate) fn observe_version(&mut self, version: u64) {
        if version > self.current_version {
            self.current_version = version;
        }
        self.recompute_min_confirmed();
    }
}

// RosterCore serialization and trackers
impl RosterCore {
    /// Full list (UP and CRASHED entries) as of `version`.
    fn full_snapshot(&self, version: u64) -> ListMessage {
        let mut msg = ListMessage::new(ListKind::Full, version);
        for entry in self.iter() {
            if entry.status != ServerStatus::Removed {
                msg.entries.push(entry.to_msg());
            }
        }
        msg
    }

    /// Snapshot of all entries offering any of the requested services.
    pub fn serialize(&self, services: &ServiceMask) -> ListMessage {
        let mut msg = ListMessage::new(ListKind::Full, self.current_version);
        for entry in self.iter() {
            if entry.status != ServerStatus::Removed
                && entry.services.intersects(services)
            {
                msg.entries.push(entry.to_msg());
            }
        }
        msg
    }

    /// Registers a membership-event sink. Events arrive in exactly the order
    /// they are applied to this list.
    pub fn register_tracker(
        &mut self,
    ) -> mpsc::UnboundedReceiver<TrackerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.trackers.push(tx);
        rx
    }

    fn emit_tracker(&mut self, event: TrackerEvent) {
        self.trackers
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

// RosterCore update-propagation bookkeeping
impl RosterCore {
    /// Picks the next target needing an update, resuming the scan where the
    /// last pass stopped. Marks the chosen entry's speculative version
    /// before returning, so no second unit can be issued for it.
    pub(crate) fn get_work(&mut self) -> Option<WorkUnit> {
        let mut examined = 0;
        while examined < self.slots.len() {
            let i = self.scan.search_index;

            // examine slot i before advancing, so a wrap-around folds this
            // entry's verified version into the completed pass as well
            let mut found: Option<(bool, Vec<Arc<UpdatePair>>, u64)> = None;
            if let Some(entry) = self.slots[i].entry.as_ref() {
                if entry.status == ServerStatus::Up && entry.accepts_updates()
                {
                    self.scan.min_version =
                        self.scan.min_version.min(entry.verified_version);
                    let in_flight =
                        entry.update_version > entry.verified_version;
                    let caught_up =
                        entry.verified_version == self.current_version;
                    if !in_flight && !caught_up {
                        let verified = entry.verified_version;
                        if verified == UNINITIALIZED_VERSION {
                            found = Some(match self.updates.latest() {
                                Some(pair) => {
                                    let tail = pair.version;
                                    (true, vec![pair], tail)
                                }
                                None => {
                                    // history drained (fresh after a
                                    // replay): synthesize a snapshot pair
                                    // at the current version
                                    let version = self.current_version;
                                    let full = self.full_snapshot(version);
                                    let pair = Arc::new(UpdatePair {
                                        version,
                                        incremental: ListMessage::new(
                                            ListKind::Incremental,
                                            version,
                                        ),
                                        full,
                                    });
                                    (true, vec![pair], version)
                                }
                            });
                        } else {
                            let range = self.updates.collect_range(
                                verified + 1,
                                MAX_UPDATES_PER_RPC,
                            );
                            if let Some(last) = range.last() {
                                let tail = last.version;
                                found = Some((false, range, tail));
                            }
                        }
                    }
                }
            }

            self.advance_scan();
            examined += 1;

            if let Some((send_full, updates, tail_version)) = found {
                // phase 1 of the per-target two-phase commit: speculate
                let entry = self.slots[i].entry.as_mut().unwrap();
                entry.update_version = tail_version;
                self.num_updating += 1;
                return Some(WorkUnit {
                    target: entry.server_id,
                    locator: entry.service_locator.clone(),
                    send_full,
                    updates,
                    tail_version,
                });
            }
        }

        self.scan.no_work_found_for_epoch = self.current_version;
        None
    }

    /// Advances the scan cursor; a wrap-around concludes one complete pass
    /// and folds the observed minimum into `min_confirmed_version`.
    fn advance_scan(&mut self) {
        self.scan.search_index += 1;
        if self.scan.search_index >= self.slots.len() {
            self.scan.search_index = 0;
            self.scan.complete_scans += 1;
            let observed = self.scan.min_version;
            self.scan.min_version = u64::MAX;
            let min = if observed == u64::MAX {
                self.current_version
            } else {
                observed
            };
            self.set_min_confirmed(min);
        }
    }

    /// Commit phase: the target acknowledged everything up to its
    /// speculative version.
    pub(crate) fn work_success(&mut self, id: ServerId) {
        match self.entry_mut(id) {
            Some(entry) => {
                debug_assert!(
                    entry.verified_version <= entry.update_version
                );
                entry.verified_version = entry.update_version;
            }
            None => {
                pf_debug!("u"; "work_success for vanished server {}", id);
            }
        }
        self.num_updating = self.num_updating.saturating_sub(1);
        self.recompute_min_confirmed();
    }

    /// Rollback phase: the RPC failed or was rejected; the next scan will
    /// retry. A spurious rollback only costs a duplicate send, which
    /// receivers deduplicate.
    pub(crate) fn work_failed(&mut self, id: ServerId) {
        match self.entry_mut(id) {
            Some(entry) => {
                debug_assert!(
                    entry.verified_version <= entry.update_version
                );
                entry.update_version = entry.verified_version;
            }
            None => {
                pf_debug!("u"; "work_failed for vanished server {}", id);
            }
        }
        self.num_updating = self.num_updating.saturating_sub(1);
        // there is assignable work again; clear the no-work epoch marker
        self.scan.no_work_found_for_epoch = 0;
    }

    /// Recomputes `min_confirmed_version` from scratch over all updatable
    /// servers, prunes the update history, and collects confirmations that
    /// became due.
    pub(crate) fn recompute_min_confirmed(&mut self) {
        let min = self
            .iter()
            .filter(|e| {
                e.status == ServerStatus::Up && e.accepts_updates()
            })
            .map(|e| e.verified_version)
            .min()
            .unwrap_or(self.current_version);
        self.set_min_confirmed(min);
    }

    fn set_min_confirmed(&mut self, min: u64) {
        self.min_confirmed_version = min;
        self.updates.prune(min);
        self.reap_confirmed();
    }

    /// Sweeps entries whose pending publications are now confirmed
    /// cluster-wide: queues their bookkeeping records for invalidation and
    /// retires entries whose REMOVE has landed everywhere.
    fn reap_confirmed(&mut self) {
        let min = self.min_confirmed_version;
        for index in 1..self.slots.len() {
            let Some(entry) = self.slots[index].entry.as_mut() else {
                continue;
            };
            if let Some((log_id, version)) = entry.log_id_server_up_update {
                if version <= min {
                    self.confirm_invalidations.push(log_id);
                    entry.log_id_server_up_update = None;
                }
            }
            if let Some((log_id, version)) =
                entry.log_id_server_replication_up_update
            {
                if version <= min {
                    self.confirm_invalidations.push(log_id);
                    entry.log_id_server_replication_up_update = None;
                }
            }
            let retire = matches!(
                entry.log_id_server_remove_update,
                Some((_, version)) if version <= min
            );
            if retire {
                let entry = self.slots[index].entry.take().unwrap();
                pf_info!(
                    "r";
                    "server {} retired, releasing slot {}",
                    entry.server_id,
                    index
                );
                self.confirm_invalidations
                    .extend(entry.chained_log_ids());
            }
        }
    }

    /// Drains the journal records whose invalidation became due. The caller
    /// performs the actual journal I/O after releasing the lock.
    pub(crate) fn take_confirm_invalidations(&mut self) -> Vec<EntryId> {
        std::mem::take(&mut self.confirm_invalidations)
    }

    /// Points every pending publication handle at `version`. Used after
    /// replay, which consolidates all unconfirmed announcements into one
    /// freshly published version.
    pub(crate) fn retarget_pending_publications(&mut self, version: u64) {
        for index in 1..self.slots.len() {
            let Some(entry) = self.slots[index].entry.as_mut() else {
                continue;
            };
            if let Some((log_id, _)) = entry.log_id_server_up_update {
                entry.log_id_server_up_update = Some((log_id, version));
            }
            if let Some((log_id, _)) = entry.log_id_server_remove_update {
                entry.log_id_server_remove_update = Some((log_id, version));
            }
            if let Some((log_id, _)) =
                entry.log_id_server_replication_up_update
            {
                entry.log_id_server_replication_up_update =
                    Some((log_id, version));
            }
        }
    }
}

impl Default for RosterCore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod core_tests {
    use super::*;
    use crate::ids::Service;

    fn updatable_mask() -> ServiceMask {
        ServiceMask::from_services(&[
            Service::Master,
            Service::Membership,
        ])
    }

    fn enlist(core: &mut RosterCore, services: ServiceMask) -> ServerId {
        let id = core.generate_unique_id();
        core.add(id, format!("tcp:host=node{}", id.index()), services, 100)
            .unwrap();
        core.push_update().unwrap();
        id
    }

    #[test]
    fn id_allocation_skips_taken_slots() {
        let mut core = RosterCore::new();
        let a = enlist(&mut core, updatable_mask());
        let b = enlist(&mut core, updatable_mask());
        assert_eq!(a, ServerId::new(1, 0));
        assert_eq!(b, ServerId::new(2, 0));
        assert_ne!(a, b);
    }

    #[test]
    fn released_slot_reused_with_new_generation() {
        let mut core = RosterCore::new();
        let a = enlist(&mut core, updatable_mask());
        core.crashed(a).unwrap();
        core.push_update().unwrap();
        core.stage_removal(a).unwrap();
        core.entry_mut(a).unwrap().log_id_server_remove_update =
            Some((77, core.current_version() + 1));
        core.push_update().unwrap();
        // no updatable servers left: removal confirms immediately
        assert!(core.entry(a).is_none());
        assert_eq!(core.take_confirm_invalidations(), vec![77]);

        let b = core.generate_unique_id();
        assert_eq!(b.index(), 1);
        assert_eq!(b.generation(), 1);
        // the stale handle no longer resolves
        assert!(core.get(a).is_err());
    }

    #[test]
    fn counts_track_status_transitions() {
        let mut core = RosterCore::new();
        let master = enlist(&mut core, updatable_mask());
        let _backup = enlist(
            &mut core,
            ServiceMask::from_services(&[
                Service::Backup,
                Service::Membership,
            ]),
        );
        assert_eq!(core.master_count(), 1);
        assert_eq!(core.backup_count(), 1);
        core.crashed(master).unwrap();
        core.push_update().unwrap();
        assert_eq!(core.master_count(), 0);
        assert_eq!(core.backup_count(), 1);
    }

    #[test]
    fn first_work_unit_is_full_snapshot() {
        let mut core = RosterCore::new();
        let id = enlist(&mut core, updatable_mask());
        assert_eq!(core.current_version(), 1);

        let unit = core.get_work().expect("work expected");
        assert_eq!(unit.target, id);
        assert!(unit.send_full);
        assert_eq!(unit.tail_version, 1);
        match unit.payload() {
            ListPayload::Full(msg) => {
                assert_eq!(msg.version, 1);
                assert_eq!(msg.entries.len(), 1);
            }
            other => panic!("expected full payload, got {:?}", other),
        }
        // contract (a): no second unit for the same target
        assert!(core.get_work().is_none());
        // a fruitless complete pass records the epoch it gave up at
        assert_eq!(core.scan_metadata().no_work_found_for_epoch, 1);
        assert!(core.scan_metadata().complete_scans >= 1);
    }

    #[test]
    fn speculative_version_rolls_back_and_retries() {
        let mut core = RosterCore::new();
        let id = enlist(&mut core, updatable_mask());
        let unit = core.get_work().unwrap();
        assert_eq!(core.entry(id).unwrap().update_version, 1);

        core.work_failed(id);
        let entry = core.get(id).unwrap();
        assert_eq!(entry.update_version, entry.verified_version);

        // the next scan re-issues the same range
        let retry = core.get_work().unwrap();
        assert_eq!(retry.tail_version, unit.tail_version);
        core.work_success(id);
        assert_eq!(core.get(id).unwrap().verified_version, 1);
        assert!(core.is_cluster_up_to_date());
    }

    #[test]
    fn incremental_ranges_batch_up() {
        let mut core = RosterCore::new();
        let id = enlist(&mut core, updatable_mask());
        // bring the first server up to date
        core.get_work().unwrap();
        core.work_success(id);

        // five more versions
        for _ in 0..5 {
            enlist(&mut core, updatable_mask());
        }
        let unit = core.get_work().unwrap();
        assert_eq!(unit.target, id);
        assert!(!unit.send_full);
        assert_eq!(
            unit.updates.iter().map(|p| p.version).collect::<Vec<_>>(),
            vec![2, 3, 4, 5, 6]
        );
        assert_eq!(unit.tail_version, 6);
    }

    #[test]
    fn pruning_follows_min_confirmed() {
        let mut core = RosterCore::new();
        let a = enlist(&mut core, updatable_mask());
        let b = enlist(&mut core, updatable_mask());

        // a catches up to version 2, b still at nothing
        let unit = core.get_work().unwrap();
        assert_eq!(unit.target, a);
        core.work_success(a);
        assert_eq!(core.min_confirmed_version(), 0);
        assert_eq!(core.oldest_update_version(), Some(1));

        let unit = core.get_work().unwrap();
        assert_eq!(unit.target, b);
        core.work_success(b);
        // both confirmed version 2: everything prunes
        assert_eq!(core.min_confirmed_version(), 2);
        assert_eq!(core.update_count(), 0);
        assert!(core.is_cluster_up_to_date());
    }

    #[test]
    fn updates_deque_invariants_hold() {
        let mut core = RosterCore::new();
        let a = enlist(&mut core, updatable_mask());
        for _ in 0..3 {
            enlist(&mut core, updatable_mask());
        }
        // the newest pair always sits at the current version
        assert_eq!(core.current_version(), 4);
        assert_eq!(core.latest_pair().unwrap().version, 4);
        // verified <= update <= current, for every entry
        for entry in core.iter() {
            assert!(entry.verified_version <= entry.update_version);
            assert!(entry.update_version <= core.current_version());
        }
        // retained history stays strictly above the confirmed minimum
        let unit = core.get_work().unwrap();
        assert_eq!(unit.target, a);
        core.work_success(a);
        if let Some(front) = core.oldest_update_version() {
            assert!(front > core.min_confirmed_version());
        }
    }

    #[test]
    fn crashed_server_stops_gating_pruning() {
        let mut core = RosterCore::new();
        let a = enlist(&mut core, updatable_mask());
        let b = enlist(&mut core, updatable_mask());
        // a confirms, b never does and then crashes
        while let Some(unit) = core.get_work() {
            if unit.target == a {
                core.work_success(a);
            } else {
                core.work_failed(b);
                break;
            }
        }
        core.crashed(b).unwrap();
        core.push_update().unwrap();
        // only a gates now; once it confirms the crash update, all is clean
        while let Some(unit) = core.get_work() {
            assert_eq!(unit.target, a);
            core.work_success(a);
        }
        assert!(core.is_cluster_up_to_date());
    }

    #[test]
    fn tracker_events_in_application_order() {
        let mut core = RosterCore::new();
        let mut rx = core.register_tracker();
        let a = enlist(&mut core, updatable_mask());
        core.crashed(a).unwrap();
        core.push_update().unwrap();
        core.stage_removal(a).unwrap();
        core.push_update().unwrap();

        let kinds: Vec<TrackerEventKind> = std::iter::from_fn(|| {
            rx.try_recv().ok().map(|event| event.kind)
        })
        .collect();
        assert_eq!(
            kinds,
            vec![
                TrackerEventKind::Add,
                TrackerEventKind::Crashed,
                TrackerEventKind::Removed,
            ]
        );
    }

    /// Random churn of enlist/confirm/fail/crash/remove keeps the list's
    /// invariants intact at every step.
    #[test]
    fn random_churn_preserves_invariants() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut core = RosterCore::new();
        let mut live: Vec<ServerId> = Vec::new();

        for _ in 0..500 {
            match rng.gen_range(0..5) {
                0 => {
                    live.push(enlist(&mut core, updatable_mask()));
                }
                1 => {
                    if let Some(unit) = core.get_work() {
                        if rng.gen_bool(0.3) {
                            core.work_failed(unit.target);
                        } else {
                            core.work_success(unit.target);
                        }
                    }
                }
                2 => {
                    if !live.is_empty() {
                        let id = live.remove(rng.gen_range(0..live.len()));
                        core.crashed(id).unwrap();
                        core.push_update().unwrap();
                        core.stage_removal(id).unwrap();
                        core.push_update().unwrap();
                    }
                }
                3 => {
                    while core.get_work().is_some() {}
                }
                _ => {
                    for &id in &live {
                        core.work_success(id);
                    }
                }
            }

            // version ordering and id uniqueness after every step
            let mut seen = std::collections::HashSet::new();
            for entry in core.iter() {
                assert!(entry.verified_version <= entry.update_version);
                assert!(entry.update_version <= core.current_version());
                assert!(seen.insert(entry.server_id));
            }
            // retained history stays strictly above the confirmed minimum
            if let Some(front) = core.oldest_update_version() {
                assert!(front > core.min_confirmed_version());
            }
        }
    }

    #[test]
    fn serialize_filters_by_service() {
        let mut core = RosterCore::new();
        enlist(&mut core, updatable_mask());
        enlist(
            &mut core,
            ServiceMask::from_services(&[
                Service::Backup,
                Service::Membership,
            ]),
        );
        let masters = core
            .serialize(&ServiceMask::from_services(&[Service::Master]));
        assert_eq!(masters.entries.len(), 1);
        let any = core.serialize(&ServiceMask::from_services(&[
            Service::Master,
            Service::Backup,
        ]));
        assert_eq!(any.entries.len(), 2);
    }
}
