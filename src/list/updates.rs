//! History of published server-list updates.
//!
//! Each published version is kept as an [`UpdatePair`] holding both the diff
//! that produced the version and the full snapshot at it. Pairs live behind
//! `Arc`s: the updater captures the range a work unit covers while holding
//! the membership lock, after which the RPC task reads the shared pairs with
//! no lock at all. Pruning the deque therefore never invalidates a range an
//! RPC still refers to; the last `Arc` keeps its pair alive.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::message::{EntryMsg, ListKind, ListMessage};

/// The incremental and full server list for one published version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePair {
    /// Version of both contained lists.
    pub version: u64,

    /// The diff published at `version`.
    pub incremental: ListMessage,

    /// The entire list as of `version`.
    pub full: ListMessage,
}

/// Staged changes plus the deque of sealed update pairs.
///
/// Within one staged batch, crash/removal events are always ordered before
/// additions, so a receiver seeing a slot recycled within one incremental
/// retires the old server before adding its successor. The two staging
/// buffers enforce that regardless of the order operations stage in.
#[derive(Debug, Default)]
pub(crate) struct UpdateLog {
    /// Staged crash/removal events for the next published version.
    staged_departures: Vec<EntryMsg>,

    /// Staged additions and other entry refreshes for the next version.
    staged_additions: Vec<EntryMsg>,

    /// Sealed pairs with contiguous versions; only the ends are mutated.
    deque: VecDeque<Arc<UpdatePair>>,
}

impl UpdateLog {
    pub(crate) fn new() -> Self {
        Default::default()
    }

    /// Whether any changes await publication.
    pub(crate) fn has_staged(&self) -> bool {
        !self.staged_departures.is_empty() || !self.staged_additions.is_empty()
    }

    /// Stages a crash or removal event.
    pub(crate) fn stage_departure(&mut self, msg: EntryMsg) {
        self.staged_departures.push(msg);
    }

    /// Stages an addition or entry refresh.
    pub(crate) fn stage_addition(&mut self, msg: EntryMsg) {
        self.staged_additions.push(msg);
    }

    /// Seals the staged batch into the pair for `version`, with `full` the
    /// snapshot computed at the same instant, and appends it to the deque.
    pub(crate) fn seal(
        &mut self,
        version: u64,
        full: ListMessage,
    ) -> Arc<UpdatePair> {
        debug_assert!(self.has_staged());
        debug_assert!(self
            .deque
            .back()
            .map(|p| p.version + 1 == version)
            .unwrap_or(true));

        let mut incremental = ListMessage::new(ListKind::Incremental, version);
        incremental.entries.append(&mut self.staged_departures);
        incremental.entries.append(&mut self.staged_additions);

        let pair = Arc::new(UpdatePair {
            version,
            incremental,
            full,
        });
        self.deque.push_back(pair.clone());
        pair
    }

    /// Version of the oldest retained pair.
    pub(crate) fn front_version(&self) -> Option<u64> {
        self.deque.front().map(|p| p.version)
    }

    /// The newest pair, if any.
    pub(crate) fn latest(&self) -> Option<Arc<UpdatePair>> {
        self.deque.back().cloned()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.deque.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.deque.len()
    }

    /// Drops pairs from the front while their version is at or below
    /// `min_confirmed`. Returns how many were dropped.
    pub(crate) fn prune(&mut self, min_confirmed: u64) -> usize {
        let mut dropped = 0;
        while let Some(front) = self.deque.front() {
            if front.version > min_confirmed {
                break;
            }
            self.deque.pop_front();
            dropped += 1;
        }
        dropped
    }

    /// Returns up to `max` pairs with contiguous versions starting exactly at
    /// `from_version`. Empty if that version is no longer (or not yet)
    /// retained.
    pub(crate) fn collect_range(
        &self,
        from_version: u64,
        max: usize,
    ) -> Vec<Arc<UpdatePair>> {
        let Some(front) = self.front_version() else {
            return Vec::new();
        };
        if from_version < front {
            return Vec::new();
        }
        // versions are contiguous, so the deque index is just the offset
        let skip = (from_version - front) as usize;
        self.deque.iter().skip(skip).take(max).cloned().collect()
    }
}
