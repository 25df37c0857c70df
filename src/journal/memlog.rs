//! In-memory implementation of the replicated-log client.
//!
//! Behaves like the external log as far as the coordinator can tell:
//! linearizable appends with strictly increasing entry ids and atomic
//! append+invalidate. Used by tests and by embeddings that bring their own
//! durability.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::journal::{EntryId, LogClient, Record};
use crate::utils::RosterError;

use async_trait::async_trait;

struct MemLogInner {
    /// Next entry id to hand out. Starts at 1 and never goes backwards,
    /// regardless of invalidations.
    next_id: EntryId,

    /// Live records keyed by entry id; iteration order is append order.
    live: BTreeMap<EntryId, Record>,
}

/// Volatile stand-in for the external replicated log.
#[derive(Clone)]
pub struct MemLog {
    inner: Arc<Mutex<MemLogInner>>,
}

impl MemLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        MemLog {
            inner: Arc::new(Mutex::new(MemLogInner {
                next_id: 1,
                live: BTreeMap::new(),
            })),
        }
    }

    /// Number of live (not invalidated) records.
    pub fn live_len(&self) -> usize {
        self.inner.lock().unwrap().live.len()
    }

    /// Snapshot of live records, in id order.
    pub fn live_records(&self) -> Vec<(EntryId, Record)> {
        self.inner
            .lock()
            .unwrap()
            .live
            .iter()
            .map(|(&id, rec)| (id, rec.clone()))
            .collect()
    }
}

impl Default for MemLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogClient for MemLog {
    async fn append(
        &self,
        record: Record,
        invalidates: &[EntryId],
    ) -> Result<EntryId, RosterError> {
        let mut inner = self.inner.lock().unwrap();
        for id in invalidates {
            if inner.live.remove(id).is_none() {
                return Err(RosterError::Journal(format!(
                    "invalidating unknown entry id {}",
                    id
                )));
            }
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.live.insert(id, record);
        Ok(id)
    }

    async fn invalidate(&self, ids: &[EntryId]) -> Result<(), RosterError> {
        let mut inner = self.inner.lock().unwrap();
        for id in ids {
            if inner.live.remove(id).is_none() {
                return Err(RosterError::Journal(format!(
                    "invalidating unknown entry id {}",
                    id
                )));
            }
        }
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<(EntryId, Record)>, RosterError> {
        Ok(self.live_records())
    }
}
