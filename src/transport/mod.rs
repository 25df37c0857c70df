//! Outbound transport abstraction for pushing server-list updates.
//!
//! The coordinator never talks to sockets directly; it asks a
//! [`SessionFactory`] for a best-effort request/response channel to a target
//! server and issues `UpdateServerList` calls on it. A TCP implementation
//! lives in [`tcp`]; tests use the scripted [`MockSessionFactory`].

mod tcp;

pub use tcp::TcpSessionFactory;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::ids::ServerId;
use crate::message::ListPayload;
use crate::utils::RosterError;

use async_trait::async_trait;

use tokio::time::{self, Duration};

/// One request/response channel to a single target server.
#[async_trait]
pub trait Session: Send + Sync {
    /// Pushes a server-list payload to the target. `Ok(true)` means the
    /// target explicitly acknowledged applying (or having already applied)
    /// the payload; `Ok(false)` is an explicit rejection. Transport errors
    /// and timeouts come back as `Err(RosterError::Transport)`.
    async fn update_server_list(
        &self,
        payload: ListPayload,
    ) -> Result<bool, RosterError>;
}

/// Yields sessions to target servers, caching per-target channels.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Opens (or reuses) a session to `target` at `locator`.
    async fn open(
        &self,
        target: ServerId,
        locator: &str,
    ) -> Result<Arc<dyn Session>, RosterError>;
}

/// Per-target receiver state simulated by the mock transport.
#[derive(Debug, Default, Clone)]
struct MockReceiver {
    /// The receiver's applied server-list version.
    applied: u64,

    /// Scripted number of upcoming calls to fail with a transport error.
    fail_next: u32,

    /// Scripted number of upcoming calls to answer with a NACK.
    nack_next: u32,

    /// Permanently unreachable (connection refused).
    unreachable: bool,

    /// Everything ever delivered to this receiver, for assertions.
    deliveries: Vec<ListPayload>,

    /// Calls currently executing against this receiver.
    active: u32,

    /// High-water mark of `active`, for in-flight assertions.
    max_active: u32,
}

struct MockState {
    receivers: HashMap<ServerId, MockReceiver>,

    /// Artificial latency added to every call.
    delay: Option<Duration>,
}

/// Scripted in-process transport implementing well-behaved receivers:
/// duplicate payloads are ignored but still acknowledged, version gaps are
/// rejected, and everything delivered is recorded for assertions.
#[derive(Clone)]
pub struct MockSessionFactory {
    state: Arc<Mutex<MockState>>,
}

impl MockSessionFactory {
    pub fn new() -> Self {
        MockSessionFactory {
            state: Arc::new(Mutex::new(MockState {
                receivers: HashMap::new(),
                delay: None,
            })),
        }
    }

    /// Adds artificial latency to every subsequent call.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state.lock().unwrap().delay = delay;
    }

    /// Scripts the next `n` calls to `target` to fail with a transport
    /// error.
    pub fn fail_next(&self, target: ServerId, n: u32) {
        self.state
            .lock()
            .unwrap()
            .receivers
            .entry(target)
            .or_default()
            .fail_next = n;
    }

    /// Scripts the next `n` calls to `target` to be rejected.
    pub fn nack_next(&self, target: ServerId, n: u32) {
        self.state
            .lock()
            .unwrap()
            .receivers
            .entry(target)
            .or_default()
            .nack_next = n;
    }

    /// Marks `target` (un)reachable.
    pub fn set_unreachable(&self, target: ServerId, unreachable: bool) {
        self.state
            .lock()
            .unwrap()
            .receivers
            .entry(target)
            .or_default()
            .unreachable = unreachable;
    }

    /// The version `target` has applied so far.
    pub fn applied_version(&self, target: ServerId) -> u64 {
        self.state
            .lock()
            .unwrap()
            .receivers
            .get(&target)
            .map(|r| r.applied)
            .unwrap_or(0)
    }

    /// Everything delivered to `target`, in order.
    pub fn deliveries(&self, target: ServerId) -> Vec<ListPayload> {
        self.state
            .lock()
            .unwrap()
            .receivers
            .get(&target)
            .map(|r| r.deliveries.clone())
            .unwrap_or_default()
    }

    /// Most calls that were ever executing concurrently against `target`.
    pub fn max_in_flight(&self, target: ServerId) -> u32 {
        self.state
            .lock()
            .unwrap()
            .receivers
            .get(&target)
            .map(|r| r.max_active)
            .unwrap_or(0)
    }
}

impl Default for MockSessionFactory {
    fn default() -> Self {
        Self::new()
    }
}

struct MockSession {
    target: ServerId,
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl Session for MockSession {
    async fn update_server_list(
        &self,
        payload: ListPayload,
    ) -> Result<bool, RosterError> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            let receiver = state.receivers.entry(self.target).or_default();
            receiver.active += 1;
            receiver.max_active = receiver.max_active.max(receiver.active);
            state.delay
        };
        if let Some(delay) = delay {
            time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        let receiver = state.receivers.entry(self.target).or_default();
        receiver.active -= 1;
        if receiver.unreachable {
            return Err(RosterError::Transport(format!(
                "server {} unreachable",
                self.target
            )));
        }
        if receiver.fail_next > 0 {
            receiver.fail_next -= 1;
            return Err(RosterError::Transport(format!(
                "scripted send failure to {}",
                self.target
            )));
        }
        receiver.deliveries.push(payload.clone());
        if receiver.nack_next > 0 {
            receiver.nack_next -= 1;
            return Ok(false);
        }

        // well-behaved receiver: dedupe stale prefixes, reject gaps
        match payload {
            ListPayload::Full(msg) => {
                if msg.version > receiver.applied {
                    receiver.applied = msg.version;
                }
                Ok(true)
            }
            ListPayload::Increments(msgs) => {
                for msg in msgs {
                    if msg.version <= receiver.applied {
                        continue; // duplicate, ignore but still ack
                    }
                    if msg.version != receiver.applied + 1 {
                        return Ok(false); // gap: cannot apply
                    }
                    receiver.applied = msg.version;
                }
                Ok(true)
            }
        }
    }
}

#[async_trait]
impl SessionFactory for MockSessionFactory {
    async fn open(
        &self,
        target: ServerId,
        _locator: &str,
    ) -> Result<Arc<dyn Session>, RosterError> {
        Ok(Arc::new(MockSession {
            target,
            state: self.state.clone(),
        }))
    }
}

#[cfg(test)]
mod mock_tests {
    use super::*;
    use crate::message::{ListKind, ListMessage};

    fn increments(range: std::ops::RangeInclusive<u64>) -> ListPayload {
        ListPayload::Increments(
            range
                .map(|v| ListMessage::new(ListKind::Incremental, v))
                .collect(),
        )
    }

    #[tokio::test]
    async fn receiver_dedupes_and_rejects_gaps() -> Result<(), RosterError> {
        let factory = MockSessionFactory::new();
        let target = ServerId::new(1, 0);
        let session = factory.open(target, "tcp:host=x").await?;

        let full = ListPayload::Full(ListMessage::new(ListKind::Full, 2));
        assert!(session.update_server_list(full).await?);
        assert_eq!(factory.applied_version(target), 2);

        // duplicate prefix is ignored but acked
        assert!(session.update_server_list(increments(1..=3)).await?);
        assert_eq!(factory.applied_version(target), 3);

        // a gap is rejected
        assert!(!session.update_server_list(increments(6..=7)).await?);
        assert_eq!(factory.applied_version(target), 3);
        Ok(())
    }

    #[tokio::test]
    async fn scripted_failures_then_recover() -> Result<(), RosterError> {
        let factory = MockSessionFactory::new();
        let target = ServerId::new(2, 0);
        let session = factory.open(target, "tcp:host=x").await?;
        factory.fail_next(target, 2);
        assert!(session
            .update_server_list(increments(1..=1))
            .await
            .is_err());
        assert!(session
            .update_server_list(increments(1..=1))
            .await
            .is_err());
        assert!(session.update_server_list(increments(1..=1)).await?);
        assert_eq!(factory.deliveries(target).len(), 1);
        Ok(())
    }
}
