//! Coordinator-side glue: configuration, the shared context handed to every
//! operation, and the injected capabilities of the surrounding service.

mod ops;
mod recovery;
mod roster;
mod updater;

pub use roster::Roster;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::ids::ServerId;
use crate::journal::LogClient;
use crate::transport::SessionFactory;
use crate::utils::RosterError;

/// Tunables of the coordinator membership subsystem.
#[derive(Debug, Clone, PartialEq)]
pub struct RosterConfig {
    /// Grace period of continuous update-RPC failures before an UP server is
    /// reported to the recovery manager as suspect.
    pub dead_server_timeout_ms: u64,

    /// Per-RPC deadline for outbound update pushes.
    pub session_timeout_ms: u64,

    /// How long to keep retrying the initial connect to a server's locator.
    pub port_timeout_ms: u64,

    /// This coordinator's own locator, for log lines and hand-off to
    /// surrounding services.
    pub coordinator_locator: String,

    /// Path of the journal backing file when running on a local file log.
    pub journal_path: String,
}

impl Default for RosterConfig {
    fn default() -> Self {
        RosterConfig {
            dead_server_timeout_ms: 250,
            session_timeout_ms: 1000,
            port_timeout_ms: 3000,
            coordinator_locator: "127.0.0.1:11100".into(),
            journal_path: "roster.journal.log".into(),
        }
    }
}

impl RosterConfig {
    /// Parses a config from an optional TOML string, keeping defaults for
    /// absent fields.
    pub fn from_toml(s: Option<&str>) -> Result<Self, RosterError> {
        parsed_config!(s => RosterConfig;
                       dead_server_timeout_ms,
                       session_timeout_ms,
                       port_timeout_ms,
                       coordinator_locator,
                       journal_path)
    }
}

/// Capability injected by the surrounding service to drive crash recovery.
/// Implementations must not block; heavy work belongs on their own tasks.
pub trait RecoveryManager: Send + Sync {
    /// A server was declared crashed and needs recovery. Called outside the
    /// membership lock with the server's opaque recovery blob. The manager
    /// eventually answers with `Roster::recovery_completed`.
    fn start_recovery(&self, server_id: ServerId, recovery_info: Vec<u8>);

    /// An UP server has been failing its update RPCs beyond the dead-server
    /// grace period. The external failure detector decides what to do.
    fn server_suspected(&self, server_id: ServerId);
}

/// Recovery manager that ignores every notification. Useful for embeddings
/// that run their own failure detection loop, and for tests.
pub struct NullRecoveryManager;

impl RecoveryManager for NullRecoveryManager {
    fn start_recovery(&self, _server_id: ServerId, _recovery_info: Vec<u8>) {}
    fn server_suspected(&self, _server_id: ServerId) {}
}

/// Named markers at which tests may terminate the coordinator
/// deterministically. An armed marker makes the reaching operation abort as
/// if the process had died there; the test then discards the instance and
/// replays the journal into a fresh one.
#[derive(Clone, Default)]
pub struct CrashPoints {
    armed: Arc<Mutex<HashSet<String>>>,
}

impl CrashPoints {
    pub fn new() -> Self {
        Default::default()
    }

    /// Arms the named marker.
    pub fn arm(&self, name: &str) {
        self.armed.lock().unwrap().insert(name.into());
    }

    /// Checked inside operations; aborts if the marker is armed.
    pub(crate) fn reached(&self, name: &str) -> Result<(), RosterError> {
        if self.armed.lock().unwrap().contains(name) {
            return Err(RosterError::msg(format!(
                "coordinator terminated at crash point '{}'",
                name
            )));
        }
        Ok(())
    }
}

/// Everything the coordinator's operations need from their surroundings,
/// passed explicitly instead of living in process-wide globals.
#[derive(Clone)]
pub struct Context {
    pub config: RosterConfig,

    /// Client of the external replicated log.
    pub log: Arc<dyn LogClient>,

    /// Factory for outbound update-push channels.
    pub sessions: Arc<dyn SessionFactory>,

    /// Crash-recovery hand-off into the surrounding service.
    pub recovery: Arc<dyn RecoveryManager>,

    /// Deterministic termination markers for crash testing.
    pub crash_points: CrashPoints,
}

impl Context {
    pub fn new(
        config: RosterConfig,
        log: Arc<dyn LogClient>,
        sessions: Arc<dyn SessionFactory>,
        recovery: Arc<dyn RecoveryManager>,
    ) -> Self {
        Context {
            config,
            log,
            sessions,
            recovery,
            crash_points: CrashPoints::new(),
        }
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn config_defaults_and_overrides() -> Result<(), RosterError> {
        let config = RosterConfig::from_toml(None)?;
        assert_eq!(config.dead_server_timeout_ms, 250);

        let config = RosterConfig::from_toml(Some(
            "dead_server_timeout_ms = 750\ncoordinator_locator = '10.0.0.1:9'",
        ))?;
        assert_eq!(config.dead_server_timeout_ms, 750);
        assert_eq!(config.coordinator_locator, "10.0.0.1:9");
        assert_eq!(config.session_timeout_ms, 1000);

        assert!(RosterConfig::from_toml(Some("no_such_knob = 1")).is_err());
        Ok(())
    }

    #[test]
    fn crash_points_abort_when_armed() {
        let points = CrashPoints::new();
        assert!(points.reached("enlist_1").is_ok());
        points.arm("enlist_1");
        assert!(points.reached("enlist_1").is_err());
        assert!(points.reached("enlist_2").is_ok());
    }
}
