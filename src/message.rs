//! Wire messages published to cluster members.
//!
//! The coordinator pushes either a full snapshot of the server list or a
//! contiguous run of single-version incrementals. All messages are plain
//! serde structs; the transport frames them with MessagePack.

use crate::ids::{ServerId, ServerStatus, ServiceMask};

use serde::{Deserialize, Serialize};

/// State of one server as published to the cluster. In an incremental
/// message the `status` field doubles as the event: a new `Up` entry is an
/// addition, `Crashed`/`Removed` are the corresponding transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMsg {
    /// Which server this is about.
    pub server_id: ServerId,

    /// Status at (or transition published at) this version.
    pub status: ServerStatus,

    /// Services the server runs.
    pub services: ServiceMask,

    /// Opaque address string understood by the transport.
    pub service_locator: String,

    /// Advertised backup read speed in MB/s.
    pub read_speed_mbs: u32,

    /// Replication group, 0 when the server belongs to none.
    pub replication_id: u64,
}

/// Whether a [`ListMessage`] carries the whole list or a single-version diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListKind {
    /// The complete server list as of `version`.
    Full,

    /// The changes that produced `version` from `version - 1`.
    Incremental,
}

/// One version of the server list, either in full or as a diff.
///
/// Within an incremental, crash and removal events always precede additions
/// so that a receiver observing a slot being recycled in a single message
/// retires the old server before learning of its successor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListMessage {
    /// Snapshot or diff.
    pub kind: ListKind,

    /// Server list version this message brings the receiver up to.
    pub version: u64,

    /// Member entries (all of them for `Full`, the changed ones for
    /// `Incremental`).
    pub entries: Vec<EntryMsg>,
}

impl ListMessage {
    /// Creates an empty message shell of the given kind and version.
    pub fn new(kind: ListKind, version: u64) -> Self {
        ListMessage {
            kind,
            version,
            entries: Vec::new(),
        }
    }
}

/// Payload of one `UpdateServerList` RPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListPayload {
    /// Replace the receiver's entire list.
    Full(ListMessage),

    /// Apply a contiguous run of incrementals, oldest first. A well-behaved
    /// receiver ignores (but still acknowledges) any prefix whose version is
    /// at or below its current version.
    Increments(Vec<ListMessage>),
}

impl ListPayload {
    /// Version the receiver ends up at after applying this payload.
    pub fn tail_version(&self) -> u64 {
        match self {
            ListPayload::Full(msg) => msg.version,
            ListPayload::Increments(msgs) => {
                msgs.last().map(|m| m.version).unwrap_or(0)
            }
        }
    }

    /// Version of the first message contained.
    pub fn head_version(&self) -> u64 {
        match self {
            ListPayload::Full(msg) => msg.version,
            ListPayload::Increments(msgs) => {
                msgs.first().map(|m| m.version).unwrap_or(0)
            }
        }
    }
}

/// Response to an `UpdateServerList` RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateReply {
    /// True iff the receiver applied (or had already applied) the payload.
    /// The coordinator commits the speculative version only on an explicit
    /// ack; anything else is rolled back and retried.
    pub ack: bool,

    /// The receiver's list version after handling the payload.
    pub current_version: u64,
}

#[cfg(test)]
mod message_tests {
    use super::*;
    use crate::ids::Service;

    fn sample_entry(index: u32) -> EntryMsg {
        EntryMsg {
            server_id: ServerId::new(index, 0),
            status: ServerStatus::Up,
            services: ServiceMask::from_services(&[
                Service::Master,
                Service::Membership,
            ]),
            service_locator: format!("tcp:host=node{}", index),
            read_speed_mbs: 100,
            replication_id: 0,
        }
    }

    #[test]
    fn payload_version_ranges() {
        let full = ListPayload::Full(ListMessage {
            kind: ListKind::Full,
            version: 7,
            entries: vec![sample_entry(1)],
        });
        assert_eq!(full.head_version(), 7);
        assert_eq!(full.tail_version(), 7);

        let incs = ListPayload::Increments(
            (3..=5)
                .map(|v| ListMessage {
                    kind: ListKind::Incremental,
                    version: v,
                    entries: vec![sample_entry(v as u32)],
                })
                .collect(),
        );
        assert_eq!(incs.head_version(), 3);
        assert_eq!(incs.tail_version(), 5);
    }
}
