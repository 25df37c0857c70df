//! Server identity, status, and service-mask types.

use std::fmt;

use fixedbitset::FixedBitSet;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Identifier of one storage server: a slot index in the coordinator's server
/// list plus a generation number that increments every time the slot is
/// reused. Stale handles therefore never match a live entry.
///
/// Index 0 is reserved; the all-zero id is "invalid" and never names a
/// server.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize,
    Deserialize, Default,
)]
pub struct ServerId {
    index: u32,
    generation: u32,
}

impl ServerId {
    /// The reserved invalid id.
    pub const INVALID: ServerId = ServerId {
        index: 0,
        generation: 0,
    };

    /// Creates an id from its parts.
    pub fn new(index: u32, generation: u32) -> Self {
        ServerId { index, generation }
    }

    /// Slot index within the server list.
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation number of the slot at the time of allocation.
    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Whether this id could name a server at all.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.index != 0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}.{}", self.index, self.generation)
        } else {
            write!(f, "invalid")
        }
    }
}

/// Life-cycle state of a server as tracked by the coordinator.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum ServerStatus {
    /// Enlisted and presumed healthy.
    Up,

    /// Suspected or confirmed dead; crash recovery may be in progress. A
    /// crashed server never comes back under the same id.
    Crashed,

    /// Recovery finished; the entry is being retired from the cluster.
    Removed,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ServerStatus::Up => write!(f, "UP"),
            ServerStatus::Crashed => write!(f, "CRASHED"),
            ServerStatus::Removed => write!(f, "REMOVED"),
        }
    }
}

/// Services a storage server may run. Used as bit positions in
/// [`ServiceMask`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum Service {
    /// Holds table data in memory.
    Master = 0,

    /// Holds segment replicas on durable storage.
    Backup = 1,

    /// Answers liveness probes.
    Ping = 2,

    /// Accepts management commands.
    Admin = 3,

    /// Accepts pushed server-list updates from the coordinator.
    Membership = 4,
}

/// Number of distinct services, i.e. the fixed width of a service mask.
const NUM_SERVICES: usize = 5;

const ALL_SERVICES: [Service; NUM_SERVICES] = [
    Service::Master,
    Service::Backup,
    Service::Ping,
    Service::Admin,
    Service::Membership,
];

/// Compact set of [`Service`] bits describing what a server runs.
#[derive(Clone, PartialEq, Eq)]
pub struct ServiceMask(FixedBitSet);

impl ServiceMask {
    /// Creates an empty mask.
    pub fn new() -> Self {
        ServiceMask(FixedBitSet::with_capacity(NUM_SERVICES))
    }

    /// Creates a mask with the given services set.
    pub fn from_services(services: &[Service]) -> Self {
        let mut mask = Self::new();
        for &s in services {
            mask.set(s, true);
        }
        mask
    }

    /// Sets or clears one service bit.
    #[inline]
    pub fn set(&mut self, service: Service, flag: bool) {
        self.0.set(service as usize, flag);
    }

    /// Whether the given service bit is set.
    #[inline]
    pub fn has(&self, service: Service) -> bool {
        self.0[service as usize]
    }

    /// Whether any service of `other` is also in `self`.
    pub fn intersects(&self, other: &ServiceMask) -> bool {
        ALL_SERVICES.iter().any(|&s| self.has(s) && other.has(s))
    }

    /// Number of services set.
    #[inline]
    pub fn count(&self) -> usize {
        self.0.count_ones(..)
    }

    /// Iterates over the services set in this mask.
    pub fn iter(&self) -> impl Iterator<Item = Service> + '_ {
        ALL_SERVICES.iter().copied().filter(|&s| self.has(s))
    }

    fn to_bits(&self) -> u32 {
        let mut bits = 0u32;
        for s in self.iter() {
            bits |= 1 << (s as u32);
        }
        bits
    }

    fn from_bits(bits: u32) -> Self {
        let mut mask = Self::new();
        for &s in ALL_SERVICES.iter() {
            if bits & (1 << (s as u32)) != 0 {
                mask.set(s, true);
            }
        }
        mask
    }
}

impl Default for ServiceMask {
    fn default() -> Self {
        Self::new()
    }
}

// Manual serde through the packed u32 representation; the bitset's own layout
// is an implementation detail that must not leak into journal records.
impl Serialize for ServiceMask {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.to_bits())
    }
}

impl<'de> Deserialize<'de> for ServiceMask {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u32::deserialize(deserializer)?;
        Ok(ServiceMask::from_bits(bits))
    }
}

// Manual `Debug` for terse trace printing, e.g. `{MASTER|MEMBERSHIP}`.
impl fmt::Debug for ServiceMask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{")?;
        let mut first = true;
        for s in self.iter() {
            if !first {
                write!(f, "|")?;
            }
            first = false;
            match s {
                Service::Master => write!(f, "MASTER")?,
                Service::Backup => write!(f, "BACKUP")?,
                Service::Ping => write!(f, "PING")?,
                Service::Admin => write!(f, "ADMIN")?,
                Service::Membership => write!(f, "MEMBERSHIP")?,
            }
        }
        write!(f, "}}")
    }
}
