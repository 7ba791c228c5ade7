//! Unique identifiers for kernel entities

use serde::{Deserialize, Serialize};
use std::fmt;

/// Capability number: an index into one cap group's slot table
///
/// A `CapId` only means something relative to the cap group that owns the
/// slot. The same object is usually reachable under different `CapId`s in
/// different cap groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CapId(u32);

impl CapId {
    /// Creates a capability number from a raw slot index
    pub const fn new(slot: u32) -> Self {
        Self(slot)
    }

    /// Converts a raw syscall argument into a capability number
    ///
    /// Negative values (errors smuggled through a `cap_t`) are rejected.
    pub fn from_raw(raw: i64) -> Option<Self> {
        u32::try_from(raw).ok().map(Self)
    }

    /// Returns the slot index
    pub const fn slot(&self) -> usize {
        self.0 as usize
    }

    /// Returns the value as a syscall return value
    pub const fn as_raw(&self) -> i64 {
        self.0 as i64
    }
}

impl fmt::Display for CapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cap#{}", self.0)
    }
}

/// Globally unique identifier of a kernel object
///
/// Object ids are never reused during the lifetime of a kernel instance.
/// Threads are objects, so a thread is identified by its object id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Creates an object id from its raw value
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value
    pub const fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Object({})", self.0)
    }
}

/// Threads are addressed by the id of their object
pub type ThreadId = ObjectId;

/// Per-client identifier attached to every IPC connection
///
/// The badge of a cap group is fixed at creation and is handed to servers on
/// every call so they can tell clients apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Badge(u64);

impl Badge {
    /// Creates a badge from its raw value
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value
    pub const fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Badge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Badge({:#x})", self.0)
    }
}

/// Identifier of a CPU core
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CpuId(pub usize);

impl CpuId {
    /// Returns the core index
    pub const fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CPU{}", self.0)
    }
}
