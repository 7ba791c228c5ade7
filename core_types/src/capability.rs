//! Object types and capability lifecycle vocabulary
//!
//! ## Design Principles
//!
//! 1. **Unforgeable**: a capability is a slot in a kernel-owned table, user code
//!    only ever sees the slot number
//! 2. **Typed**: every object has exactly one [`ObjectType`] and lookups state
//!    which type they expect
//! 3. **Attenuable**: copies may carry fewer rights than their source
//! 4. **Auditable**: every lifecycle step is describable as a [`CapabilityEvent`]

use crate::{Badge, CapId, CapRights, ObjectId};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Concrete type of a kernel object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectType {
    /// Process-equivalent container of threads and capabilities
    CapGroup,
    /// Schedulable thread
    Thread,
    /// IPC connection between one client and one server handler
    Connection,
    /// Wait/signal primitive
    Notification,
    /// Physical memory object
    Pmo,
}

impl ObjectType {
    /// Every object type, in declaration order
    pub const ALL: [ObjectType; 5] = [
        ObjectType::CapGroup,
        ObjectType::Thread,
        ObjectType::Connection,
        ObjectType::Notification,
        ObjectType::Pmo,
    ];
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ObjectType::CapGroup => "cap_group",
            ObjectType::Thread => "thread",
            ObjectType::Connection => "connection",
            ObjectType::Notification => "notification",
            ObjectType::Pmo => "pmo",
        };
        f.write_str(name)
    }
}

/// Why a capability lookup was refused
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum CapabilityError {
    /// The slot is empty or out of range
    #[error("no capability in slot {0}")]
    EmptySlot(CapId),
    /// The slot names an object of another type
    #[error("capability {cap} names a {actual}, expected a {expected}")]
    TypeMismatch {
        cap: CapId,
        expected: ObjectType,
        actual: ObjectType,
    },
    /// The slot does not carry the requested rights
    #[error("capability {cap} lacks rights {required:?} (has {actual:?})")]
    InsufficientRights {
        cap: CapId,
        required: CapRights,
        actual: CapRights,
    },
}

/// Capability lifecycle event
///
/// Cap groups are identified by their badge, objects by their id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapabilityEvent {
    /// A fresh slot was installed for an object
    Allocated {
        object: ObjectId,
        object_type: ObjectType,
        group: Badge,
        cap: CapId,
        rights: CapRights,
    },
    /// A slot was derived from another slot
    Copied {
        object: ObjectId,
        from_group: Badge,
        from_cap: CapId,
        to_group: Badge,
        to_cap: CapId,
        rights: CapRights,
    },
    /// A slot was released
    Freed {
        object: ObjectId,
        group: Badge,
        cap: CapId,
    },
    /// Every slot of an object was revoked
    Revoked {
        object: ObjectId,
        by_group: Badge,
        slots_freed: usize,
    },
    /// The object's refcount reached zero and it was torn down
    Deinitialized {
        object: ObjectId,
        object_type: ObjectType,
    },
}

impl CapabilityEvent {
    /// Returns the object this event is about
    pub fn object(&self) -> ObjectId {
        match self {
            CapabilityEvent::Allocated { object, .. }
            | CapabilityEvent::Copied { object, .. }
            | CapabilityEvent::Freed { object, .. }
            | CapabilityEvent::Revoked { object, .. }
            | CapabilityEvent::Deinitialized { object, .. } => *object,
        }
    }
}
