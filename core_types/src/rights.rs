//! Capability rights
//!
//! Rights live on the *slot*, not on the object: the same object can be
//! held by different cap groups with different rights at the same time.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Rights carried by one capability slot
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct CapRights: u64 {
        /// Read the object (map a PMO readable, inspect state)
        const READ = 1 << 0;
        /// Modify the object (map a PMO writable)
        const WRITE = 1 << 1;
        /// Execute from the object
        const EXEC = 1 << 2;
        /// Derive new slots from this one with `cap_copy`
        const COPY = 1 << 62;
        /// Revoke every slot referencing the object system-wide
        const REVOKE_ALL = 1 << 63;
    }
}

impl CapRights {
    /// No rights at all
    pub const NONE: CapRights = CapRights::empty();

    /// Every defined right; what the creator of an object receives
    pub const ALL: CapRights = CapRights::all();

    /// Read + write, the common data-object grant
    pub const RW: CapRights = CapRights::READ.union(CapRights::WRITE);

    /// Computes the rights of a derived slot
    ///
    /// Bits under `mask` are taken from `rest`; every other bit is
    /// inherited unchanged from `self`.
    pub const fn change(self, mask: CapRights, rest: CapRights) -> CapRights {
        self.difference(mask).union(rest.intersection(mask))
    }

    /// Returns true if these rights satisfy `required`
    pub const fn contain(self, required: CapRights) -> bool {
        self.contains(required)
    }
}

/// Free-function form of [`CapRights::change`]
pub const fn cap_rights_change(rights: CapRights, mask: CapRights, rest: CapRights) -> CapRights {
    rights.change(mask, rest)
}

/// Free-function form of [`CapRights::contain`]
pub const fn cap_rights_contain(rights: CapRights, required: CapRights) -> bool {
    rights.contain(required)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_inherits_unmasked_bits() {
        let original = CapRights::READ | CapRights::WRITE | CapRights::COPY;
        let derived = original.change(CapRights::WRITE, CapRights::NONE);
        assert_eq!(derived, CapRights::READ | CapRights::COPY);
    }

    #[test]
    fn test_change_read_only_mask() {
        let derived = CapRights::ALL.change(CapRights::RW, CapRights::READ);
        assert!(derived.contain(CapRights::READ));
        assert!(!derived.contain(CapRights::WRITE));
        assert!(derived.contain(CapRights::COPY));
    }

    #[test]
    fn test_change_only_widens_under_mask() {
        let original = CapRights::READ;
        // rest asks for WRITE and EXEC but only EXEC is under the mask
        let derived = original.change(CapRights::EXEC, CapRights::WRITE | CapRights::EXEC);
        assert_eq!(derived, CapRights::READ | CapRights::EXEC);
        assert!(!derived.contain(CapRights::WRITE));
    }

    #[test]
    fn test_empty_mask_is_identity() {
        for rights in [CapRights::NONE, CapRights::READ, CapRights::ALL] {
            assert_eq!(cap_rights_change(rights, CapRights::NONE, CapRights::ALL), rights);
        }
    }

    #[test]
    fn test_contain() {
        assert!(cap_rights_contain(CapRights::RW, CapRights::READ));
        assert!(cap_rights_contain(CapRights::READ, CapRights::NONE));
        assert!(!cap_rights_contain(CapRights::READ, CapRights::RW));
    }
}
