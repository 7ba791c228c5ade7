//! Capability Audit Trail
//!
//! Records every capability lifecycle step so tests can check the
//! refcount and revocation rules from the outside.
//!
//! ## Philosophy
//!
//! - Test-facing: this is not production logging, it is for verification
//! - Deterministic: events are recorded in the order they happened
//! - Queryable: tests assert on the trail instead of poking at internals
//!
//! ## Example
//!
//! ```
//! use sim_kernel::capability_audit::CapabilityAuditLog;
//! use core_types::{Badge, CapId, CapabilityEvent, ObjectId};
//!
//! let mut audit_log = CapabilityAuditLog::new();
//! audit_log.record_event(
//!     3,
//!     CapabilityEvent::Freed {
//!         object: ObjectId::from_raw(7),
//!         group: Badge::from_raw(1),
//!         cap: CapId::new(4),
//!     },
//! );
//!
//! assert_eq!(audit_log.get_events().len(), 1);
//! assert_eq!(audit_log.get_events_for_object(ObjectId::from_raw(7)).len(), 1);
//! ```

use core_types::{CapabilityEvent, ObjectId};

/// A single audit event with timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityAuditEvent {
    /// Kernel tick at which the event occurred
    pub timestamp: u64,
    pub event: CapabilityEvent,
}

/// Chronological record of capability events
#[derive(Debug, Default)]
pub struct CapabilityAuditLog {
    events: Vec<CapabilityAuditEvent>,
}

impl CapabilityAuditLog {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    /// Records a capability event at the given tick
    pub fn record_event(&mut self, timestamp: u64, event: CapabilityEvent) {
        self.events.push(CapabilityAuditEvent { timestamp, event });
    }

    pub fn get_events(&self) -> &[CapabilityAuditEvent] {
        &self.events
    }

    /// Returns the events about one object
    pub fn get_events_for_object(&self, object: ObjectId) -> Vec<&CapabilityAuditEvent> {
        self.events
            .iter()
            .filter(|e| e.event.object() == object)
            .collect()
    }

    /// Counts events matching the predicate
    pub fn count_events<F>(&self, predicate: F) -> usize
    where
        F: Fn(&CapabilityEvent) -> bool,
    {
        self.events.iter().filter(|e| predicate(&e.event)).count()
    }

    /// Checks if any event matches the predicate
    pub fn has_event<F>(&self, predicate: F) -> bool
    where
        F: Fn(&CapabilityEvent) -> bool,
    {
        self.events.iter().any(|e| predicate(&e.event))
    }

    /// Clears all events (useful for test reset)
    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::{Badge, CapId, CapRights, ObjectType};

    fn allocated(object: u64, cap: u32) -> CapabilityEvent {
        CapabilityEvent::Allocated {
            object: ObjectId::from_raw(object),
            object_type: ObjectType::Pmo,
            group: Badge::from_raw(1),
            cap: CapId::new(cap),
            rights: CapRights::ALL,
        }
    }

    #[test]
    fn test_audit_log_creation() {
        let log = CapabilityAuditLog::new();
        assert_eq!(log.len(), 0);
        assert!(log.is_empty());
    }

    #[test]
    fn test_record_and_get_events() {
        let mut log = CapabilityAuditLog::new();
        log.record_event(5, allocated(42, 2));

        let events = log.get_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].timestamp, 5);
        assert!(!log.is_empty());
    }

    #[test]
    fn test_get_events_for_object() {
        let mut log = CapabilityAuditLog::new();
        log.record_event(1, allocated(42, 2));
        log.record_event(2, allocated(43, 3));
        log.record_event(
            3,
            CapabilityEvent::Deinitialized {
                object: ObjectId::from_raw(42),
                object_type: ObjectType::Pmo,
            },
        );

        let events = log.get_events_for_object(ObjectId::from_raw(42));
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].timestamp, 3);
    }

    #[test]
    fn test_count_and_has_event() {
        let mut log = CapabilityAuditLog::new();
        log.record_event(1, allocated(1, 2));
        log.record_event(1, allocated(2, 3));
        log.record_event(
            2,
            CapabilityEvent::Freed {
                object: ObjectId::from_raw(1),
                group: Badge::from_raw(1),
                cap: CapId::new(2),
            },
        );

        assert_eq!(
            log.count_events(|e| matches!(e, CapabilityEvent::Allocated { .. })),
            2
        );
        assert!(log.has_event(|e| matches!(e, CapabilityEvent::Freed { .. })));
        assert!(!log.has_event(|e| matches!(e, CapabilityEvent::Revoked { .. })));
    }

    #[test]
    fn test_clear() {
        let mut log = CapabilityAuditLog::new();
        log.record_event(1, allocated(1, 2));
        log.clear();
        assert!(log.is_empty());
    }
}
