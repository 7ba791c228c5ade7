//! # Simulated Clock and Timer Devices
//!
//! Deterministic time for the kernel core.
//!
//! ## Philosophy
//!
//! **Determinism enables thorough testing.**
//!
//! Time only advances when the host says so. One [`SimClock`] is shared by
//! every CPU; each CPU owns a [`SimTimerDevice`] that reads it and holds the
//! deadline the kernel last programmed.

use hal::TimerDevice;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Global monotonic tick counter
///
/// # Examples
///
/// ```
/// use sim_kernel::clock::SimClock;
///
/// let clock = SimClock::new();
/// assert_eq!(clock.now(), 0);
/// clock.advance(100);
/// clock.advance(50);
/// assert_eq!(clock.now(), 150);
/// ```
#[derive(Debug, Default)]
pub struct SimClock {
    ticks: AtomicU64,
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the clock at a non-zero tick
    pub fn with_initial_ticks(ticks: u64) -> Self {
        Self {
            ticks: AtomicU64::new(ticks),
        }
    }

    pub fn now(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Advances time by `delta` ticks; returns the new tick count
    pub fn advance(&self, delta: u64) -> u64 {
        let prev = self
            .ticks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| {
                Some(t.saturating_add(delta))
            })
            .unwrap_or(u64::MAX);
        prev.saturating_add(delta)
    }
}

/// Per-CPU timer backed by the shared clock
#[derive(Debug, Clone)]
pub struct SimTimerDevice {
    clock: Arc<SimClock>,
    deadline: Option<u64>,
}

impl SimTimerDevice {
    pub fn new(clock: Arc<SimClock>) -> Self {
        Self {
            clock,
            deadline: None,
        }
    }

    /// True once the programmed deadline has been reached
    pub fn expired(&self) -> bool {
        matches!(self.deadline, Some(deadline) if deadline <= self.clock.now())
    }

    pub fn clear_deadline(&mut self) {
        self.deadline = None;
    }
}

impl TimerDevice for SimTimerDevice {
    fn poll_ticks(&mut self) -> u64 {
        self.clock.now()
    }

    fn program_deadline(&mut self, tick: u64) {
        self.deadline = Some(tick);
    }

    fn deadline(&self) -> Option<u64> {
        self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_monotonic() {
        let clock = SimClock::with_initial_ticks(10);
        let t1 = clock.now();
        clock.advance(5);
        let t2 = clock.now();
        assert!(t2 > t1);
        assert_eq!(t2, 15);
    }

    #[test]
    fn test_advance_saturates() {
        let clock = SimClock::with_initial_ticks(u64::MAX - 1);
        assert_eq!(clock.advance(10), u64::MAX);
    }

    #[test]
    fn test_timers_share_clock() {
        let clock = Arc::new(SimClock::new());
        let mut cpu0 = SimTimerDevice::new(Arc::clone(&clock));
        let mut cpu1 = SimTimerDevice::new(Arc::clone(&clock));
        clock.advance(7);
        assert_eq!(cpu0.poll_ticks(), 7);
        assert_eq!(cpu1.poll_ticks(), 7);
    }

    #[test]
    fn test_deadline_expiry() {
        let clock = Arc::new(SimClock::new());
        let mut timer = SimTimerDevice::new(Arc::clone(&clock));
        assert!(!timer.expired());

        timer.program_deadline(3);
        clock.advance(2);
        assert!(!timer.expired());
        clock.advance(1);
        assert!(timer.expired());

        timer.clear_deadline();
        assert_eq!(timer.deadline(), None);
    }
}
