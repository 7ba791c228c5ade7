//! Time abstractions
//!
//! Kernel time is measured in ticks of the per-CPU timer. User space sees
//! it as a [`TimeSpec`]; conversion uses the tick length from
//! [`crate::KernelConfig`].

use serde::{Deserialize, Serialize};
use std::fmt;

pub const NSEC_PER_SEC: u64 = 1_000_000_000;

/// `clock_nanosleep` flag: the request is an absolute time
pub const TIMER_ABSTIME: u64 = 1;

/// Clocks readable through `clock_gettime`
///
/// The simulated machine has no wall clock source, so both clocks count
/// from boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClockId {
    Realtime = 0,
    Monotonic = 1,
}

impl ClockId {
    pub fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(ClockId::Realtime),
            1 => Some(ClockId::Monotonic),
            _ => None,
        }
    }
}

/// Seconds plus nanoseconds, as exchanged with user space
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct TimeSpec {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

impl TimeSpec {
    /// Size of the user-memory representation
    pub const ENCODED_LEN: usize = 16;

    pub const fn new(tv_sec: i64, tv_nsec: i64) -> Self {
        Self { tv_sec, tv_nsec }
    }

    pub const fn from_nanos(nanos: u64) -> Self {
        Self {
            tv_sec: (nanos / NSEC_PER_SEC) as i64,
            tv_nsec: (nanos % NSEC_PER_SEC) as i64,
        }
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self::from_nanos(millis * 1_000_000)
    }

    /// Returns true if both fields are in range
    pub const fn is_valid(&self) -> bool {
        self.tv_sec >= 0 && self.tv_nsec >= 0 && (self.tv_nsec as u64) < NSEC_PER_SEC
    }

    /// Total nanoseconds, saturating; `None` for invalid values
    pub fn as_nanos(&self) -> Option<u64> {
        if !self.is_valid() {
            return None;
        }
        Some(
            (self.tv_sec as u64)
                .saturating_mul(NSEC_PER_SEC)
                .saturating_add(self.tv_nsec as u64),
        )
    }

    /// Converts a tick count into a time value
    pub fn from_ticks(ticks: u64, tick_ns: u64) -> Self {
        Self::from_nanos(ticks.saturating_mul(tick_ns))
    }

    /// Number of whole ticks needed to cover this duration (rounded up)
    pub fn to_ticks(&self, tick_ns: u64) -> Option<u64> {
        let nanos = self.as_nanos()?;
        Some(nanos.div_ceil(tick_ns.max(1)))
    }

    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[0..8].copy_from_slice(&self.tv_sec.to_le_bytes());
        out[8..16].copy_from_slice(&self.tv_nsec.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::ENCODED_LEN {
            return None;
        }
        let mut sec = [0u8; 8];
        let mut nsec = [0u8; 8];
        sec.copy_from_slice(&bytes[0..8]);
        nsec.copy_from_slice(&bytes[8..16]);
        Some(Self {
            tv_sec: i64::from_le_bytes(sec),
            tv_nsec: i64::from_le_bytes(nsec),
        })
    }
}

impl fmt::Display for TimeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}s", self.tv_sec, self.tv_nsec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: u64 = 10_000_000;

    #[test]
    fn test_ticks_round_up() {
        assert_eq!(TimeSpec::from_millis(10).to_ticks(TICK), Some(1));
        assert_eq!(TimeSpec::from_millis(11).to_ticks(TICK), Some(2));
        assert_eq!(TimeSpec::new(0, 0).to_ticks(TICK), Some(0));
    }

    #[test]
    fn test_from_ticks() {
        assert_eq!(TimeSpec::from_ticks(150, TICK), TimeSpec::new(1, 500_000_000));
    }

    #[test]
    fn test_invalid_nsec_rejected() {
        let bad = TimeSpec::new(1, NSEC_PER_SEC as i64);
        assert!(!bad.is_valid());
        assert_eq!(bad.to_ticks(TICK), None);
        assert_eq!(TimeSpec::new(-1, 0).as_nanos(), None);
    }

    #[test]
    fn test_user_layout() {
        let ts = TimeSpec::new(3, 25);
        assert_eq!(TimeSpec::from_bytes(&ts.to_bytes()), Some(ts));
        assert_eq!(TimeSpec::from_bytes(&[0u8; 4]), None);
    }

    #[test]
    fn test_clock_ids() {
        assert_eq!(ClockId::from_raw(1), Some(ClockId::Monotonic));
        assert_eq!(ClockId::from_raw(42), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(TimeSpec::new(2, 5).to_string(), "2.000000005s");
    }
}
