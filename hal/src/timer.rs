//! # Timer Device
//!
//! Hardware abstraction for the per-CPU timer.
//!
//! ## Philosophy
//!
//! **Time is a service, not a global variable.**
//!
//! Each CPU owns one timer device. The kernel reads the monotonic tick
//! counter from it and programs the tick at which the next timer interrupt
//! should fire on that CPU.
//!
//! ## Design Principles
//!
//! 1. **Monotonic**: Ticks never go backwards
//! 2. **Non-blocking**: Always returns immediately
//! 3. **Cumulative**: Returns total ticks since boot
//! 4. **One-shot deadlines**: Programming a deadline replaces the previous one

/// Per-CPU hardware timer
///
/// # Implementation Notes
///
/// - `poll_ticks` must be monotonic (never return a smaller value)
/// - `program_deadline` must not block
/// - Tick frequency is implementation-defined
///
/// # Examples
///
/// ```
/// use hal::TimerDevice;
///
/// fn arm_in<T: TimerDevice>(timer: &mut T, delta: u64) -> u64 {
///     let deadline = timer.poll_ticks() + delta;
///     timer.program_deadline(deadline);
///     deadline
/// }
/// ```
pub trait TimerDevice {
    /// Returns the current tick count
    fn poll_ticks(&mut self) -> u64;

    /// Requests a timer interrupt once the tick count reaches `tick`
    fn program_deadline(&mut self, tick: u64);

    /// Returns the currently programmed deadline, if any
    fn deadline(&self) -> Option<u64>;
}
