//! # Kernel API
//!
//! This crate defines the interface between user-space code and the kernel
//! core: error numbers, the syscall table, the time ABI and the boot-time
//! configuration.
//!
//! ## Philosophy
//!
//! The kernel provides **mechanisms**, not policies:
//! - Capabilities (not ambient authority)
//! - Synchronous IPC (not kernel-buffered messages)
//! - Threads and priorities (not process trees)
//! - Time and timed waits (explicit, not ambient)
//!
//! ## Design Goals
//!
//! 1. **Stable numbers**: syscall ids and errno values never change meaning
//! 2. **Explicitness**: every argument is a capability, a value or a user address
//! 3. **Type safety**: typed views over the raw register ABI
//!
//! ## Non-Goals
//!
//! This is NOT:
//! - POSIX (no fork, exec, signals, files)
//! - A user library (no message packing helpers beyond the wire header)

pub mod config;
pub mod error;
pub mod syscalls;
pub mod time;

pub use config::{ConfigError, KernelConfig, SchedPolicyKind, BITS_PER_LONG};
pub use error::{errno, KernelError, KernelResult};
pub use syscalls::{
    futex_op, CapGroupArgs, SyscallArgs, SyscallNumber, ThreadArgs, ThreadType, NR_SYSCALL,
};
pub use time::{ClockId, TimeSpec, NSEC_PER_SEC, TIMER_ABSTIME};
