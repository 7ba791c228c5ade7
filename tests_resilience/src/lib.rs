//! Resilience Test Utilities
//!
//! This crate provides shared utilities for end-to-end kernel tests.
//!
//! ## Test Philosophy
//!
//! - **No capability leaks**: a revoked or exited holder leaves no usable slot
//! - **Rights only shrink**: a derived capability never carries more than its source
//! - **No lost or double wakeups**: every blocked thread becomes runnable exactly once
//! - **Races are real**: multi-CPU scenarios drive one shared kernel from host threads

use core_types::{CapId, CpuId};
use sim_kernel::test_utils::{boot_kernel, run_on, spawn_thread, ROOT_CPU};
use sim_kernel::{Kernel, ThreadRef};
use std::sync::{Arc, Barrier};
use std::thread;

/// Bootstrap helper for tests
///
/// Boots a kernel on `cpus` CPUs, shareable across host threads.
pub fn test_bootstrap(cpus: usize) -> Arc<Kernel> {
    Arc::new(boot_kernel(cpus))
}

/// Creates a thread in the root cap group and makes it current on `cpu`
pub fn start_on(kernel: &Kernel, cpu: CpuId, prio: u32) -> ThreadRef {
    let thread = spawn_thread(kernel, ROOT_CPU, prio);
    run_on(kernel, cpu, &thread);
    thread
}

/// Runs `a` and `b` on two host threads released at the same instant
///
/// Returns both results once both threads have finished.
pub fn race<A, B, RA, RB>(a: A, b: B) -> (RA, RB)
where
    A: FnOnce() -> RA + Send + 'static,
    B: FnOnce() -> RB + Send + 'static,
    RA: Send + 'static,
    RB: Send + 'static,
{
    let start = Arc::new(Barrier::new(2));
    let start_a = Arc::clone(&start);
    let first = thread::spawn(move || {
        start_a.wait();
        a()
    });
    start.wait();
    let second = b();
    match first.join() {
        Ok(first) => (first, second),
        Err(payload) => std::panic::resume_unwind(payload),
    }
}

/// Decodes a syscall return value that should be a capability
pub fn expect_cap(raw: i64) -> CapId {
    CapId::from_raw(raw).unwrap_or_else(|| panic!("expected a capability, got {}", raw))
}
