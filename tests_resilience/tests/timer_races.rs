//! Timer Race Tests
//!
//! A timed wait can end two ways at once: its timeout fires on one CPU
//! while a signal arrives on another. Exactly one of them may wake the
//! waiter, and a signal that loses the race must stay pending.

use core_types::{CapId, CpuId};
use kernel_api::{KernelError, TimeSpec};
use sim_kernel::test_utils::ROOT_CPU;
use sim_kernel::{Kernel, Notification, SyscallOutcome, ThreadRef, ThreadState};
use std::sync::Arc;
use tests_resilience::{race, start_on, test_bootstrap};

const ROUNDS: usize = 200;

struct TimedWait {
    kernel: Arc<Kernel>,
    waiter: ThreadRef,
    cap: CapId,
}

/// Root waits on a fresh notification for one tick; a second thread runs
/// on CPU 1 so it can signal from there.
fn timed_wait(cpus: usize) -> TimedWait {
    let kernel = test_bootstrap(cpus);
    let waiter = kernel.current_thread(ROOT_CPU).unwrap();
    let prio = kernel.config().default_prio;
    for cpu in 1..cpus {
        start_on(&kernel, CpuId(cpu), prio);
    }
    let cap = kernel.sys_create_notifc(ROOT_CPU).unwrap();
    let outcome = kernel
        .sys_wait(ROOT_CPU, cap, true, Some(&TimeSpec::from_millis(10)))
        .unwrap();
    assert!(outcome.is_switch());
    assert_eq!(waiter.state(), ThreadState::Blocking);
    TimedWait { kernel, waiter, cap }
}

/// Ready threads across all CPUs; a woken thread queues where it was woken
fn queued(kernel: &Kernel) -> usize {
    (0..kernel.config().cpu_count)
        .map(|cpu| kernel.sched_policy().queue_len(CpuId(cpu)))
        .sum()
}

fn pending(wait: &TimedWait) -> (u32, usize) {
    let group = wait.kernel.root_process().unwrap().cap_group;
    let notifc = wait.kernel.obj_get::<Notification>(&group, wait.cap).unwrap();
    (notifc.pending_signals(), notifc.waiter_count())
}

/// Test: Timeout and signal racing wake the waiter exactly once
#[test]
fn test_timeout_races_signal() {
    for _ in 0..ROUNDS {
        let wait = timed_wait(2);
        let (timer_kernel, notify_kernel) = (Arc::clone(&wait.kernel), Arc::clone(&wait.kernel));
        let cap = wait.cap;

        let (fired, notified) = race(
            move || {
                timer_kernel.clock().advance(1);
                timer_kernel.handle_timer_irq(ROOT_CPU)
            },
            move || notify_kernel.sys_notify(CpuId(1), cap),
        );
        assert_eq!(notified, Ok(()));
        // the interrupt never leaves a due sleeper behind
        assert!(matches!(fired, Ok(0 | 1)));

        assert_eq!(wait.waiter.state(), ThreadState::Ready);
        assert_eq!(queued(&wait.kernel), 1);
        assert_eq!(wait.kernel.time_state(ROOT_CPU).unwrap().sleeper_count(), 0);

        let (signals, waiters) = pending(&wait);
        assert_eq!(waiters, 0);
        match wait.waiter.ret() {
            0 => assert_eq!(signals, 0),
            ret => {
                assert_eq!(ret, KernelError::TimedOut.errno());
                assert_eq!(signals, 1);
            }
        }
    }
}

/// Test: Two signals racing for one waiter
///
/// One wakes it, the other is remembered.
#[test]
fn test_two_signals_one_waiter() {
    for _ in 0..ROUNDS {
        let wait = timed_wait(3);
        let (first, second) = (Arc::clone(&wait.kernel), Arc::clone(&wait.kernel));
        let cap = wait.cap;

        let (a, b) = race(
            move || first.sys_notify(CpuId(1), cap),
            move || second.sys_notify(CpuId(2), cap),
        );
        assert_eq!((a, b), (Ok(()), Ok(())));

        assert_eq!(wait.waiter.state(), ThreadState::Ready);
        assert_eq!(wait.waiter.ret(), 0);
        assert_eq!(queued(&wait.kernel), 1);
        assert_eq!(pending(&wait), (1, 0));
        assert_eq!(wait.kernel.time_state(ROOT_CPU).unwrap().sleeper_count(), 0);
    }
}

/// Test: An undisturbed timeout fires once and runs the waiter again
#[test]
fn test_timeout_alone() {
    let wait = timed_wait(1);
    assert_eq!(wait.kernel.is_idle(ROOT_CPU), Ok(true));

    wait.kernel.clock().advance(1);
    assert_eq!(wait.kernel.handle_timer_irq(ROOT_CPU), Ok(1));
    assert_eq!(wait.kernel.handle_timer_irq(ROOT_CPU), Ok(0));
    assert_eq!(wait.waiter.ret(), KernelError::TimedOut.errno());
    assert_eq!(pending(&wait), (0, 0));

    // the next tick puts the waiter back on the CPU
    wait.kernel.advance_ticks(1);
    assert!(wait.kernel.current_thread(ROOT_CPU).unwrap().ptr_eq(&wait.waiter));

    // a late signal is kept for the next wait
    wait.kernel.sys_notify(ROOT_CPU, wait.cap).unwrap();
    assert_eq!(
        wait.kernel.sys_wait(ROOT_CPU, wait.cap, false, None),
        Ok(SyscallOutcome::Return(0))
    );
}
