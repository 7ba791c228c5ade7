//! Scheduler
//!
//! Scheduling is split into a policy, which owns the per-CPU ready queues
//! and decides who runs next, and the mechanism in this module, which
//! switches the CPU's notion of "current", charges budgets on ticks and
//! implements the scheduling syscalls.
//!
//! ## Design
//!
//! - **Pluggable policy**: [`SchedPolicy`] is selected once at boot from
//!   [`KernelConfig::sched_policy`]
//! - **Strict priorities**: a higher priority always wins; within one
//!   priority threads rotate when their budget runs out
//! - **Explicit switches**: every switch is recorded in the
//!   [`ScheduleAuditLog`] so tests can assert dispatch order
//!
//! A CPU with no current thread runs its idle thread.

mod pb;
mod rr;

pub use pb::PriorityPolicy;
pub use rr::RoundRobinPolicy;

use crate::syscall_gate::SyscallOutcome;
use crate::thread::{ExitState, Thread, ThreadRef, ThreadState};
use crate::Kernel;
use core_types::{CapId, CpuId, ThreadId};
use kernel_api::{KernelConfig, KernelError, KernelResult, SchedPolicyKind, ThreadType};
use log::trace;
use serde::{Deserialize, Serialize};

/// Why the scheduler ran
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedTrigger {
    /// Periodic timer tick
    Tick,
    /// The thread gave up its budget
    Yield,
    /// The thread blocked or started waiting
    Block,
    /// The thread exited
    Exit,
    /// Administrative suspend
    Suspend,
    /// Direct IPC hand-off
    Handoff,
}

/// Scheduling event for the audit trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleEvent {
    /// Thread was switched in
    Selected {
        thread: ThreadId,
        cpu: CpuId,
        timestamp_ticks: u64,
    },
    /// Thread was switched out while still runnable
    Preempted {
        thread: ThreadId,
        cpu: CpuId,
        reason: SchedTrigger,
        timestamp_ticks: u64,
    },
    /// Thread was switched out because it blocked
    Blocked {
        thread: ThreadId,
        cpu: CpuId,
        timestamp_ticks: u64,
    },
    /// Thread was switched out for good
    Exited {
        thread: ThreadId,
        cpu: CpuId,
        timestamp_ticks: u64,
    },
}

/// Chronological record of context switches
#[derive(Debug, Default)]
pub struct ScheduleAuditLog {
    events: Vec<ScheduleEvent>,
}

impl ScheduleAuditLog {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn record(&mut self, event: ScheduleEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[ScheduleEvent] {
        &self.events
    }

    /// Threads selected on `cpu`, in order
    pub fn selected_on(&self, cpu: CpuId) -> Vec<ThreadId> {
        self.events
            .iter()
            .filter_map(|e| match e {
                ScheduleEvent::Selected {
                    thread, cpu: on, ..
                } if *on == cpu => Some(*thread),
                _ => None,
            })
            .collect()
    }

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

/// Ready-queue strategy
///
/// Implementations own the per-CPU ready queues. `sched` returns the thread
/// that should run on `cpu` next (possibly `current` again) and is
/// responsible for re-queueing `current` if it stays runnable; `None`
/// means the CPU idles.
pub trait SchedPolicy: Send + Sync {
    fn kind(&self) -> SchedPolicyKind;

    /// Queues `thread` on its affinity CPU, or near `local` without one
    ///
    /// Fails with `InvalidArgument` if the thread is already queued or has
    /// no scheduling context. Queueing the idle thread is a no-op.
    fn enqueue(&self, thread: &ThreadRef, local: CpuId) -> KernelResult<()>;

    /// Removes a queued thread; it is left in `Init` until queued again
    fn dequeue(&self, thread: &ThreadRef) -> KernelResult<()>;

    fn sched(&self, cpu: CpuId, current: Option<&ThreadRef>) -> Option<ThreadRef>;

    /// Called on every tick after the current budget was charged
    fn sched_periodic(&self, cpu: CpuId, current: Option<&ThreadRef>) -> Option<ThreadRef> {
        self.sched(cpu, current)
    }

    /// Thread `sched` would pick next on `cpu`, ignoring the current one
    fn top(&self, cpu: CpuId) -> Option<ThreadRef>;

    /// Number of queued threads on `cpu`
    fn queue_len(&self, cpu: CpuId) -> usize;
}

/// Builds the policy named in the configuration
pub fn create_policy(config: &KernelConfig) -> Box<dyn SchedPolicy> {
    match config.sched_policy {
        SchedPolicyKind::RoundRobin => {
            Box::new(RoundRobinPolicy::new(config.cpu_count, config.default_budget))
        }
        SchedPolicyKind::PriorityRoundRobin => Box::new(PriorityPolicy::new(
            config.cpu_count,
            config.default_budget,
            false,
        )),
        SchedPolicyKind::PriorityFifo => Box::new(PriorityPolicy::new(
            config.cpu_count,
            config.default_budget,
            true,
        )),
    }
}

/// Finishes a requested exit; true if the thread must not run again
pub(crate) fn retire_if_exiting(thread: &Thread) -> bool {
    match thread.exit_state() {
        ExitState::Running => false,
        ExitState::Exiting => {
            thread.set_exit_state(ExitState::Exited);
            true
        }
        ExitState::Exited => true,
    }
}

pub(crate) fn affinity_allows(thread: &Thread, cpu: CpuId) -> bool {
    thread.affinity().map_or(true, |aff| aff == cpu)
}

/// Whether the running `thread` may continue on `cpu`
pub(crate) fn can_keep_running(thread: &Thread, cpu: CpuId) -> bool {
    thread.state() == ThreadState::Running
        && !thread.is_suspended()
        && !thread.is_exiting()
        && affinity_allows(thread, cpu)
}

/// Whether a switched-out `thread` goes back to a ready queue
pub(crate) fn needs_requeue(thread: &Thread) -> bool {
    thread.state() == ThreadState::Running
        && !thread.is_exiting()
        && thread.thread_type() != ThreadType::Idle
}

impl Kernel {
    /// Scheduling audit trail
    pub fn schedule_audit(&self) -> spin::MutexGuard<'_, ScheduleAuditLog> {
        self.schedule_audit.lock()
    }

    pub fn sched_policy(&self) -> &dyn SchedPolicy {
        self.policy.as_ref()
    }

    /// Asks the policy for the next thread on `cpu` and switches to it
    ///
    /// `cpu` must be valid. Returns the thread now running (idle included).
    pub(crate) fn reschedule(&self, cpu: CpuId, trigger: SchedTrigger) -> ThreadRef {
        let current = self.cpus[cpu].current();
        if let Some(thread) = &current {
            retire_if_exiting(thread);
        }
        let next = self.policy.sched(cpu, current.as_ref());
        self.switch_to(cpu, current, next, trigger)
    }

    /// Reschedules after a syscall that may have blocked the caller
    ///
    /// The caller's return value must already be in its return register.
    pub(crate) fn switch_outcome(&self, cpu: CpuId, trigger: SchedTrigger) -> SyscallOutcome {
        let caller = self.current_thread(cpu).ok();
        let next = self.reschedule(cpu, trigger);
        match caller {
            Some(caller) if caller.ptr_eq(&next) => SyscallOutcome::Return(caller.ret()),
            _ => SyscallOutcome::Switch(next.id()),
        }
    }

    pub(crate) fn switch_to(
        &self,
        cpu: CpuId,
        prev: Option<ThreadRef>,
        next: Option<ThreadRef>,
        trigger: SchedTrigger,
    ) -> ThreadRef {
        let state = &self.cpus[cpu];
        let next_thread = next.clone().unwrap_or_else(|| state.idle().clone());
        let prev_thread = prev.unwrap_or_else(|| state.idle().clone());
        if prev_thread.ptr_eq(&next_thread) {
            return next_thread;
        }

        let now = self.clock.now();
        let event = if prev_thread.exit_state() == ExitState::Exited {
            ScheduleEvent::Exited {
                thread: prev_thread.id(),
                cpu,
                timestamp_ticks: now,
            }
        } else {
            match prev_thread.state() {
                ThreadState::Blocking | ThreadState::Waiting => ScheduleEvent::Blocked {
                    thread: prev_thread.id(),
                    cpu,
                    timestamp_ticks: now,
                },
                _ => ScheduleEvent::Preempted {
                    thread: prev_thread.id(),
                    cpu,
                    reason: trigger,
                    timestamp_ticks: now,
                },
            }
        };
        if prev_thread.thread_type() == ThreadType::Idle && prev_thread.state() == ThreadState::Running {
            prev_thread.set_state(ThreadState::Ready);
        }

        next_thread.set_state(ThreadState::Running);
        next_thread.set_cpu(cpu);
        next_thread.set_prev_thread(Some(prev_thread.id()));
        state.set_current(next);
        trace!(
            "{}: switch {} -> {} ({:?})",
            cpu,
            prev_thread.id(),
            next_thread.id(),
            trigger
        );

        let mut audit = self.schedule_audit.lock();
        if prev_thread.thread_type() != ThreadType::Idle {
            audit.record(event);
        }
        audit.record(ScheduleEvent::Selected {
            thread: next_thread.id(),
            cpu,
            timestamp_ticks: now,
        });
        next_thread
    }

    /// Switches `cpu` straight to `thread`, bypassing the ready queues
    ///
    /// The caller has already moved the current thread to its new state.
    pub(crate) fn handoff_to(&self, cpu: CpuId, thread: &ThreadRef) -> SyscallOutcome {
        let current = self.cpus[cpu].current();
        let next = self.switch_to(cpu, current, Some(thread.clone()), SchedTrigger::Handoff);
        SyscallOutcome::Switch(next.id())
    }

    /// Makes a blocked thread runnable again
    pub(crate) fn wake_thread(&self, thread: &ThreadRef, local: CpuId) {
        if let Err(err) = self.policy.enqueue(thread, local) {
            panic!("BUG: cannot wake {}: {}", thread.id(), err);
        }
    }

    /// Makes `thread` current on `cpu` immediately
    ///
    /// Host-side hook for driving user code: the thread must not be
    /// running elsewhere, blocked or exiting. The previous thread goes back
    /// to its ready queue.
    pub fn run_thread(&self, cpu: CpuId, thread: &ThreadRef) -> KernelResult<()> {
        let state = self.cpus.get(cpu)?;
        let current = state.current();
        if current.as_ref().is_some_and(|c| c.ptr_eq(thread)) {
            return Ok(());
        }
        if thread.is_exiting() || !affinity_allows(thread, cpu) {
            return Err(KernelError::InvalidArgument);
        }
        match thread.state() {
            ThreadState::Ready => self.policy.dequeue(thread)?,
            ThreadState::Init => {}
            _ => return Err(KernelError::InvalidArgument),
        }
        if let Some(prev) = &current {
            if needs_requeue(prev) {
                self.wake_thread(prev, cpu);
            }
        }
        self.switch_to(cpu, current, Some(thread.clone()), SchedTrigger::Handoff);
        Ok(())
    }

    /// One timer interrupt on `cpu`
    ///
    /// Wakes due sleepers, charges the running thread one tick of budget
    /// and lets the policy decide whether to switch.
    pub fn tick(&self, cpu: CpuId) -> KernelResult<ThreadRef> {
        let state = self.cpus.get(cpu)?;
        self.handle_timer_irq(cpu)?;
        let current = state.current();
        if let Some(thread) = &current {
            if self.policy.kind() != SchedPolicyKind::PriorityFifo {
                if let Some(sc) = thread.sched_context() {
                    sc.consume_tick();
                }
            }
            retire_if_exiting(thread);
        }
        let next = self.policy.sched_periodic(cpu, current.as_ref());
        Ok(self.switch_to(cpu, current, next, SchedTrigger::Tick))
    }

    /// Advances the clock by `ticks`, delivering one tick to every CPU each
    pub fn advance_ticks(&self, ticks: u64) {
        for _ in 0..ticks {
            self.clock.advance(1);
            for (cpu, _) in self.cpus.iter() {
                if let Err(err) = self.tick(cpu) {
                    panic!("BUG: tick on {} failed: {}", cpu, err);
                }
            }
        }
    }

    fn thread_from_cap(&self, cpu: CpuId, cap: CapId) -> KernelResult<ThreadRef> {
        if cap == CapId::new(0) {
            return self.current_thread(cpu);
        }
        let group = self.current_cap_group(cpu)?;
        let thread = self.obj_get::<Thread>(&group, cap)?;
        Ok(thread.handle().clone())
    }

    /// Gives up the rest of the current budget
    pub fn sys_yield(&self, cpu: CpuId) -> KernelResult<SyscallOutcome> {
        let thread = self.current_thread(cpu)?;
        if let Some(sc) = thread.sched_context() {
            sc.set_budget(0);
        }
        thread.set_ret(0);
        Ok(self.switch_outcome(cpu, SchedTrigger::Yield))
    }

    /// Pins a thread to a CPU; `-1` removes the pin
    ///
    /// Cap 0 names the caller. Takes effect the next time the thread is
    /// queued.
    pub fn sys_set_affinity(&self, cpu: CpuId, thread_cap: CapId, affinity: i64) -> KernelResult<()> {
        let affinity = match affinity {
            -1 => None,
            aff if aff >= 0 && (aff as usize) < self.cpu_count() => Some(CpuId(aff as usize)),
            _ => return Err(KernelError::InvalidArgument),
        };
        let thread = self.thread_from_cap(cpu, thread_cap)?;
        thread.set_affinity(affinity);
        Ok(())
    }

    pub fn sys_get_affinity(&self, cpu: CpuId, thread_cap: CapId) -> KernelResult<i64> {
        let thread = self.thread_from_cap(cpu, thread_cap)?;
        Ok(thread.affinity().map_or(-1, |aff| aff.index() as i64))
    }

    /// Changes a thread's priority, re-queueing it if it is ready
    pub fn sys_set_prio(&self, cpu: CpuId, thread_cap: CapId, prio: u32) -> KernelResult<()> {
        if prio == 0 || prio > KernelConfig::MAX_PRIO {
            return Err(KernelError::InvalidArgument);
        }
        let thread = self.thread_from_cap(cpu, thread_cap)?;
        let sc = thread.sched_context().ok_or(KernelError::InvalidArgument)?;
        if thread.state() == ThreadState::Ready {
            self.policy.dequeue(&thread)?;
            sc.set_prio(prio);
            self.policy.enqueue(&thread, cpu)?;
        } else {
            sc.set_prio(prio);
        }
        Ok(())
    }

    pub fn sys_get_prio(&self, cpu: CpuId, thread_cap: CapId) -> KernelResult<u32> {
        let thread = self.thread_from_cap(cpu, thread_cap)?;
        thread.prio().ok_or(KernelError::InvalidArgument)
    }

    /// Marks a thread non-runnable until resumed
    pub fn sys_suspend(&self, cpu: CpuId, thread_cap: CapId) -> KernelResult<SyscallOutcome> {
        let thread = self.thread_from_cap(cpu, thread_cap)?;
        thread.set_suspended(true);
        let current = self.current_thread(cpu)?;
        if thread.ptr_eq(&current) {
            thread.set_ret(0);
            return Ok(self.switch_outcome(cpu, SchedTrigger::Suspend));
        }
        Ok(SyscallOutcome::Return(0))
    }

    pub fn sys_resume(&self, cpu: CpuId, thread_cap: CapId) -> KernelResult<()> {
        let thread = self.thread_from_cap(cpu, thread_cap)?;
        thread.set_suspended(false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{boot_kernel, boot_with, spawn_thread, ROOT_CPU};

    fn fifo_config() -> KernelConfig {
        KernelConfig::default()
            .single_cpu()
            .with_policy(SchedPolicyKind::PriorityFifo)
    }

    #[test]
    fn test_create_policy_matches_config() {
        for kind in [
            SchedPolicyKind::RoundRobin,
            SchedPolicyKind::PriorityRoundRobin,
            SchedPolicyKind::PriorityFifo,
        ] {
            let config = KernelConfig::default().with_policy(kind);
            assert_eq!(create_policy(&config).kind(), kind);
        }
    }

    #[test]
    fn test_higher_priority_preempts_on_tick() {
        let kernel = boot_kernel(1);
        let root = kernel.current_thread(ROOT_CPU).unwrap();
        let urgent = spawn_thread(&kernel, ROOT_CPU, 200);

        let running = kernel.tick(ROOT_CPU).unwrap();
        assert!(running.ptr_eq(&urgent));
        assert_eq!(root.state(), ThreadState::Ready);
    }

    #[test]
    fn test_equal_priority_rotates_fifo() {
        let kernel = boot_kernel(1);
        let prio = kernel.config().default_prio;
        let a = spawn_thread(&kernel, ROOT_CPU, prio);
        let b = spawn_thread(&kernel, ROOT_CPU, prio);
        kernel.schedule_audit().clear();

        // default budget is 2 ticks
        kernel.advance_ticks(6);
        let order = kernel.schedule_audit().selected_on(ROOT_CPU);
        let root = kernel.root_process().unwrap().thread;
        assert_eq!(order, vec![a.id(), b.id(), root.id()]);
    }

    #[test]
    fn test_yield_moves_to_tail() {
        let kernel = boot_kernel(1);
        let prio = kernel.config().default_prio;
        let other = spawn_thread(&kernel, ROOT_CPU, prio);
        let root = kernel.current_thread(ROOT_CPU).unwrap();

        let outcome = kernel.sys_yield(ROOT_CPU).unwrap();
        assert_eq!(outcome, SyscallOutcome::Switch(other.id()));
        assert_eq!(root.state(), ThreadState::Ready);
        assert_eq!(kernel.sched_policy().top(ROOT_CPU).map(|t| t.id()), Some(root.id()));
    }

    #[test]
    fn test_yield_alone_keeps_cpu() {
        let kernel = boot_kernel(1);
        let outcome = kernel.sys_yield(ROOT_CPU).unwrap();
        assert_eq!(outcome, SyscallOutcome::Return(0));
        let root = kernel.current_thread(ROOT_CPU).unwrap();
        assert_eq!(root.budget(), Some(kernel.config().default_budget));
    }

    #[test]
    fn test_fifo_ignores_budget() {
        let kernel = boot_with(fifo_config());
        let prio = kernel.config().default_prio;
        let _other = spawn_thread(&kernel, ROOT_CPU, prio);
        let root = kernel.current_thread(ROOT_CPU).unwrap();

        kernel.advance_ticks(10);
        assert!(kernel.current_thread(ROOT_CPU).unwrap().ptr_eq(&root));
    }

    #[test]
    fn test_preempted_thread_keeps_place_ahead() {
        let kernel = boot_kernel(1);
        let prio = kernel.config().default_prio;
        let peer = spawn_thread(&kernel, ROOT_CPU, prio);
        let root = kernel.current_thread(ROOT_CPU).unwrap();
        let urgent = spawn_thread(&kernel, ROOT_CPU, prio + 5);

        kernel.advance_ticks(1);
        assert!(kernel.current_thread(ROOT_CPU).unwrap().ptr_eq(&urgent));
        // root still had budget left, so it runs before its peer
        assert!(kernel.sched_policy().top(ROOT_CPU).unwrap().ptr_eq(&root));
        assert_eq!(peer.state(), ThreadState::Ready);
    }

    #[test]
    fn test_set_prio_requeues() {
        let kernel = boot_kernel(1);
        let low = spawn_thread(&kernel, ROOT_CPU, 3);
        let group = kernel.current_cap_group(ROOT_CPU).unwrap();
        let cap = crate::test_utils::cap_of(&group, low.object()).unwrap();

        kernel.sys_set_prio(ROOT_CPU, cap, 250).unwrap();
        assert_eq!(kernel.sys_get_prio(ROOT_CPU, cap), Ok(250));
        assert_eq!(low.state(), ThreadState::Ready);
        assert!(kernel.tick(ROOT_CPU).unwrap().ptr_eq(&low));

        assert_eq!(kernel.sys_set_prio(ROOT_CPU, cap, 0), Err(KernelError::InvalidArgument));
        assert_eq!(kernel.sys_set_prio(ROOT_CPU, cap, 256), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn test_affinity_validation() {
        let kernel = boot_kernel(2);
        assert_eq!(kernel.sys_get_affinity(ROOT_CPU, CapId::new(0)), Ok(-1));
        kernel.sys_set_affinity(ROOT_CPU, CapId::new(0), 1).unwrap();
        assert_eq!(kernel.sys_get_affinity(ROOT_CPU, CapId::new(0)), Ok(1));
        assert_eq!(
            kernel.sys_set_affinity(ROOT_CPU, CapId::new(0), 2),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            kernel.sys_set_affinity(ROOT_CPU, CapId::new(0), -2),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn test_affinity_migrates_on_next_schedule() {
        let kernel = boot_kernel(2);
        let root = kernel.current_thread(ROOT_CPU).unwrap();
        kernel.sys_set_affinity(ROOT_CPU, CapId::new(0), 1).unwrap();

        kernel.tick(ROOT_CPU).unwrap();
        assert_eq!(kernel.is_idle(ROOT_CPU), Ok(true));
        assert_eq!(root.state(), ThreadState::Ready);
        kernel.tick(CpuId(1)).unwrap();
        assert!(kernel.current_thread(CpuId(1)).unwrap().ptr_eq(&root));
    }

    #[test]
    fn test_suspend_and_resume() {
        let kernel = boot_kernel(1);
        let root = kernel.current_thread(ROOT_CPU).unwrap();
        let outcome = kernel.sys_suspend(ROOT_CPU, CapId::new(0)).unwrap();
        let idle = kernel.current_thread(ROOT_CPU).unwrap();
        assert_eq!(idle.thread_type(), ThreadType::Idle);
        assert_eq!(outcome, SyscallOutcome::Switch(idle.id()));

        kernel.advance_ticks(3);
        assert_eq!(kernel.is_idle(ROOT_CPU), Ok(true));

        root.set_suspended(false);
        kernel.advance_ticks(1);
        assert!(kernel.current_thread(ROOT_CPU).unwrap().ptr_eq(&root));
    }

    #[test]
    fn test_switch_events_recorded() {
        let kernel = boot_kernel(1);
        let root = kernel.current_thread(ROOT_CPU).unwrap();
        let urgent = spawn_thread(&kernel, ROOT_CPU, 99);
        kernel.schedule_audit().clear();
        kernel.tick(ROOT_CPU).unwrap();

        let audit = kernel.schedule_audit();
        assert!(matches!(
            audit.events()[0],
            ScheduleEvent::Preempted { thread, reason: SchedTrigger::Tick, .. } if thread == root.id()
        ));
        assert!(matches!(
            audit.events()[1],
            ScheduleEvent::Selected { thread, .. } if thread == urgent.id()
        ));
    }
}
