//! Timed wakeups
//!
//! Each CPU keeps a sleep list sorted by ascending wakeup tick. Sleeping
//! threads record which CPU's list they are on and which callback runs when
//! they expire.
//!
//! Lock order: a sleep list, then a sleeper's queue lock
//! ([`Thread::sleep`]). A thread putting itself to sleep takes its own
//! queue lock first; it is on no list yet, so the interrupt can never wait
//! on it. Every other path holding a queue lock only try-locks the list.
//!
//! A thread woken on one CPU can run on another and sleep again before the
//! first CPU has finished its callback. Both paths hold the thread's queue
//! lock while touching `cb`, so the second sleep never loses its callback.
//!
//! [`Thread::sleep`]: crate::thread::Thread

use crate::notification::Notification;
use crate::scheduler::SchedTrigger;
use crate::syscall_gate::SyscallOutcome;
use crate::thread::{ThreadRef, ThreadState};
use crate::Kernel;
use core_types::CpuId;
use hal::TimerDevice;
use kernel_api::{ClockId, KernelError, KernelResult, ThreadType, TimeSpec, TIMER_ABSTIME};
use log::trace;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// What happens when a sleeper expires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeupCallback {
    /// Plain sleep: make the thread runnable
    Sleep,
    /// Timed notification wait: give up waiting with `-ETIMEDOUT`
    NotificationTimeout,
}

/// Per-thread sleep bookkeeping, guarded by the thread's queue lock
#[derive(Debug, Default)]
pub struct SleepState {
    pub wakeup_tick: u64,
    pub sleep_cpu: Option<CpuId>,
    pub cb: Option<WakeupCallback>,
    /// Notification a timed wait is blocked on
    pub pending_notific: Option<Arc<Notification>>,
}

#[derive(Debug)]
struct SleepEntry {
    wakeup_tick: u64,
    thread: ThreadRef,
}

const NO_EXPIRE: u64 = u64::MAX;

/// One CPU's sleep list
#[derive(Debug)]
pub struct TimeState {
    sleep_list: spin::Mutex<Vec<SleepEntry>>,
    next_expire: AtomicU64,
}

impl TimeState {
    pub fn new() -> Self {
        Self {
            sleep_list: spin::Mutex::new(Vec::new()),
            next_expire: AtomicU64::new(NO_EXPIRE),
        }
    }

    /// Earliest pending wakeup tick
    pub fn next_expire(&self) -> Option<u64> {
        match self.next_expire.load(Ordering::Acquire) {
            NO_EXPIRE => None,
            tick => Some(tick),
        }
    }

    pub fn sleeper_count(&self) -> usize {
        self.sleep_list.lock().len()
    }
}

impl Default for TimeState {
    fn default() -> Self {
        Self::new()
    }
}

fn head_tick(list: &[SleepEntry]) -> Option<u64> {
    list.first().map(|entry| entry.wakeup_tick)
}

impl Kernel {
    pub fn time_state(&self, cpu: CpuId) -> KernelResult<&TimeState> {
        self.time_states.get(cpu)
    }

    /// Puts `thread` on `cpu`'s sleep list for `timeout_ticks`
    ///
    /// `sleep` is the thread's queue-locked sleep state. Reprograms the
    /// CPU's timer if the thread is now the earliest sleeper.
    pub(crate) fn enqueue_sleeper(
        &self,
        cpu: CpuId,
        thread: &ThreadRef,
        sleep: &mut SleepState,
        timeout_ticks: u64,
        cb: WakeupCallback,
    ) {
        let wakeup_tick = self.clock.now().saturating_add(timeout_ticks);
        sleep.wakeup_tick = wakeup_tick;
        sleep.sleep_cpu = Some(cpu);
        sleep.cb = Some(cb);

        let time_state = &self.time_states[cpu];
        let mut list = time_state.sleep_list.lock();
        let at = list.partition_point(|entry| entry.wakeup_tick <= wakeup_tick);
        list.insert(
            at,
            SleepEntry {
                wakeup_tick,
                thread: thread.clone(),
            },
        );
        if at == 0 {
            time_state.next_expire.store(wakeup_tick, Ordering::Release);
            self.timers[cpu].lock().program_deadline(wakeup_tick);
        }
        trace!("{}: {} sleeps until tick {} ({:?})", cpu, thread.id(), wakeup_tick, cb);
    }

    /// Removes a sleeper before it expires
    ///
    /// Called with the thread's queue lock held. Returns false if the sleep
    /// list is busy; the caller must retry.
    pub(crate) fn try_dequeue_sleeper(&self, thread: &ThreadRef, sleep: &mut SleepState) -> bool {
        let Some(cpu) = sleep.sleep_cpu else {
            return true;
        };
        let time_state = &self.time_states[cpu];
        let Some(mut list) = time_state.sleep_list.try_lock() else {
            return false;
        };
        if let Some(pos) = list.iter().position(|entry| entry.thread.ptr_eq(thread)) {
            list.remove(pos);
        }
        let next = head_tick(&list).unwrap_or(NO_EXPIRE);
        time_state.next_expire.store(next, Ordering::Release);
        sleep.cb = None;
        sleep.sleep_cpu = None;
        true
    }

    /// Wakes every due sleeper on `cpu`; returns how many callbacks ran
    ///
    /// A due sleeper whose queue lock is held elsewhere is waited for, not
    /// skipped.
    pub fn handle_timer_irq(&self, cpu: CpuId) -> KernelResult<usize> {
        let now = self.clock.now();
        let time_state = self.time_states.get(cpu)?;
        let timer = self.timers.get(cpu)?;
        let mut list = time_state.sleep_list.lock();
        let mut fired = 0;
        while list.first().is_some_and(|entry| entry.wakeup_tick <= now) {
            let thread = list.remove(0).thread;
            let mut sleep = thread.sleep.lock();
            sleep.sleep_cpu = None;
            match sleep.cb.take() {
                Some(WakeupCallback::Sleep) => {
                    trace!("{}: {} woke at tick {}", cpu, thread.id(), now);
                    self.wake_thread(&thread, cpu);
                }
                Some(WakeupCallback::NotificationTimeout) => {
                    let notifc = sleep.pending_notific.take();
                    self.notific_timer_cb(cpu, &thread, notifc);
                }
                None => panic!("BUG: sleeper {} has no callback", thread.id()),
            }
            fired += 1;
        }

        let next = head_tick(&list);
        time_state.next_expire.store(next.unwrap_or(NO_EXPIRE), Ordering::Release);
        let mut timer = timer.lock();
        match next {
            Some(tick) => timer.program_deadline(tick),
            None => timer.clear_deadline(),
        }
        Ok(fired)
    }

    /// Current time on either clock
    pub fn sys_clock_gettime(&self, cpu: CpuId, clock: ClockId) -> KernelResult<TimeSpec> {
        self.current_thread(cpu)?;
        trace!("clock_gettime({:?})", clock);
        Ok(TimeSpec::from_ticks(self.clock.now(), self.config.tick_ns))
    }

    /// Blocks the caller until `req` has passed
    ///
    /// With [`TIMER_ABSTIME`] in `flags`, `req` is a point in time; a point
    /// already passed returns at once.
    pub fn sys_clock_nanosleep(
        &self,
        cpu: CpuId,
        clock: ClockId,
        flags: u64,
        req: &TimeSpec,
    ) -> KernelResult<SyscallOutcome> {
        let thread = self.current_thread(cpu)?;
        if thread.thread_type() == ThreadType::Idle {
            return Err(KernelError::InvalidArgument);
        }
        let ticks = req
            .to_ticks(self.config.tick_ns)
            .ok_or(KernelError::InvalidArgument)?;
        let now = self.clock.now();
        let timeout = if flags & TIMER_ABSTIME != 0 {
            ticks.saturating_sub(now)
        } else {
            ticks
        };
        if timeout == 0 {
            return Ok(SyscallOutcome::Return(0));
        }
        trace!("clock_nanosleep({:?}) {} for {} ticks", clock, thread.id(), timeout);

        {
            let mut sleep = thread.sleep.lock();
            thread.set_state(ThreadState::Blocking);
            thread.set_ret(0);
            self.enqueue_sleeper(cpu, &thread, &mut sleep, timeout, WakeupCallback::Sleep);
        }
        Ok(self.switch_outcome(cpu, SchedTrigger::Block))
    }
}
