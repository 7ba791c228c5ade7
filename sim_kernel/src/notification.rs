//! Notifications
//!
//! A counting wait/signal primitive. Signals sent while nobody waits are
//! remembered and consumed by later waits.
//!
//! A timed waiter sits on two lists at once: the notification's waiters and
//! its CPU's sleep list. Whichever of signal and timeout gets the thread's
//! queue lock first removes it from the other list, so the thread is woken
//! at most once. The timeout path holds the sleep list and waits for the
//! queue lock. The signal path only *tries* both and reports `TryAgain` on
//! contention.

use crate::object::{Handle, ObjectKind};
use crate::scheduler::SchedTrigger;
use crate::syscall_gate::SyscallOutcome;
use crate::thread::{ExitState, ThreadRef, ThreadState};
use crate::timer::WakeupCallback;
use crate::Kernel;
use core_types::{CapId, CpuId};
use kernel_api::{KernelError, KernelResult, ThreadType, TimeSpec};
use log::{debug, trace};
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug)]
struct NotifcInner {
    not_delivered: u32,
    waiting: VecDeque<ThreadRef>,
    valid: bool,
}

#[derive(Debug)]
pub struct Notification {
    inner: spin::Mutex<NotifcInner>,
}

impl Notification {
    pub fn new() -> Self {
        Self {
            inner: spin::Mutex::new(NotifcInner {
                not_delivered: 0,
                waiting: VecDeque::new(),
                valid: true,
            }),
        }
    }

    /// Signals not yet consumed by a wait
    pub fn pending_signals(&self) -> u32 {
        self.inner.lock().not_delivered
    }

    pub fn waiter_count(&self) -> usize {
        self.inner.lock().waiting.len()
    }

    pub fn is_valid(&self) -> bool {
        self.inner.lock().valid
    }

    /// Invalidates the notification; threads still waiting never run again
    pub(crate) fn deinit(&self) {
        let mut inner = self.inner.lock();
        inner.valid = false;
        for thread in inner.waiting.drain(..) {
            thread.set_exit_state(ExitState::Exited);
        }
    }
}

impl Default for Notification {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared pointer behind a notification handle
pub(crate) fn notification_of(handle: &Handle<Notification>) -> KernelResult<Arc<Notification>> {
    match handle.object().kind() {
        ObjectKind::Notification(notifc) => Ok(Arc::clone(notifc)),
        _ => Err(KernelError::InvalidCapability),
    }
}

impl Kernel {
    /// Consumes a pending signal or blocks the current thread
    ///
    /// Without `is_block` an empty notification yields `TryAgain`. A timed
    /// wait returns `-ETIMEDOUT` in the thread's return register if no
    /// signal arrives within `timeout_ticks`.
    pub(crate) fn wait_notific(
        &self,
        cpu: CpuId,
        notifc: &Arc<Notification>,
        is_block: bool,
        timeout_ticks: Option<u64>,
    ) -> KernelResult<SyscallOutcome> {
        let mut inner = notifc.inner.lock();
        if !inner.valid {
            return Err(KernelError::InvalidCapability);
        }
        if inner.not_delivered > 0 {
            inner.not_delivered -= 1;
            return Ok(SyscallOutcome::Return(0));
        }
        if !is_block {
            return Err(KernelError::TryAgain);
        }

        let thread = self.current_thread(cpu)?;
        if thread.thread_type() == ThreadType::Idle {
            return Err(KernelError::InvalidArgument);
        }
        let mut sleep = thread.sleep.lock();
        inner.waiting.push_back(thread.clone());
        thread.set_state(ThreadState::Blocking);
        thread.set_ret(0);
        if let Some(ticks) = timeout_ticks {
            sleep.pending_notific = Some(Arc::clone(notifc));
            self.enqueue_sleeper(cpu, &thread, &mut sleep, ticks, WakeupCallback::NotificationTimeout);
        }
        trace!("{}: {} waits on notification", cpu, thread.id());

        // switch away before a signal can make the thread runnable again
        let outcome = self.switch_outcome(cpu, SchedTrigger::Block);
        drop(sleep);
        drop(inner);
        Ok(outcome)
    }

    /// Wakes the oldest waiter, or records the signal if there is none
    pub(crate) fn signal_notific(&self, cpu: CpuId, notifc: &Notification) -> KernelResult<()> {
        let mut inner = notifc.inner.lock();
        if !inner.valid {
            return Err(KernelError::InvalidCapability);
        }
        // waiters of a killed group never run again
        while inner.waiting.front().is_some_and(|t| t.is_exiting()) {
            if let Some(dead) = inner.waiting.pop_front() {
                trace!("{}: dropped exited waiter {}", cpu, dead.id());
            }
        }
        if inner.not_delivered > 0 || inner.waiting.is_empty() {
            inner.not_delivered += 1;
            return Ok(());
        }

        let Some(target) = inner.waiting.front().cloned() else {
            return Ok(());
        };
        // the timer may hold the queue lock and be waiting for ours
        let Some(mut sleep) = target.sleep.try_lock() else {
            return Err(KernelError::TryAgain);
        };
        if sleep.cb.is_some() && !self.try_dequeue_sleeper(&target, &mut sleep) {
            return Err(KernelError::TryAgain);
        }
        sleep.pending_notific = None;
        inner.waiting.pop_front();
        self.wake_thread(&target, cpu);
        trace!("{}: signal woke {}", cpu, target.id());
        Ok(())
    }

    /// Moves the oldest waiter of `src` to `dst`; true if one moved
    pub(crate) fn requeue_notific(&self, src: &Arc<Notification>, dst: &Arc<Notification>) -> KernelResult<bool> {
        if Arc::ptr_eq(src, dst) {
            return Ok(false);
        }
        let src_first = Arc::as_ptr(src) < Arc::as_ptr(dst);
        let (mut src_inner, mut dst_inner) = if src_first {
            let s = src.inner.lock();
            (s, dst.inner.lock())
        } else {
            let d = dst.inner.lock();
            (src.inner.lock(), d)
        };
        if !src_inner.valid || !dst_inner.valid {
            return Err(KernelError::InvalidCapability);
        }
        let Some(target) = src_inner.waiting.front().cloned() else {
            return Ok(false);
        };
        let Some(mut sleep) = target.sleep.try_lock() else {
            return Err(KernelError::TryAgain);
        };
        if dst_inner.not_delivered > 0 {
            panic!("BUG: requeue onto a notification with pending signals");
        }
        src_inner.waiting.pop_front();
        if sleep.cb.is_some() {
            sleep.pending_notific = Some(Arc::clone(dst));
        }
        dst_inner.waiting.push_back(target.clone());
        Ok(true)
    }

    /// Timeout of a timed wait; runs with the thread's queue lock held
    pub(crate) fn notific_timer_cb(&self, cpu: CpuId, thread: &ThreadRef, notifc: Option<Arc<Notification>>) {
        let Some(notifc) = notifc else {
            panic!("BUG: {} timed out without a notification", thread.id());
        };
        let mut inner = notifc.inner.lock();
        if !inner.valid {
            thread.set_exit_state(ExitState::Exited);
            return;
        }
        if thread.state() != ThreadState::Blocking {
            return;
        }
        if let Some(pos) = inner.waiting.iter().position(|t| t.ptr_eq(thread)) {
            inner.waiting.remove(pos);
        }
        if thread.is_exiting() {
            thread.set_exit_state(ExitState::Exited);
            return;
        }
        thread.set_ret(KernelError::TimedOut.errno());
        self.wake_thread(thread, cpu);
        trace!("{}: {} timed out waiting", cpu, thread.id());
    }

    pub fn sys_create_notifc(&self, cpu: CpuId) -> KernelResult<CapId> {
        let group = self.current_cap_group(cpu)?;
        let object = self.obj_alloc(ObjectKind::Notification(Arc::new(Notification::new())));
        match self.cap_alloc(&group, &object) {
            Ok(cap) => {
                debug!("create_notifc: {} in {} as {}", object.id(), group.badge(), cap);
                Ok(cap)
            }
            Err(err) => {
                self.obj_free(object);
                Err(err)
            }
        }
    }

    /// Waits on the notification behind `cap`
    ///
    /// `timeout` is relative; `None` waits forever.
    pub fn sys_wait(
        &self,
        cpu: CpuId,
        cap: CapId,
        is_block: bool,
        timeout: Option<&TimeSpec>,
    ) -> KernelResult<SyscallOutcome> {
        let group = self.current_cap_group(cpu)?;
        let notifc = {
            let held = self.obj_get::<Notification>(&group, cap)?;
            notification_of(held.handle())?
        };
        let timeout_ticks = match timeout {
            Some(ts) => Some(ts.to_ticks(self.config.tick_ns).ok_or(KernelError::InvalidArgument)?),
            None => None,
        };
        self.wait_notific(cpu, &notifc, is_block, timeout_ticks)
    }

    /// Signals the notification behind `cap`
    ///
    /// Lock contention with a concurrent timeout is retried here, so the
    /// caller never sees `TryAgain`.
    pub fn sys_notify(&self, cpu: CpuId, cap: CapId) -> KernelResult<()> {
        let group = self.current_cap_group(cpu)?;
        let notifc = self.obj_get::<Notification>(&group, cap)?;
        loop {
            match self.signal_notific(cpu, &notifc) {
                Err(KernelError::TryAgain) => std::hint::spin_loop(),
                result => return result,
            }
        }
    }
}
