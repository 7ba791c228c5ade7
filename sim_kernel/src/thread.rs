//! Threads
//!
//! A thread is an object like any other: it is created into a cap group,
//! named by capabilities and torn down when its last slot goes away. Its
//! user-level execution is simulated by [`ExecContext`], which holds just
//! enough registers for the kernel to set up entry points and deliver return
//! values.

use crate::cap_group::{CapGroup, ROOT_THREAD_OBJ_ID};
use crate::connection::IpcThreadConfig;
use crate::object::{Handle, Object, ObjectKind};
use crate::scheduler::SchedTrigger;
use crate::syscall_gate::SyscallOutcome;
use crate::timer::SleepState;
use crate::Kernel;
use core_types::{CapId, CapRights, CpuId, ObjectId};
use kernel_api::{KernelConfig, KernelError, KernelResult, ThreadArgs, ThreadType};
use log::{debug, trace};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

pub type ThreadRef = Handle<Thread>;

/// Scheduling state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ThreadState {
    Init = 0,
    Ready = 1,
    Running = 2,
    /// Blocked on a notification, a sleep or an IPC reply
    Blocking = 3,
    /// IPC handler or register callback waiting to be handed a CPU
    Waiting = 4,
}

impl ThreadState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ThreadState::Init,
            1 => ThreadState::Ready,
            2 => ThreadState::Running,
            3 => ThreadState::Blocking,
            _ => ThreadState::Waiting,
        }
    }
}

/// Exit progress, orthogonal to [`ThreadState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExitState {
    Running = 0,
    Exiting = 1,
    Exited = 2,
}

impl ExitState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ExitState::Running,
            1 => ExitState::Exiting,
            _ => ExitState::Exited,
        }
    }
}

/// Simulated user registers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecContext {
    pub pc: u64,
    pub sp: u64,
    pub tls: u64,
    pub args: [u64; 4],
    /// Return register
    pub ret: i64,
}

/// Priority and remaining budget
///
/// Shared through `Arc` so a client can donate it to a server thread for
/// the duration of an IPC call.
#[derive(Debug)]
pub struct SchedContext {
    prio: AtomicU32,
    budget: AtomicU32,
}

impl SchedContext {
    pub fn new(prio: u32, budget: u32) -> Self {
        Self {
            prio: AtomicU32::new(prio),
            budget: AtomicU32::new(budget),
        }
    }

    pub fn prio(&self) -> u32 {
        self.prio.load(Ordering::Acquire)
    }

    pub fn set_prio(&self, prio: u32) {
        self.prio.store(prio, Ordering::Release);
    }

    pub fn budget(&self) -> u32 {
        self.budget.load(Ordering::Acquire)
    }

    pub fn set_budget(&self, budget: u32) {
        self.budget.store(budget, Ordering::Release);
    }

    /// Charges one tick; returns the remaining budget
    pub fn consume_tick(&self) -> u32 {
        let prev = self
            .budget
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |b| Some(b.saturating_sub(1)))
            .unwrap_or(0);
        prev.saturating_sub(1)
    }
}

const NO_AFFINITY: i64 = -1;

/// Scheduler-visible part of a thread
pub struct ThreadCtx {
    regs: spin::Mutex<ExecContext>,
    sc: spin::Mutex<Option<Arc<SchedContext>>>,
    state: AtomicU8,
    exit_state: AtomicU8,
    suspended: AtomicBool,
    affinity: AtomicI64,
    cpu: AtomicUsize,
    prev_thread: spin::Mutex<Option<ObjectId>>,
}

pub struct Thread {
    thread_type: ThreadType,
    cap_group: Weak<Object>,
    ctx: ThreadCtx,
    /// The thread's queue lock
    pub(crate) sleep: spin::Mutex<SleepState>,
    pub(crate) ipc: IpcThreadConfig,
    clear_child_tid: AtomicU64,
}

impl Thread {
    pub(crate) fn new(
        thread_type: ThreadType,
        cap_group: Weak<Object>,
        regs: ExecContext,
        sc: Option<Arc<SchedContext>>,
    ) -> Self {
        Self {
            thread_type,
            cap_group,
            ctx: ThreadCtx {
                regs: spin::Mutex::new(regs),
                sc: spin::Mutex::new(sc),
                state: AtomicU8::new(ThreadState::Init as u8),
                exit_state: AtomicU8::new(ExitState::Running as u8),
                suspended: AtomicBool::new(false),
                affinity: AtomicI64::new(NO_AFFINITY),
                cpu: AtomicUsize::new(0),
                prev_thread: spin::Mutex::new(None),
            },
            sleep: spin::Mutex::new(SleepState::default()),
            ipc: IpcThreadConfig::new(),
            clear_child_tid: AtomicU64::new(0),
        }
    }

    pub fn thread_type(&self) -> ThreadType {
        self.thread_type
    }

    /// Owning cap group, if it still exists
    pub fn cap_group(&self) -> Option<Handle<CapGroup>> {
        self.cap_group.upgrade().and_then(Handle::new)
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.ctx.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.ctx.state.store(state as u8, Ordering::Release);
    }

    /// Moves to `Ready`; false if the thread already was
    pub(crate) fn try_mark_ready(&self) -> bool {
        self.ctx.state.swap(ThreadState::Ready as u8, Ordering::AcqRel) != ThreadState::Ready as u8
    }

    pub fn exit_state(&self) -> ExitState {
        ExitState::from_u8(self.ctx.exit_state.load(Ordering::Acquire))
    }

    pub(crate) fn set_exit_state(&self, state: ExitState) {
        self.ctx.exit_state.store(state as u8, Ordering::Release);
    }

    /// True once an exit has been requested
    pub fn is_exiting(&self) -> bool {
        self.exit_state() != ExitState::Running
    }

    pub fn is_suspended(&self) -> bool {
        self.ctx.suspended.load(Ordering::Acquire)
    }

    pub(crate) fn set_suspended(&self, suspended: bool) {
        self.ctx.suspended.store(suspended, Ordering::Release);
    }

    pub fn affinity(&self) -> Option<CpuId> {
        let raw = self.ctx.affinity.load(Ordering::Acquire);
        usize::try_from(raw).ok().map(CpuId)
    }

    pub(crate) fn set_affinity(&self, affinity: Option<CpuId>) {
        let raw = affinity.map_or(NO_AFFINITY, |cpu| cpu.index() as i64);
        self.ctx.affinity.store(raw, Ordering::Release);
    }

    /// CPU the thread last ran or was queued on
    pub fn cpu(&self) -> CpuId {
        CpuId(self.ctx.cpu.load(Ordering::Acquire))
    }

    pub(crate) fn set_cpu(&self, cpu: CpuId) {
        self.ctx.cpu.store(cpu.index(), Ordering::Release);
    }

    pub fn regs(&self) -> ExecContext {
        *self.ctx.regs.lock()
    }

    pub(crate) fn with_regs<R>(&self, f: impl FnOnce(&mut ExecContext) -> R) -> R {
        f(&mut self.ctx.regs.lock())
    }

    /// Value the thread sees in its return register
    pub fn ret(&self) -> i64 {
        self.ctx.regs.lock().ret
    }

    pub(crate) fn set_ret(&self, ret: i64) {
        self.ctx.regs.lock().ret = ret;
    }

    pub fn sched_context(&self) -> Option<Arc<SchedContext>> {
        self.ctx.sc.lock().clone()
    }

    pub(crate) fn set_sched_context(&self, sc: Option<Arc<SchedContext>>) {
        *self.ctx.sc.lock() = sc;
    }

    pub fn prio(&self) -> Option<u32> {
        self.ctx.sc.lock().as_ref().map(|sc| sc.prio())
    }

    pub fn budget(&self) -> Option<u32> {
        self.ctx.sc.lock().as_ref().map(|sc| sc.budget())
    }

    /// Thread that ran on this CPU before this one was switched in
    pub fn prev_thread(&self) -> Option<ObjectId> {
        *self.ctx.prev_thread.lock()
    }

    pub(crate) fn set_prev_thread(&self, prev: Option<ObjectId>) {
        *self.ctx.prev_thread.lock() = prev;
    }

    pub fn clear_child_tid(&self) -> u64 {
        self.clear_child_tid.load(Ordering::Acquire)
    }

    pub(crate) fn set_clear_child_tid(&self, addr: u64) {
        self.clear_child_tid.store(addr, Ordering::Release);
    }
}

fn valid_prio(prio: u32) -> bool {
    prio > 0 && prio <= KernelConfig::MAX_PRIO
}

impl Kernel {
    pub(crate) fn create_thread_object(
        &self,
        group: &Handle<CapGroup>,
        thread_type: ThreadType,
        regs: ExecContext,
        prio: u32,
    ) -> KernelResult<ThreadRef> {
        let sc = thread_type
            .has_sched_context()
            .then(|| Arc::new(SchedContext::new(prio, self.config.default_budget)));
        let object = self.obj_alloc(ObjectKind::Thread(Thread::new(
            thread_type,
            Arc::downgrade(group.object()),
            regs,
            sc,
        )));
        let thread = ThreadRef::new(object).ok_or(KernelError::InvalidArgument)?;
        group.add_thread(thread.clone());
        Ok(thread)
    }

    /// Creates the first thread of the root cap group and queues it on CPU 0
    pub(crate) fn create_root_thread(&self, group: &Handle<CapGroup>) -> KernelResult<ThreadRef> {
        let thread = self.create_thread_object(
            group,
            ThreadType::Root,
            ExecContext::default(),
            self.config.default_prio,
        )?;
        let cap = self.cap_alloc(group, thread.object())?;
        if cap != ROOT_THREAD_OBJ_ID {
            panic!("BUG: root thread got slot {}", cap);
        }
        self.wake_thread(&thread, CpuId(0));
        Ok(thread)
    }

    /// Creates a thread in the cap group named by `args.cap_group_cap`
    ///
    /// User threads are queued immediately; shadow and register threads
    /// wait for IPC. Returns the caller's cap to the thread.
    pub fn sys_create_thread(&self, cpu: CpuId, args: &ThreadArgs) -> KernelResult<CapId> {
        let current_group = self.current_cap_group(cpu)?;
        let group_cap =
            CapId::from_raw(args.cap_group_cap as i64).ok_or(KernelError::InvalidCapability)?;
        let group = self.obj_get::<CapGroup>(&current_group, group_cap)?;

        let thread_type = ThreadType::from_raw(args.thread_type).ok_or(KernelError::InvalidArgument)?;
        match thread_type {
            ThreadType::User if !valid_prio(args.prio) => return Err(KernelError::InvalidArgument),
            ThreadType::User | ThreadType::Shadow | ThreadType::Register => {}
            ThreadType::Idle | ThreadType::Root => return Err(KernelError::InvalidArgument),
        }

        let regs = ExecContext {
            pc: args.pc,
            sp: args.stack,
            tls: args.tls,
            args: [args.arg, 0, 0, 0],
            ret: 0,
        };
        let thread = self.create_thread_object(group.handle(), thread_type, regs, args.prio)?;
        thread.set_clear_child_tid(args.clear_child_tid);

        let cap = match self.cap_alloc(group.handle(), thread.object()) {
            Ok(cap) => cap,
            Err(err) => {
                group.remove_thread(&thread);
                return Err(err);
            }
        };
        let cap = if group.ptr_eq(&current_group) {
            cap
        } else {
            match self.cap_copy(group.handle(), &current_group, cap, CapRights::NONE, CapRights::NONE) {
                Ok(copy) => copy,
                Err(err) => {
                    self.cap_free(group.handle(), cap)?;
                    return Err(err);
                }
            }
        };

        match thread_type {
            ThreadType::User => self.wake_thread(&thread, cpu),
            _ => thread.set_state(ThreadState::Waiting),
        }
        debug!(
            "create_thread: {} {:?} in {} as {}",
            thread.id(),
            thread_type,
            group.badge(),
            cap
        );
        Ok(cap)
    }

    /// Ends the calling thread
    pub fn sys_thread_exit(&self, cpu: CpuId) -> KernelResult<SyscallOutcome> {
        let thread = self.current_thread(cpu)?;
        if thread.thread_type() == ThreadType::Idle {
            return Err(KernelError::InvalidArgument);
        }
        thread.set_exit_state(ExitState::Exiting);
        self.clear_child_tid(cpu, &thread);
        trace!("thread_exit: {}", thread.id());
        Ok(self.switch_outcome(cpu, SchedTrigger::Exit))
    }

    /// Zeroes the exiting thread's tid word and wakes one futex waiter on it
    fn clear_child_tid(&self, cpu: CpuId, thread: &ThreadRef) {
        let addr = thread.clear_child_tid();
        if addr == 0 {
            return;
        }
        let Some(group) = thread.cap_group() else {
            return;
        };
        if group.vmspace().write_u32(addr, 0).is_ok() {
            let woken = self.futex_wake(cpu, &group, addr, 1);
            trace!("clear_child_tid {:#x}: woke {:?}", addr, woken);
        }
    }

    /// Records where `clear_child_tid` points; returns the caller's id
    pub fn sys_set_tid_address(&self, cpu: CpuId, addr: u64) -> KernelResult<u64> {
        let thread = self.current_thread(cpu)?;
        thread.set_clear_child_tid(addr);
        Ok(thread.id().as_raw())
    }

    /// Ends every thread of the caller's cap group
    pub fn sys_exit_group(&self, cpu: CpuId, code: i64) -> KernelResult<SyscallOutcome> {
        let group = self.current_cap_group(cpu)?;
        debug!("exit_group: {} code {}", group.badge(), code);
        self.exit_cap_group(&group);
        Ok(self.switch_outcome(cpu, SchedTrigger::Exit))
    }

    /// Ends every thread of the cap group named by `group_cap`
    pub fn sys_kill_group(&self, cpu: CpuId, group_cap: CapId) -> KernelResult<SyscallOutcome> {
        let current = self.current_cap_group(cpu)?;
        let target = self.obj_get::<CapGroup>(&current, group_cap)?;
        debug!("kill_group: {} by {}", target.badge(), current.badge());
        self.exit_cap_group(target.handle());
        if target.ptr_eq(&current) {
            return Ok(self.switch_outcome(cpu, SchedTrigger::Exit));
        }
        Ok(SyscallOutcome::Return(0))
    }

    fn exit_cap_group(&self, group: &Handle<CapGroup>) {
        for thread in group.threads() {
            if thread.is_exiting() {
                continue;
            }
            match thread.state() {
                ThreadState::Running | ThreadState::Ready => {
                    thread.set_exit_state(ExitState::Exiting)
                }
                _ => thread.set_exit_state(ExitState::Exited),
            }
        }
        self.stop_group_connections(group);
    }

    pub(crate) fn thread_deinit(&self, object: &Arc<Object>, thread: &Thread) {
        thread.set_exit_state(ExitState::Exited);
        thread.set_sched_context(None);
        thread.ipc.clear();
        if let (Some(group), Some(handle)) = (thread.cap_group(), ThreadRef::new(Arc::clone(object))) {
            group.remove_thread(&handle);
        }
    }
}
