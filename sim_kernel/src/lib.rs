//! # Simulated Kernel
//!
//! The object, capability, IPC and scheduling core of a capability
//! microkernel, hosted in-process.
//!
//! ## Purpose
//!
//! The simulated kernel lets the kernel core be exercised without hardware:
//! - Runs under `cargo test`
//! - Deterministic (time advances only through [`Kernel::advance_ticks`])
//! - Inspectable (audit logs for capabilities, scheduling and syscalls)
//!
//! ## Model
//!
//! Every kernel entry names the CPU it happens on. A syscall runs on behalf
//! of the thread current on that CPU and ends in a [`SyscallOutcome`]:
//! either the caller keeps running with a return value, or the CPU has
//! switched to another thread. User memory is backed by PMOs mapped into
//! each cap group's [`vmspace::VmSpace`].
//!
//! Kernel state is shared and internally locked, so several host threads
//! may drive different CPUs of one [`Kernel`] at the same time.

pub mod cap_group;
pub mod capability;
pub mod capability_audit;
pub mod clock;
pub mod connection;
pub mod futex;
pub mod notification;
pub mod object;
pub mod per_cpu;
pub mod pmo;
pub mod scheduler;
pub mod slot_table;
pub mod syscall_gate;
pub mod test_utils;
pub mod thread;
pub mod timer;
pub mod vmspace;

pub use cap_group::{CapGroup, RootProcess};
pub use clock::{SimClock, SimTimerDevice};
pub use connection::{ConnState, Connection};
pub use notification::Notification;
pub use object::{Handle, KernelObject, Object, ObjectKind};
pub use pmo::Pmo;
pub use scheduler::{ScheduleEvent, SchedTrigger};
pub use syscall_gate::{SyscallEvent, SyscallOutcome};
pub use thread::{Thread, ThreadRef, ThreadState};

use capability_audit::CapabilityAuditLog;
use core_types::{CpuId, ObjectId};
use kernel_api::{ConfigError, KernelConfig, KernelError, ThreadType};
use log::info;
use per_cpu::{CpuState, PerCpu};
use scheduler::{create_policy, SchedPolicy, ScheduleAuditLog};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use syscall_gate::{SyscallAuditLog, SyscallTable};
use thiserror::Error;
use thread::ExecContext;
use timer::TimeState;

/// Name of the cap group created at boot
pub const ROOT_CAP_GROUP_NAME: &str = "root";

/// Why the kernel failed to come up
#[derive(Debug, Error)]
pub enum BootError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("cannot create root process: {0}")]
    Root(#[from] KernelError),
}

/// Simulated kernel state
pub struct Kernel {
    config: KernelConfig,
    next_object_id: AtomicU64,
    next_badge: AtomicU64,
    /// Serializes root process creation and holds the result
    big_kernel_lock: spin::Mutex<Option<RootProcess>>,
    policy: Box<dyn SchedPolicy>,
    cpus: PerCpu<CpuState>,
    time_states: PerCpu<TimeState>,
    timers: PerCpu<spin::Mutex<SimTimerDevice>>,
    clock: Arc<SimClock>,
    syscalls: SyscallTable,
    capability_audit: spin::Mutex<CapabilityAuditLog>,
    schedule_audit: spin::Mutex<ScheduleAuditLog>,
    syscall_audit: spin::Mutex<SyscallAuditLog>,
}

/// Builds the idle thread of one CPU; idle threads belong to no cap group
fn idle_thread(cpu: CpuId, next_object_id: &AtomicU64) -> ThreadRef {
    let id = ObjectId::from_raw(next_object_id.fetch_add(1, Ordering::Relaxed));
    let object = Arc::new(Object::new(
        id,
        ObjectKind::Thread(Thread::new(
            ThreadType::Idle,
            Weak::new(),
            ExecContext::default(),
            None,
        )),
    ));
    match ThreadRef::new(object) {
        Some(thread) => {
            thread.set_state(ThreadState::Running);
            thread.set_cpu(cpu);
            thread
        }
        None => panic!("BUG: idle object {} is not a thread", id),
    }
}

impl Kernel {
    /// Boots a kernel: idle threads on every CPU, then the root cap group
    /// with its root thread running on CPU 0
    pub fn new(config: KernelConfig) -> Result<Self, BootError> {
        config.validate()?;

        let next_object_id = AtomicU64::new(1);
        let cpus = PerCpu::new(config.cpu_count, |cpu| CpuState::new(idle_thread(cpu, &next_object_id)));
        let clock = Arc::new(SimClock::new());
        let kernel = Self {
            policy: create_policy(&config),
            time_states: PerCpu::new(config.cpu_count, |_| TimeState::new()),
            timers: PerCpu::new(config.cpu_count, |_| {
                spin::Mutex::new(SimTimerDevice::new(Arc::clone(&clock)))
            }),
            cpus,
            clock,
            config,
            next_object_id,
            next_badge: AtomicU64::new(1),
            big_kernel_lock: spin::Mutex::new(None),
            syscalls: SyscallTable::new(),
            capability_audit: spin::Mutex::new(CapabilityAuditLog::new()),
            schedule_audit: spin::Mutex::new(ScheduleAuditLog::new()),
            syscall_audit: spin::Mutex::new(SyscallAuditLog::new()),
        };

        let root = kernel.create_root_cap_group(ROOT_CAP_GROUP_NAME)?;
        kernel.reschedule(CpuId(0), SchedTrigger::Tick);
        info!(
            "kernel up: {} cpus, {:?}, root thread {}",
            kernel.config.cpu_count,
            kernel.config.sched_policy,
            root.thread.id()
        );
        Ok(kernel)
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn clock(&self) -> &SimClock {
        &self.clock
    }

    /// Timer device of `cpu`
    pub fn timer(&self, cpu: CpuId) -> kernel_api::KernelResult<spin::MutexGuard<'_, SimTimerDevice>> {
        Ok(self.timers.get(cpu)?.lock())
    }

    /// Replaces the syscall table, e.g. to disable entries
    pub fn with_syscall_table(mut self, table: SyscallTable) -> Self {
        self.syscalls = table;
        self
    }
}
