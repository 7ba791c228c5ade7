//! Per-CPU kernel state
//!
//! Everything that exists once per CPU lives in a [`PerCpu`] built at boot
//! and indexed by [`CpuId`].

use crate::thread::ThreadRef;
use crate::Kernel;
use core_types::CpuId;
use kernel_api::{KernelError, KernelResult};
use std::ops::Index;

/// One `T` per CPU
#[derive(Debug)]
pub struct PerCpu<T> {
    items: Vec<T>,
}

impl<T> PerCpu<T> {
    pub fn new(count: usize, mut init: impl FnMut(CpuId) -> T) -> Self {
        Self {
            items: (0..count).map(|i| init(CpuId(i))).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Checked access; `InvalidArgument` for an unknown CPU
    pub fn get(&self, cpu: CpuId) -> KernelResult<&T> {
        self.items.get(cpu.index()).ok_or(KernelError::InvalidArgument)
    }

    pub fn iter(&self) -> impl Iterator<Item = (CpuId, &T)> {
        self.items.iter().enumerate().map(|(i, item)| (CpuId(i), item))
    }
}

impl<T> Index<CpuId> for PerCpu<T> {
    type Output = T;

    fn index(&self, cpu: CpuId) -> &T {
        &self.items[cpu.index()]
    }
}

/// What a CPU is running
#[derive(Debug)]
pub struct CpuState {
    /// `None` while the CPU idles
    current: spin::Mutex<Option<ThreadRef>>,
    idle: ThreadRef,
}

impl CpuState {
    pub(crate) fn new(idle: ThreadRef) -> Self {
        Self {
            current: spin::Mutex::new(None),
            idle,
        }
    }

    pub fn current(&self) -> Option<ThreadRef> {
        self.current.lock().clone()
    }

    pub fn idle(&self) -> &ThreadRef {
        &self.idle
    }

    pub(crate) fn set_current(&self, thread: Option<ThreadRef>) {
        *self.current.lock() = thread;
    }
}

impl Kernel {
    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    /// Thread running on `cpu`, the idle thread if nothing else is
    pub fn current_thread(&self, cpu: CpuId) -> KernelResult<ThreadRef> {
        let state = self.cpus.get(cpu)?;
        Ok(state.current().unwrap_or_else(|| state.idle().clone()))
    }

    /// True if `cpu` is idling
    pub fn is_idle(&self, cpu: CpuId) -> KernelResult<bool> {
        Ok(self.cpus.get(cpu)?.current().is_none())
    }
}
