//! Process-private futexes
//!
//! Each cap group keeps a table from user address to a notification plus
//! the number of threads waiting there. Entries exist only while they have
//! waiters. The table lock is held across the whole wait, so a wake can
//! never slip in between the value check and the block.

use crate::cap_group::CapGroup;
use crate::notification::Notification;
use crate::object::Handle;
use crate::syscall_gate::SyscallOutcome;
use crate::Kernel;
use core_types::CpuId;
use kernel_api::futex_op::{FUTEX_CMD_MASK, FUTEX_PRIVATE, FUTEX_REQUEUE, FUTEX_WAIT, FUTEX_WAKE};
use kernel_api::{KernelError, KernelResult};
use log::trace;
use std::sync::Arc;

#[derive(Debug)]
struct FutexEntry {
    uaddr: u64,
    notifc: Arc<Notification>,
    waiters: usize,
}

#[derive(Debug, Default)]
pub struct FutexTable {
    entries: spin::Mutex<Vec<FutexEntry>>,
}

fn find(entries: &[FutexEntry], uaddr: u64) -> Option<usize> {
    entries
        .iter()
        .position(|entry| entry.uaddr == uaddr && entry.waiters > 0)
}

fn find_or_insert(entries: &mut Vec<FutexEntry>, uaddr: u64) -> usize {
    find(entries, uaddr).unwrap_or_else(|| {
        entries.push(FutexEntry {
            uaddr,
            notifc: Arc::new(Notification::new()),
            waiters: 0,
        });
        entries.len() - 1
    })
}

/// Drops the entry at `index` if nobody waits on it any more
fn release_if_idle(entries: &mut Vec<FutexEntry>, index: usize) {
    if entries[index].waiters == 0 {
        let entry = entries.swap_remove(index);
        entry.notifc.deinit();
    }
}

impl FutexTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Threads waiting on `uaddr`
    pub fn waiter_count(&self, uaddr: u64) -> usize {
        let entries = self.entries.lock();
        find(&entries, uaddr).map_or(0, |i| entries[i].waiters)
    }

    pub(crate) fn clear(&self) {
        for entry in self.entries.lock().drain(..) {
            entry.notifc.deinit();
        }
    }
}

impl Kernel {
    /// Blocks the caller while the word at `uaddr` equals `val`
    pub(crate) fn futex_wait(
        &self,
        cpu: CpuId,
        group: &Handle<CapGroup>,
        uaddr: u64,
        val: u32,
    ) -> KernelResult<SyscallOutcome> {
        let mut entries = group.futexes.entries.lock();
        if group.vmspace().read_u32(uaddr)? != val {
            return Err(KernelError::TryAgain);
        }
        let index = find_or_insert(&mut entries, uaddr);
        entries[index].waiters += 1;
        let notifc = Arc::clone(&entries[index].notifc);

        let result = self.wait_notific(cpu, &notifc, true, None);
        if !matches!(result, Ok(SyscallOutcome::Switch(_))) {
            entries[index].waiters -= 1;
            release_if_idle(&mut entries, index);
        }
        trace!("futex_wait {:#x}: {:?}", uaddr, result);
        result
    }

    /// Wakes up to `count` waiters on `uaddr`; returns how many woke
    pub(crate) fn futex_wake(
        &self,
        cpu: CpuId,
        group: &Handle<CapGroup>,
        uaddr: u64,
        count: usize,
    ) -> KernelResult<usize> {
        let mut entries = group.futexes.entries.lock();
        let Some(index) = find(&entries, uaddr) else {
            return Ok(0);
        };
        let wanted = entries[index].waiters.min(count);
        let mut woken = 0;
        while woken < wanted {
            match self.signal_notific(cpu, &entries[index].notifc) {
                Ok(()) => {
                    entries[index].waiters -= 1;
                    woken += 1;
                }
                Err(KernelError::TryAgain) => std::hint::spin_loop(),
                Err(_) => break,
            }
        }
        release_if_idle(&mut entries, index);
        Ok(woken)
    }

    /// Moves one waiter from `uaddr` to `uaddr2`
    ///
    /// Only `nr_wake == 0, nr_requeue == 1` is supported.
    pub(crate) fn futex_requeue(
        &self,
        group: &Handle<CapGroup>,
        uaddr: u64,
        uaddr2: u64,
        nr_wake: u64,
        nr_requeue: u64,
    ) -> KernelResult<usize> {
        if nr_wake != 0 || nr_requeue != 1 {
            return Err(KernelError::NotSupported);
        }
        if uaddr == uaddr2 {
            return Err(KernelError::InvalidArgument);
        }
        let mut entries = group.futexes.entries.lock();
        let src = find(&entries, uaddr).ok_or(KernelError::InvalidArgument)?;
        let dst = find_or_insert(&mut entries, uaddr2);
        let src_notifc = Arc::clone(&entries[src].notifc);
        let dst_notifc = Arc::clone(&entries[dst].notifc);

        match self.requeue_notific(&src_notifc, &dst_notifc) {
            Ok(true) => {
                entries[dst].waiters += 1;
                entries[src].waiters -= 1;
                release_if_idle(&mut entries, src);
                Ok(1)
            }
            Ok(false) => {
                release_if_idle(&mut entries, dst);
                Ok(0)
            }
            Err(err) => {
                release_if_idle(&mut entries, dst);
                Err(err)
            }
        }
    }

    /// Futex syscall
    ///
    /// `val2` is the requeue count for `FUTEX_REQUEUE`. Shared futexes are
    /// not supported.
    pub fn sys_futex(
        &self,
        cpu: CpuId,
        uaddr: u64,
        op: u64,
        val: u32,
        val2: u64,
        uaddr2: u64,
    ) -> KernelResult<SyscallOutcome> {
        if op & FUTEX_PRIVATE == 0 {
            return Err(KernelError::NotSupported);
        }
        let group = self.current_cap_group(cpu)?;
        match op & FUTEX_CMD_MASK {
            FUTEX_WAIT => self.futex_wait(cpu, &group, uaddr, val),
            FUTEX_WAKE => {
                let woken = self.futex_wake(cpu, &group, uaddr, val as usize)?;
                Ok(SyscallOutcome::Return(woken as i64))
            }
            FUTEX_REQUEUE => {
                let moved = self.futex_requeue(&group, uaddr, uaddr2, u64::from(val), val2)?;
                Ok(SyscallOutcome::Return(moved as i64))
            }
            _ => Err(KernelError::NotSupported),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{boot_kernel, map_scratch, spawn_thread, ROOT_CPU};
    use crate::thread::ThreadState;

    const WAIT: u64 = FUTEX_WAIT | FUTEX_PRIVATE;
    const WAKE: u64 = FUTEX_WAKE | FUTEX_PRIVATE;
    const REQUEUE: u64 = FUTEX_REQUEUE | FUTEX_PRIVATE;

    #[test]
    fn test_shared_futex_unsupported() {
        let kernel = boot_kernel(1);
        assert_eq!(
            kernel.sys_futex(ROOT_CPU, 0x1000, FUTEX_WAKE, 1, 0, 0),
            Err(KernelError::NotSupported)
        );
        assert_eq!(
            kernel.sys_futex(ROOT_CPU, 0x1000, 9 | FUTEX_PRIVATE, 1, 0, 0),
            Err(KernelError::NotSupported)
        );
    }

    #[test]
    fn test_wait_value_mismatch_and_fault() {
        let kernel = boot_kernel(1);
        let base = map_scratch(&kernel, ROOT_CPU, 4096);
        let group = kernel.current_cap_group(ROOT_CPU).unwrap();
        group.vmspace().write_u32(base, 7).unwrap();

        assert_eq!(kernel.sys_futex(ROOT_CPU, base, WAIT, 3, 0, 0), Err(KernelError::TryAgain));
        assert_eq!(
            kernel.sys_futex(ROOT_CPU, 0xdead_0000, WAIT, 0, 0, 0),
            Err(KernelError::BadAddress)
        );
        assert_eq!(group.futexes.waiter_count(base), 0);
    }

    #[test]
    fn test_wait_then_wake() {
        let kernel = boot_kernel(1);
        let base = map_scratch(&kernel, ROOT_CPU, 4096);
        let root = kernel.current_thread(ROOT_CPU).unwrap();
        let _other = spawn_thread(&kernel, ROOT_CPU, 5);
        let group = kernel.current_cap_group(ROOT_CPU).unwrap();

        let outcome = kernel.sys_futex(ROOT_CPU, base, WAIT, 0, 0, 0).unwrap();
        assert!(matches!(outcome, SyscallOutcome::Switch(_)));
        assert_eq!(group.futexes.waiter_count(base), 1);

        let woke = kernel.sys_futex(ROOT_CPU, base, WAKE, 5, 0, 0).unwrap();
        assert_eq!(woke, SyscallOutcome::Return(1));
        assert_eq!(root.state(), ThreadState::Ready);
        assert_eq!(group.futexes.waiter_count(base), 0);
        assert_eq!(kernel.sys_futex(ROOT_CPU, base, WAKE, 5, 0, 0), Ok(SyscallOutcome::Return(0)));
    }

    #[test]
    fn test_requeue_single_waiter() {
        let kernel = boot_kernel(1);
        let base = map_scratch(&kernel, ROOT_CPU, 4096);
        let root = kernel.current_thread(ROOT_CPU).unwrap();
        let _other = spawn_thread(&kernel, ROOT_CPU, 5);
        let group = kernel.current_cap_group(ROOT_CPU).unwrap();
        kernel.sys_futex(ROOT_CPU, base, WAIT, 0, 0, 0).unwrap();

        assert_eq!(
            kernel.sys_futex(ROOT_CPU, base, REQUEUE, 1, 1, base + 4),
            Err(KernelError::NotSupported)
        );
        assert_eq!(
            kernel.sys_futex(ROOT_CPU, base, REQUEUE, 0, 1, base),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            kernel.sys_futex(ROOT_CPU, base, REQUEUE, 0, 1, base + 4),
            Ok(SyscallOutcome::Return(1))
        );
        assert_eq!(group.futexes.waiter_count(base), 0);
        assert_eq!(group.futexes.waiter_count(base + 4), 1);

        kernel.sys_futex(ROOT_CPU, base + 4, WAKE, 1, 0, 0).unwrap();
        assert_eq!(root.state(), ThreadState::Ready);
    }
}
