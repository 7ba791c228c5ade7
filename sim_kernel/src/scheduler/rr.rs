//! Plain round-robin
//!
//! One FIFO queue per CPU, priorities ignored. A thread runs until its
//! budget is used up, then goes to the tail of its queue.

use super::{can_keep_running, needs_requeue, retire_if_exiting, SchedPolicy};
use crate::per_cpu::PerCpu;
use crate::thread::{ThreadRef, ThreadState};
use core_types::CpuId;
use kernel_api::{KernelError, KernelResult, SchedPolicyKind, ThreadType};
use log::trace;
use std::collections::VecDeque;

/// Queue length difference that makes an unpinned thread go elsewhere
const LOAD_BALANCE_THRESHOLD: usize = 5;

pub struct RoundRobinPolicy {
    default_budget: u32,
    queues: PerCpu<spin::Mutex<VecDeque<ThreadRef>>>,
}

impl RoundRobinPolicy {
    pub fn new(cpu_count: usize, default_budget: u32) -> Self {
        Self {
            default_budget,
            queues: PerCpu::new(cpu_count, |_| spin::Mutex::new(VecDeque::new())),
        }
    }

    /// `local`, unless another CPU is much less loaded
    fn choose_cpu(&self, local: CpuId) -> CpuId {
        let local_len = self.queue_len(local);
        let least = self
            .queues
            .iter()
            .map(|(cpu, q)| (cpu, q.lock().len()))
            .min_by_key(|(_, len)| *len);
        match least {
            Some((cpu, len)) if local_len > len + LOAD_BALANCE_THRESHOLD => cpu,
            _ => local,
        }
    }

    fn refill(&self, thread: &ThreadRef) {
        if let Some(sc) = thread.sched_context() {
            sc.set_budget(self.default_budget);
        }
    }
}

impl SchedPolicy for RoundRobinPolicy {
    fn kind(&self) -> SchedPolicyKind {
        SchedPolicyKind::RoundRobin
    }

    fn enqueue(&self, thread: &ThreadRef, local: CpuId) -> KernelResult<()> {
        if thread.thread_type() == ThreadType::Idle {
            return Ok(());
        }
        if thread.sched_context().is_none() {
            return Err(KernelError::InvalidArgument);
        }
        let cpu = match thread.affinity() {
            Some(cpu) => cpu,
            None => self.choose_cpu(local),
        };
        let queue = self.queues.get(cpu)?;
        if !thread.try_mark_ready() {
            return Err(KernelError::InvalidArgument);
        }
        thread.set_cpu(cpu);
        queue.lock().push_back(thread.clone());
        trace!("rr: queued {} on {}", thread.id(), cpu);
        Ok(())
    }

    fn dequeue(&self, thread: &ThreadRef) -> KernelResult<()> {
        let queue = self.queues.get(thread.cpu())?;
        let mut queue = queue.lock();
        let pos = queue
            .iter()
            .position(|t| t.ptr_eq(thread))
            .ok_or(KernelError::InvalidArgument)?;
        queue.remove(pos);
        thread.set_state(ThreadState::Init);
        Ok(())
    }

    fn sched(&self, cpu: CpuId, current: Option<&ThreadRef>) -> Option<ThreadRef> {
        if let Some(cur) = current {
            if can_keep_running(cur, cpu) && cur.budget().unwrap_or(0) > 0 {
                return Some(cur.clone());
            }
            if needs_requeue(cur) {
                self.refill(cur);
                if let Err(err) = self.enqueue(cur, cpu) {
                    panic!("BUG: cannot requeue {}: {}", cur.id(), err);
                }
            }
        }

        let mut queue = self.queues[cpu].lock();
        let mut index = 0;
        while index < queue.len() {
            let thread = &queue[index];
            if retire_if_exiting(thread) {
                queue.remove(index);
                continue;
            }
            if thread.is_suspended() {
                index += 1;
                continue;
            }
            let next = queue.remove(index);
            drop(queue);
            if let Some(next) = &next {
                if next.budget() == Some(0) {
                    self.refill(next);
                }
            }
            return next;
        }
        None
    }

    fn top(&self, cpu: CpuId) -> Option<ThreadRef> {
        let queue = self.queues.get(cpu).ok()?.lock();
        queue
            .iter()
            .find(|t| !t.is_suspended() && !t.is_exiting())
            .cloned()
    }

    fn queue_len(&self, cpu: CpuId) -> usize {
        self.queues.get(cpu).map_or(0, |q| q.lock().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{boot_with, spawn_thread, ROOT_CPU};
    use kernel_api::KernelConfig;

    fn rr_kernel(cpus: usize) -> crate::Kernel {
        let mut config = KernelConfig::default().with_policy(SchedPolicyKind::RoundRobin);
        config.cpu_count = cpus;
        boot_with(config)
    }

    #[test]
    fn test_rotation_ignores_priority() {
        let kernel = rr_kernel(1);
        let root = kernel.current_thread(ROOT_CPU).unwrap();
        let high = spawn_thread(&kernel, ROOT_CPU, 200);
        let low = spawn_thread(&kernel, ROOT_CPU, 1);
        kernel.schedule_audit().clear();

        kernel.advance_ticks(6);
        let order = kernel.schedule_audit().selected_on(ROOT_CPU);
        assert_eq!(order, vec![high.id(), low.id(), root.id()]);
    }

    #[test]
    fn test_load_balance_moves_unpinned_threads() {
        let kernel = rr_kernel(2);
        let mut threads = Vec::new();
        for _ in 0..(LOAD_BALANCE_THRESHOLD + 1) {
            threads.push(spawn_thread(&kernel, ROOT_CPU, 10));
        }
        let policy = kernel.sched_policy();
        assert_eq!(policy.queue_len(ROOT_CPU), LOAD_BALANCE_THRESHOLD + 1);
        assert_eq!(policy.queue_len(CpuId(1)), 0);

        let spilled = spawn_thread(&kernel, ROOT_CPU, 10);
        assert_eq!(spilled.cpu(), CpuId(1));
        assert_eq!(policy.queue_len(CpuId(1)), 1);
    }

    #[test]
    fn test_blocked_current_not_requeued() {
        let kernel = rr_kernel(1);
        let root = kernel.current_thread(ROOT_CPU).unwrap();
        root.set_state(ThreadState::Blocking);
        let next = kernel.sched_policy().sched(ROOT_CPU, Some(&root));
        assert!(next.is_none());
        assert_eq!(kernel.sched_policy().queue_len(ROOT_CPU), 0);
    }
}
