//! Priority-based policies
//!
//! One queue per priority per CPU, located through a two-level bitmap: a
//! summary word with one bit per group of 32 priorities, and one word per
//! group with one bit per non-empty queue.

use super::{can_keep_running, needs_requeue, retire_if_exiting, SchedPolicy};
use crate::per_cpu::PerCpu;
use crate::thread::{ThreadRef, ThreadState};
use core_types::CpuId;
use kernel_api::{KernelError, KernelResult, SchedPolicyKind, ThreadType};
use log::trace;
use std::collections::VecDeque;

const PRIO_NUM: usize = 256;
const PRIO_BITS: usize = 32;
const PRIO_WORDS: usize = PRIO_NUM / PRIO_BITS;

struct PrioQueues {
    summary: u32,
    words: [u32; PRIO_WORDS],
    queues: Vec<VecDeque<ThreadRef>>,
}

impl PrioQueues {
    fn new() -> Self {
        Self {
            summary: 0,
            words: [0; PRIO_WORDS],
            queues: (0..PRIO_NUM).map(|_| VecDeque::new()).collect(),
        }
    }

    fn push(&mut self, thread: ThreadRef, prio: usize, ahead: bool) {
        if ahead {
            self.queues[prio].push_front(thread);
        } else {
            self.queues[prio].push_back(thread);
        }
        self.words[prio / PRIO_BITS] |= 1u32 << (prio % PRIO_BITS);
        self.summary |= 1u32 << (prio / PRIO_BITS);
    }

    fn sync_bits(&mut self, prio: usize) {
        if self.queues[prio].is_empty() {
            let word = prio / PRIO_BITS;
            self.words[word] &= !(1u32 << (prio % PRIO_BITS));
            if self.words[word] == 0 {
                self.summary &= !(1u32 << word);
            }
        }
    }

    /// Highest priority with a queued thread
    fn highest(&self) -> Option<usize> {
        if self.summary == 0 {
            return None;
        }
        let word = (PRIO_BITS - 1) - self.summary.leading_zeros() as usize;
        let bit = (PRIO_BITS - 1) - self.words[word].leading_zeros() as usize;
        Some(word * PRIO_BITS + bit)
    }

    /// Non-empty priorities, highest first
    fn occupied(&self) -> Vec<usize> {
        let mut prios = Vec::new();
        let mut summary = self.summary;
        while summary != 0 {
            let word = (PRIO_BITS - 1) - summary.leading_zeros() as usize;
            summary &= !(1u32 << word);
            let mut bits = self.words[word];
            while bits != 0 {
                let bit = (PRIO_BITS - 1) - bits.leading_zeros() as usize;
                bits &= !(1u32 << bit);
                prios.push(word * PRIO_BITS + bit);
            }
        }
        prios
    }

    fn remove(&mut self, thread: &ThreadRef) -> bool {
        for prio in self.occupied() {
            if let Some(pos) = self.queues[prio].iter().position(|t| t.ptr_eq(thread)) {
                self.queues[prio].remove(pos);
                self.sync_bits(prio);
                return true;
            }
        }
        false
    }

    /// Pops the first non-suspended thread, highest priority first
    ///
    /// Exiting threads met on the way are dropped and marked exited.
    fn pop_runnable(&mut self) -> Option<ThreadRef> {
        for prio in self.occupied() {
            let queue = &mut self.queues[prio];
            let mut index = 0;
            let mut found = None;
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
                found = queue.remove(index);
                break;
            }
            self.sync_bits(prio);
            if found.is_some() {
                return found;
            }
        }
        None
    }

    fn peek_runnable(&self) -> Option<ThreadRef> {
        self.occupied().into_iter().find_map(|prio| {
            self.queues[prio]
                .iter()
                .find(|t| !t.is_suspended() && !t.is_exiting())
                .cloned()
        })
    }

    fn len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }
}

/// Priority round-robin (`fifo == false`) or priority FIFO (`fifo == true`)
pub struct PriorityPolicy {
    fifo: bool,
    default_budget: u32,
    queues: PerCpu<spin::Mutex<PrioQueues>>,
}

impl PriorityPolicy {
    pub fn new(cpu_count: usize, default_budget: u32, fifo: bool) -> Self {
        Self {
            fifo,
            default_budget,
            queues: PerCpu::new(cpu_count, |_| spin::Mutex::new(PrioQueues::new())),
        }
    }

    fn enqueue_at(&self, thread: &ThreadRef, local: CpuId, ahead: bool) -> KernelResult<()> {
        if thread.thread_type() == ThreadType::Idle {
            return Ok(());
        }
        let prio = thread.prio().ok_or(KernelError::InvalidArgument)? as usize;
        if prio >= PRIO_NUM {
            return Err(KernelError::InvalidArgument);
        }
        let cpu = thread.affinity().unwrap_or(local);
        let queue = self.queues.get(cpu)?;
        if !thread.try_mark_ready() {
            return Err(KernelError::InvalidArgument);
        }
        thread.set_cpu(cpu);
        queue.lock().push(thread.clone(), prio, ahead);
        trace!("pb: queued {} prio {} on {}", thread.id(), prio, cpu);
        Ok(())
    }

    fn refill(&self, thread: &ThreadRef) {
        if let Some(sc) = thread.sched_context() {
            if sc.budget() == 0 {
                sc.set_budget(self.default_budget);
            }
        }
    }

    fn should_keep(&self, current: &ThreadRef, highest: Option<usize>) -> bool {
        let Some(highest) = highest else {
            return true;
        };
        let prio = current.prio().unwrap_or(0) as usize;
        let budget = current.budget().unwrap_or(0);
        prio > highest || (prio == highest && (self.fifo || budget > 0))
    }
}

impl SchedPolicy for PriorityPolicy {
    fn kind(&self) -> SchedPolicyKind {
        if self.fifo {
            SchedPolicyKind::PriorityFifo
        } else {
            SchedPolicyKind::PriorityRoundRobin
        }
    }

    fn enqueue(&self, thread: &ThreadRef, local: CpuId) -> KernelResult<()> {
        self.enqueue_at(thread, local, false)
    }

    fn dequeue(&self, thread: &ThreadRef) -> KernelResult<()> {
        let queue = self.queues.get(thread.cpu())?;
        if !queue.lock().remove(thread) {
            return Err(KernelError::InvalidArgument);
        }
        thread.set_state(ThreadState::Init);
        Ok(())
    }

    fn sched(&self, cpu: CpuId, current: Option<&ThreadRef>) -> Option<ThreadRef> {
        let runnable = current.filter(|t| can_keep_running(t, cpu));
        let next = {
            let mut queues = self.queues[cpu].lock();
            if let Some(cur) = runnable {
                if self.should_keep(cur, queues.highest()) {
                    drop(queues);
                    self.refill(cur);
                    return Some(cur.clone());
                }
            }
            queues.pop_runnable()
        };

        let Some(next) = next else {
            if let Some(cur) = runnable {
                self.refill(cur);
                return Some(cur.clone());
            }
            if let Some(cur) = current.filter(|t| needs_requeue(t)) {
                if let Err(err) = self.enqueue_at(cur, cpu, false) {
                    panic!("BUG: cannot requeue {}: {}", cur.id(), err);
                }
            }
            return None;
        };

        if let Some(cur) = current.filter(|t| needs_requeue(t)) {
            let ahead = self.fifo || cur.budget().unwrap_or(0) > 0;
            if let Err(err) = self.enqueue_at(cur, cpu, ahead) {
                panic!("BUG: cannot requeue {}: {}", cur.id(), err);
            }
        }
        self.refill(&next);
        Some(next)
    }

    fn top(&self, cpu: CpuId) -> Option<ThreadRef> {
        self.queues.get(cpu).ok()?.lock().peek_runnable()
    }

    fn queue_len(&self, cpu: CpuId) -> usize {
        self.queues.get(cpu).map_or(0, |q| q.lock().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_highest() {
        let mut queues = PrioQueues::new();
        assert_eq!(queues.highest(), None);
        let kernel = crate::test_utils::boot_kernel(1);
        let root = kernel.current_thread(CpuId(0)).unwrap();

        queues.push(root.clone(), 3, false);
        queues.push(root.clone(), 40, false);
        queues.push(root.clone(), 255, false);
        assert_eq!(queues.highest(), Some(255));
        assert_eq!(queues.occupied(), vec![255, 40, 3]);

        queues.queues[255].clear();
        queues.sync_bits(255);
        assert_eq!(queues.highest(), Some(40));
        queues.queues[40].clear();
        queues.sync_bits(40);
        assert_eq!(queues.highest(), Some(3));
        assert_eq!(queues.summary, 1);
    }

    #[test]
    fn test_enqueue_twice_rejected() {
        let kernel = crate::test_utils::boot_kernel(1);
        let thread = crate::test_utils::spawn_thread(&kernel, CpuId(0), 5);
        let policy = PriorityPolicy::new(1, 2, false);
        thread.set_state(ThreadState::Init);
        policy.enqueue(&thread, CpuId(0)).unwrap();
        assert_eq!(policy.enqueue(&thread, CpuId(0)), Err(KernelError::InvalidArgument));
        assert_eq!(policy.queue_len(CpuId(0)), 1);

        policy.dequeue(&thread).unwrap();
        assert_eq!(policy.queue_len(CpuId(0)), 0);
        assert_eq!(policy.dequeue(&thread), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn test_pop_skips_suspended_and_drops_exiting() {
        let kernel = crate::test_utils::boot_kernel(1);
        let a = crate::test_utils::spawn_thread(&kernel, CpuId(0), 5);
        let b = crate::test_utils::spawn_thread(&kernel, CpuId(0), 5);
        let c = crate::test_utils::spawn_thread(&kernel, CpuId(0), 5);
        a.set_suspended(true);
        b.set_exit_state(crate::thread::ExitState::Exiting);

        let next = kernel.sched_policy().top(CpuId(0)).unwrap();
        assert!(next.ptr_eq(&c));
        let popped = kernel.sched_policy().sched(CpuId(0), None).unwrap();
        assert!(popped.ptr_eq(&c));
        assert_eq!(b.exit_state(), crate::thread::ExitState::Exited);
        assert_eq!(kernel.sched_policy().queue_len(CpuId(0)), 1);
    }
}
