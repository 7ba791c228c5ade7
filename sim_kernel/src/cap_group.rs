//! Cap groups
//!
//! A cap group is the process-equivalent container: it owns a slot table,
//! a list of threads, an address space and a futex table. Its badge is
//! globally unique and identifies it as an IPC client.

use crate::futex::FutexTable;
use crate::object::{Handle, Object, ObjectKind};
use crate::slot_table::{ObjectSlot, SlotTable};
use crate::thread::{ExitState, ThreadRef};
use crate::vmspace::VmSpace;
use crate::Kernel;
use core_types::{Badge, CapId, CapabilityEvent, CpuId};
use kernel_api::{CapGroupArgs, KernelConfig, KernelError, KernelResult};
use log::debug;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Slot every cap group holds for itself
pub const CAP_GROUP_OBJ_ID: CapId = CapId::new(0);
/// Slot of the root thread in the root cap group
pub const ROOT_THREAD_OBJ_ID: CapId = CapId::new(1);

pub struct CapGroup {
    name: String,
    badge: Badge,
    pid: u64,
    pub(crate) slot_table: spin::RwLock<SlotTable>,
    threads: spin::Mutex<Vec<ThreadRef>>,
    vmspace: VmSpace,
    pub(crate) futexes: FutexTable,
}

impl CapGroup {
    fn new(name: String, badge: Badge, pid: u64, config: &KernelConfig) -> Self {
        Self {
            name,
            badge,
            pid,
            slot_table: spin::RwLock::new(SlotTable::new(
                config.initial_slot_table_size,
                config.max_slot_table_size,
            )),
            threads: spin::Mutex::new(Vec::new()),
            vmspace: VmSpace::new(),
            futexes: FutexTable::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn badge(&self) -> Badge {
        self.badge
    }

    pub fn pid(&self) -> u64 {
        self.pid
    }

    pub fn vmspace(&self) -> &VmSpace {
        &self.vmspace
    }

    pub fn threads(&self) -> Vec<ThreadRef> {
        self.threads.lock().clone()
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    /// Number of occupied slots
    pub fn slot_count(&self) -> usize {
        self.slot_table.read().len()
    }

    pub fn slot_table_size(&self) -> usize {
        self.slot_table.read().size()
    }

    /// Snapshot of one slot
    pub fn slot(&self, cap: CapId) -> Option<ObjectSlot> {
        self.slot_table.read().get(cap).cloned()
    }

    pub(crate) fn add_thread(&self, thread: ThreadRef) {
        self.threads.lock().push(thread);
    }

    pub(crate) fn remove_thread(&self, thread: &ThreadRef) {
        self.threads.lock().retain(|t| !t.ptr_eq(thread));
    }
}

/// Root cap group and its first thread, created once at boot
#[derive(Debug, Clone)]
pub struct RootProcess {
    pub cap_group: Handle<CapGroup>,
    pub thread: ThreadRef,
}

impl Kernel {
    fn new_cap_group(&self, name: String, pid: u64) -> Arc<Object> {
        let badge = Badge::from_raw(self.next_badge.fetch_add(1, Ordering::Relaxed));
        self.obj_alloc(ObjectKind::CapGroup(CapGroup::new(
            name,
            badge,
            pid,
            &self.config,
        )))
    }

    fn as_cap_group(object: &Arc<Object>) -> KernelResult<Handle<CapGroup>> {
        Handle::new(Arc::clone(object)).ok_or(KernelError::InvalidArgument)
    }

    /// Creates the root cap group and root thread
    ///
    /// Runs under the big kernel lock; a second call fails.
    pub fn create_root_cap_group(&self, name: &str) -> KernelResult<RootProcess> {
        let mut root = self.big_kernel_lock.lock();
        if root.is_some() {
            return Err(KernelError::InvalidArgument);
        }
        let object = self.new_cap_group(name.to_string(), 1);
        let cap_group = Self::as_cap_group(&object)?;
        let self_cap = self.cap_alloc(&cap_group, &object)?;
        if self_cap != CAP_GROUP_OBJ_ID {
            panic!("BUG: root cap group got self slot {}", self_cap);
        }
        let thread = self.create_root_thread(&cap_group)?;
        debug!("root cap group {} ({}) ready", name, cap_group.badge());

        let process = RootProcess { cap_group, thread };
        *root = Some(process.clone());
        Ok(process)
    }

    pub fn root_process(&self) -> Option<RootProcess> {
        self.big_kernel_lock.lock().clone()
    }

    /// Cap group of the thread running on `cpu`
    pub fn current_cap_group(&self, cpu: CpuId) -> KernelResult<Handle<CapGroup>> {
        self.current_thread(cpu)?
            .cap_group()
            .ok_or(KernelError::PeerExiting)
    }

    /// Creates a child cap group and returns the caller's cap to it
    pub fn sys_create_cap_group(&self, cpu: CpuId, args: &CapGroupArgs) -> KernelResult<CapId> {
        if args.name_len > CapGroupArgs::MAX_NAME_LEN {
            return Err(KernelError::InvalidArgument);
        }
        let name = if args.name_len == 0 {
            String::new()
        } else {
            let bytes = self.copy_from_user(cpu, args.name, args.name_len as usize)?;
            String::from_utf8_lossy(&bytes).into_owned()
        };
        let current = self.current_cap_group(cpu)?;

        let object = self.new_cap_group(name, args.pid);
        let new_group = Self::as_cap_group(&object)?;
        self.cap_alloc(&new_group, &object)?;
        match self.cap_alloc(&current, &object) {
            Ok(cap) => {
                debug!(
                    "create_cap_group: {} pid {} as {} in {}",
                    new_group.badge(),
                    args.pid,
                    cap,
                    current.badge()
                );
                Ok(cap)
            }
            Err(err) => {
                self.cap_free(&new_group, CAP_GROUP_OBJ_ID)?;
                Err(err)
            }
        }
    }

    pub(crate) fn cap_group_deinit(&self, object: &Arc<Object>, group: &CapGroup) {
        let slots = group.slot_table.write().drain();
        for slot in slots {
            slot.object
                .copies
                .lock()
                .retain(|link| !link.is(object, slot.slot_id));
            self.record_cap_event(CapabilityEvent::Freed {
                object: slot.object.id(),
                group: group.badge(),
                cap: slot.slot_id,
            });
            self.obj_put(&slot.object);
        }
        let threads: Vec<ThreadRef> = std::mem::take(&mut *group.threads.lock());
        for thread in threads {
            if thread.exit_state() == ExitState::Running {
                thread.set_exit_state(ExitState::Exiting);
            }
        }
        group.vmspace.clear();
        group.futexes.clear();
    }
}
