//! Physical memory objects
//!
//! A PMO is a zero-filled byte region. It backs user mappings and the
//! shared memory of IPC connections.

use crate::object::ObjectKind;
use crate::vmspace::VmPerm;
use crate::Kernel;
use core_types::{CapId, CapRights, CpuId};
use kernel_api::{KernelError, KernelResult};
use log::debug;

/// Largest PMO the simulated machine can back
pub const PMO_MAX_SIZE: usize = 64 << 20;

#[derive(Debug)]
pub struct Pmo {
    data: spin::Mutex<Vec<u8>>,
    size: usize,
}

impl Pmo {
    pub fn new(size: usize) -> Self {
        Self {
            data: spin::Mutex::new(vec![0; size]),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Copies bytes out; false if the range leaves the object
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> bool {
        let data = self.data.lock();
        match offset.checked_add(buf.len()).and_then(|end| data.get(offset..end)) {
            Some(src) => {
                buf.copy_from_slice(src);
                true
            }
            None => false,
        }
    }

    /// Copies bytes in; false if the range leaves the object
    pub fn write(&self, offset: usize, bytes: &[u8]) -> bool {
        let mut data = self.data.lock();
        match offset
            .checked_add(bytes.len())
            .and_then(|end| data.get_mut(offset..end))
        {
            Some(dst) => {
                dst.copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    /// Runs `f` over the whole region
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.data.lock())
    }

    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.data.lock())
    }
}

impl Kernel {
    pub fn sys_create_pmo(&self, cpu: CpuId, size: u64) -> KernelResult<CapId> {
        let size = usize::try_from(size).map_err(|_| KernelError::OutOfMemory)?;
        if size == 0 {
            return Err(KernelError::InvalidArgument);
        }
        if size > PMO_MAX_SIZE {
            return Err(KernelError::OutOfMemory);
        }
        let group = self.current_cap_group(cpu)?;
        let object = self.obj_alloc(ObjectKind::Pmo(Pmo::new(size)));
        self.cap_alloc(&group, &object)
    }

    /// Maps a PMO into the address space of a cap group
    ///
    /// The PMO slot must carry the rights matching `perm`.
    pub fn sys_map_pmo(
        &self,
        cpu: CpuId,
        group_cap: CapId,
        pmo_cap: CapId,
        vaddr: u64,
        perm: VmPerm,
    ) -> KernelResult<()> {
        let current = self.current_cap_group(cpu)?;
        let target = self.obj_get::<crate::cap_group::CapGroup>(&current, group_cap)?;
        let pmo = self.obj_get_with_rights::<Pmo>(&current, pmo_cap, perm.required_rights())?;
        debug!(
            "map_pmo: {} at {:#x} ({:?}) in {}",
            pmo.id(),
            vaddr,
            perm,
            target.badge()
        );
        target.vmspace().map(vaddr, pmo.handle().clone(), perm)
    }
}

impl VmPerm {
    /// Rights a PMO slot needs for a mapping with these permissions
    pub fn required_rights(self) -> CapRights {
        let mut rights = CapRights::NONE;
        if self.contains(VmPerm::READ) {
            rights |= CapRights::READ;
        }
        if self.contains(VmPerm::WRITE) {
            rights |= CapRights::WRITE;
        }
        if self.contains(VmPerm::EXEC) {
            rights |= CapRights::EXEC;
        }
        rights
    }
}
