//! Minimal address spaces
//!
//! A [`VmSpace`] is an ordered list of PMO mappings. It exists so the kernel
//! can resolve user pointers (`copy_from_user`/`copy_to_user`) and so IPC
//! shared memory is visible at different addresses on each side. There are
//! no page tables.

use crate::object::Handle;
use crate::pmo::Pmo;
use crate::Kernel;
use bitflags::bitflags;
use core_types::CpuId;
use kernel_api::{KernelError, KernelResult};

bitflags! {
    /// Access permissions of a mapping
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VmPerm: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl VmPerm {
    pub const RW: VmPerm = VmPerm::READ.union(VmPerm::WRITE);
}

/// One mapping
#[derive(Debug, Clone)]
pub struct VmRegion {
    pub vaddr: u64,
    pub len: u64,
    pub perm: VmPerm,
    pub pmo: Handle<Pmo>,
}

impl VmRegion {
    fn end(&self) -> u64 {
        self.vaddr + self.len
    }

    fn contains(&self, addr: u64) -> bool {
        addr >= self.vaddr && addr < self.end()
    }
}

#[derive(Debug, Default)]
pub struct VmSpace {
    regions: spin::RwLock<Vec<VmRegion>>,
}

impl VmSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps all of `pmo` at `vaddr`
    ///
    /// Fails with `InvalidArgument` on address overflow or overlap.
    pub fn map(&self, vaddr: u64, pmo: Handle<Pmo>, perm: VmPerm) -> KernelResult<()> {
        let len = pmo.size() as u64;
        if vaddr == 0 || vaddr.checked_add(len).is_none() {
            return Err(KernelError::InvalidArgument);
        }
        let mut regions = self.regions.write();
        let overlaps = regions
            .iter()
            .any(|r| vaddr < r.end() && r.vaddr < vaddr + len);
        if overlaps {
            return Err(KernelError::InvalidArgument);
        }
        let at = regions.partition_point(|r| r.vaddr < vaddr);
        regions.insert(
            at,
            VmRegion {
                vaddr,
                len,
                perm,
                pmo,
            },
        );
        Ok(())
    }

    /// Removes the mapping starting at `vaddr`
    pub fn unmap(&self, vaddr: u64) -> KernelResult<Handle<Pmo>> {
        let mut regions = self.regions.write();
        let index = regions
            .iter()
            .position(|r| r.vaddr == vaddr)
            .ok_or(KernelError::InvalidArgument)?;
        Ok(regions.remove(index).pmo)
    }

    pub fn clear(&self) {
        self.regions.write().clear();
    }

    pub fn region_count(&self) -> usize {
        self.regions.read().len()
    }

    /// Finds the mapping covering `addr`
    pub fn lookup(&self, addr: u64) -> Option<VmRegion> {
        self.regions.read().iter().find(|r| r.contains(addr)).cloned()
    }

    /// Reads user memory; the range may span adjacent mappings
    pub fn read(&self, vaddr: u64, buf: &mut [u8]) -> KernelResult<()> {
        let mut done = 0;
        while done < buf.len() {
            let addr = vaddr
                .checked_add(done as u64)
                .ok_or(KernelError::BadAddress)?;
            let region = self.lookup(addr).ok_or(KernelError::BadAddress)?;
            if !region.perm.contains(VmPerm::READ) {
                return Err(KernelError::BadAddress);
            }
            let chunk = ((region.end() - addr) as usize).min(buf.len() - done);
            let offset = (addr - region.vaddr) as usize;
            if !region.pmo.read(offset, &mut buf[done..done + chunk]) {
                return Err(KernelError::BadAddress);
            }
            done += chunk;
        }
        Ok(())
    }

    pub fn write(&self, vaddr: u64, bytes: &[u8]) -> KernelResult<()> {
        let mut done = 0;
        while done < bytes.len() {
            let addr = vaddr
                .checked_add(done as u64)
                .ok_or(KernelError::BadAddress)?;
            let region = self.lookup(addr).ok_or(KernelError::BadAddress)?;
            if !region.perm.contains(VmPerm::WRITE) {
                return Err(KernelError::BadAddress);
            }
            let chunk = ((region.end() - addr) as usize).min(bytes.len() - done);
            let offset = (addr - region.vaddr) as usize;
            if !region.pmo.write(offset, &bytes[done..done + chunk]) {
                return Err(KernelError::BadAddress);
            }
            done += chunk;
        }
        Ok(())
    }

    pub fn read_u32(&self, vaddr: u64) -> KernelResult<u32> {
        let mut word = [0u8; 4];
        self.read(vaddr, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    pub fn write_u32(&self, vaddr: u64, value: u32) -> KernelResult<()> {
        self.write(vaddr, &value.to_le_bytes())
    }
}

impl Kernel {
    /// Copies `len` bytes from the current thread's address space
    pub fn copy_from_user(&self, cpu: CpuId, vaddr: u64, len: usize) -> KernelResult<Vec<u8>> {
        let group = self.current_cap_group(cpu)?;
        let mut buf = vec![0u8; len];
        group.vmspace().read(vaddr, &mut buf)?;
        Ok(buf)
    }

    /// Copies `bytes` into the current thread's address space
    pub fn copy_to_user(&self, cpu: CpuId, vaddr: u64, bytes: &[u8]) -> KernelResult<()> {
        let group = self.current_cap_group(cpu)?;
        group.vmspace().write(vaddr, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectKind;
    use crate::test_utils::boot_kernel;

    fn pmo(kernel: &Kernel, size: usize) -> Handle<Pmo> {
        Handle::new(kernel.obj_alloc(ObjectKind::Pmo(Pmo::new(size)))).unwrap()
    }

    #[test]
    fn test_map_rejects_overlap() {
        let kernel = boot_kernel(1);
        let space = VmSpace::new();
        space.map(0x1000, pmo(&kernel, 0x1000), VmPerm::RW).unwrap();
        assert_eq!(
            space.map(0x1800, pmo(&kernel, 0x1000), VmPerm::RW),
            Err(KernelError::InvalidArgument)
        );
        assert!(space.map(0x2000, pmo(&kernel, 0x1000), VmPerm::READ).is_ok());
        assert_eq!(space.region_count(), 2);
    }

    #[test]
    fn test_read_write_roundtrip_across_regions() {
        let kernel = boot_kernel(1);
        let space = VmSpace::new();
        space.map(0x1000, pmo(&kernel, 0x10), VmPerm::RW).unwrap();
        space.map(0x1010, pmo(&kernel, 0x10), VmPerm::RW).unwrap();

        let payload: Vec<u8> = (0..24).collect();
        space.write(0x1004, &payload).unwrap();
        let mut back = vec![0u8; 24];
        space.read(0x1004, &mut back).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_fault_on_unmapped_or_read_only() {
        let kernel = boot_kernel(1);
        let space = VmSpace::new();
        space.map(0x1000, pmo(&kernel, 0x100), VmPerm::READ).unwrap();

        assert_eq!(space.write_u32(0x1000, 7), Err(KernelError::BadAddress));
        assert_eq!(space.read_u32(0x9000), Err(KernelError::BadAddress));
        assert_eq!(space.read_u32(0x10fe), Err(KernelError::BadAddress));
        assert_eq!(space.read_u32(0x1000), Ok(0));
    }

    #[test]
    fn test_unmap() {
        let kernel = boot_kernel(1);
        let space = VmSpace::new();
        let backing = pmo(&kernel, 0x100);
        space.map(0x1000, backing.clone(), VmPerm::RW).unwrap();
        let removed = space.unmap(0x1000).unwrap();
        assert!(removed.ptr_eq(&backing));
        assert!(space.unmap(0x1000).is_err());
        assert!(space.lookup(0x1000).is_none());
    }
}
