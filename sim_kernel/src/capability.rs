//! Capability operations
//!
//! Lock order: slot table, then the object's copies list. The only path
//! that starts from the copies list ([`Kernel::cap_free_all`]) try-locks the
//! tables and restarts on contention.

use crate::capability_audit::CapabilityAuditLog;
use crate::cap_group::CapGroup;
use crate::object::{Handle, KernelObject, ObjRef, Object, SlotLink};
use crate::slot_table::ObjectSlot;
use crate::Kernel;
use core_types::{CapId, CapRights, CapabilityError, CapabilityEvent, CpuId};
use ipc::MAX_CAP_TRANSFER;
use kernel_api::{KernelError, KernelResult};
use log::{debug, warn};
use std::sync::Arc;

impl Kernel {
    pub(crate) fn record_cap_event(&self, event: CapabilityEvent) {
        let now = self.clock.now();
        self.capability_audit.lock().record_event(now, event);
    }

    /// Capability lifecycle audit trail
    pub fn capability_audit(&self) -> spin::MutexGuard<'_, CapabilityAuditLog> {
        self.capability_audit.lock()
    }

    /// Installs `object` in a fresh slot of `group` with the given rights
    pub fn cap_alloc_with_rights(
        &self,
        group: &Handle<CapGroup>,
        object: &Arc<Object>,
        rights: CapRights,
    ) -> KernelResult<CapId> {
        let cap = {
            let mut table = group.slot_table.write();
            let cap = table.alloc_slot_id().ok_or(KernelError::OutOfMemory)?;
            self.link_slot(&mut table, group, object, cap, rights);
            cap
        };
        self.record_cap_event(CapabilityEvent::Allocated {
            object: object.id(),
            object_type: object.object_type(),
            group: group.badge(),
            cap,
            rights,
        });
        Ok(cap)
    }

    /// Installs `object` with full rights
    pub fn cap_alloc(&self, group: &Handle<CapGroup>, object: &Arc<Object>) -> KernelResult<CapId> {
        self.cap_alloc_with_rights(group, object, CapRights::ALL)
    }

    fn link_slot(
        &self,
        table: &mut crate::slot_table::SlotTable,
        group: &Handle<CapGroup>,
        object: &Arc<Object>,
        cap: CapId,
        rights: CapRights,
    ) {
        table.install(ObjectSlot {
            slot_id: cap,
            object: Arc::clone(object),
            rights,
        });
        object.get();
        object.copies.lock().push(SlotLink {
            cap_group: Arc::downgrade(group.object()),
            slot: cap,
        });
    }

    /// Resolves a slot without taking a hold
    pub fn lookup_cap<T: KernelObject>(
        &self,
        group: &Handle<CapGroup>,
        cap: CapId,
        required: CapRights,
    ) -> Result<(Handle<T>, CapRights), CapabilityError> {
        let table = group.slot_table.read();
        let slot = table.get(cap).ok_or(CapabilityError::EmptySlot(cap))?;
        check_slot::<T>(slot, required).map(|handle| (handle, slot.rights))
    }

    /// Looks up a typed object and takes a hold on it
    ///
    /// Fails with `InvalidCapability` if the slot is empty, names another
    /// type or lacks `required`.
    pub fn obj_get_with_rights<T: KernelObject>(
        &self,
        group: &Handle<CapGroup>,
        cap: CapId,
        required: CapRights,
    ) -> KernelResult<ObjRef<'_, T>> {
        let table = group.slot_table.read();
        let result = table
            .get(cap)
            .ok_or(CapabilityError::EmptySlot(cap))
            .and_then(|slot| check_slot::<T>(slot, required));
        match result {
            Ok(handle) => {
                handle.object().get();
                Ok(ObjRef::adopt(self, handle))
            }
            Err(err) => {
                debug!("obj_get in {}: {}", group.badge(), err);
                Err(err.into())
            }
        }
    }

    pub fn obj_get<T: KernelObject>(
        &self,
        group: &Handle<CapGroup>,
        cap: CapId,
    ) -> KernelResult<ObjRef<'_, T>> {
        self.obj_get_with_rights(group, cap, CapRights::NONE)
    }

    /// Derives a new slot in `dest` from `src_cap` in `src`
    ///
    /// The source slot must carry `COPY`. The new slot's rights are
    /// `change(source, mask, rest)`.
    pub fn cap_copy(
        &self,
        src: &Handle<CapGroup>,
        dest: &Handle<CapGroup>,
        src_cap: CapId,
        mask: CapRights,
        rest: CapRights,
    ) -> KernelResult<CapId> {
        let (object, rights, dest_cap) = if src.ptr_eq(dest) {
            let mut table = src.slot_table.write();
            let (object, rights) = copy_source(&table, src_cap, mask, rest)?;
            let cap = table.alloc_slot_id().ok_or(KernelError::OutOfMemory)?;
            self.link_slot(&mut table, dest, &object, cap, rights);
            (object, rights, cap)
        } else {
            loop {
                let src_table = src.slot_table.read();
                let (object, rights) = copy_source(&src_table, src_cap, mask, rest)?;
                let Some(mut dest_table) = dest.slot_table.try_write() else {
                    drop(src_table);
                    std::hint::spin_loop();
                    continue;
                };
                let cap = dest_table.alloc_slot_id().ok_or(KernelError::OutOfMemory)?;
                self.link_slot(&mut dest_table, dest, &object, cap, rights);
                break (object, rights, cap);
            }
        };
        self.record_cap_event(CapabilityEvent::Copied {
            object: object.id(),
            from_group: src.badge(),
            from_cap: src_cap,
            to_group: dest.badge(),
            to_cap: dest_cap,
            rights,
        });
        Ok(dest_cap)
    }

    /// Frees one slot
    pub fn cap_free(&self, group: &Handle<CapGroup>, cap: CapId) -> KernelResult<()> {
        let slot = {
            let mut table = group.slot_table.write();
            let slot = table.take(cap).ok_or(KernelError::InvalidCapability)?;
            slot.object
                .copies
                .lock()
                .retain(|link| !link.is(group.object(), cap));
            slot
        };
        self.record_cap_event(CapabilityEvent::Freed {
            object: slot.object.id(),
            group: group.badge(),
            cap,
        });
        self.obj_put(&slot.object);
        Ok(())
    }

    /// Frees every slot referencing the object behind `cap`, system-wide
    ///
    /// Returns the number of slots freed.
    pub fn cap_free_all(&self, group: &Handle<CapGroup>, cap: CapId) -> KernelResult<usize> {
        let object = {
            let table = group.slot_table.read();
            let slot = table.get(cap).ok_or(KernelError::InvalidCapability)?;
            slot.object.get();
            Arc::clone(&slot.object)
        };

        let mut freed = Vec::new();
        'restart: loop {
            let mut copies = object.copies.lock();
            while let Some(link) = copies.last().cloned() {
                let owner = link.cap_group.upgrade().and_then(Handle::<CapGroup>::new);
                if let Some(owner) = owner {
                    let Some(mut table) = owner.slot_table.try_write() else {
                        drop(copies);
                        std::hint::spin_loop();
                        continue 'restart;
                    };
                    match table.take(link.slot) {
                        Some(slot) if Arc::ptr_eq(&slot.object, &object) => {
                            freed.push((owner.badge(), link.slot));
                        }
                        _ => panic!("BUG: copies list of {} is stale", object.id()),
                    }
                }
                copies.pop();
                if object.put() {
                    panic!("BUG: revoke dropped the last reference of {}", object.id());
                }
            }
            break;
        }

        for (badge, slot) in &freed {
            self.record_cap_event(CapabilityEvent::Freed {
                object: object.id(),
                group: *badge,
                cap: *slot,
            });
        }
        self.record_cap_event(CapabilityEvent::Revoked {
            object: object.id(),
            by_group: group.badge(),
            slots_freed: freed.len(),
        });
        self.obj_put(&object);
        Ok(freed.len())
    }

    /// Frees the caller's slot, or with `revoke_copy` every slot of the object
    ///
    /// The caller may not revoke its own cap group or itself.
    pub fn sys_revoke_cap(&self, cpu: CpuId, cap: CapId, revoke_copy: bool) -> KernelResult<()> {
        let current = self.current_thread(cpu)?;
        let group = self.current_cap_group(cpu)?;
        let rights = {
            let table = group.slot_table.read();
            let slot = table.get(cap).ok_or(KernelError::InvalidCapability)?;
            if Arc::ptr_eq(&slot.object, group.object())
                || Arc::ptr_eq(&slot.object, current.object())
            {
                return Err(KernelError::InvalidArgument);
            }
            slot.rights
        };
        if revoke_copy {
            if !rights.contain(CapRights::REVOKE_ALL) {
                warn!("revoke_cap: {} in {} lacks REVOKE_ALL", cap, group.badge());
                return Err(KernelError::InvalidCapability);
            }
            self.cap_free_all(&group, cap).map(|_| ())
        } else {
            self.cap_free(&group, cap)
        }
    }

    /// Copies each of `caps` into the cap group named by `dest_group_cap`
    ///
    /// Entries are independent: a failing cap yields its error in the
    /// result vector without affecting the others.
    pub fn sys_transfer_caps(
        &self,
        cpu: CpuId,
        dest_group_cap: CapId,
        caps: &[CapId],
    ) -> KernelResult<Vec<KernelResult<CapId>>> {
        if caps.is_empty() || caps.len() > MAX_CAP_TRANSFER {
            return Err(KernelError::InvalidArgument);
        }
        let group = self.current_cap_group(cpu)?;
        let dest = self.obj_get::<CapGroup>(&group, dest_group_cap)?;
        Ok(caps
            .iter()
            .map(|cap| self.cap_copy(&group, &dest, *cap, CapRights::NONE, CapRights::NONE))
            .collect())
    }
}

fn check_slot<T: KernelObject>(
    slot: &ObjectSlot,
    required: CapRights,
) -> Result<Handle<T>, CapabilityError> {
    let handle = Handle::<T>::new(Arc::clone(&slot.object)).ok_or(CapabilityError::TypeMismatch {
        cap: slot.slot_id,
        expected: T::TYPE,
        actual: slot.object.object_type(),
    })?;
    if !slot.rights.contain(required) {
        return Err(CapabilityError::InsufficientRights {
            cap: slot.slot_id,
            required,
            actual: slot.rights,
        });
    }
    Ok(handle)
}

fn copy_source(
    table: &crate::slot_table::SlotTable,
    cap: CapId,
    mask: CapRights,
    rest: CapRights,
) -> KernelResult<(Arc<Object>, CapRights)> {
    let slot = table.get(cap).ok_or(KernelError::InvalidCapability)?;
    if !slot.rights.contain(CapRights::COPY) {
        return Err(KernelError::InvalidCapability);
    }
    Ok((Arc::clone(&slot.object), slot.rights.change(mask, rest)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmo::Pmo;
    use crate::test_utils::{boot_kernel, spawn_process, ROOT_CPU};
    use kernel_api::KernelConfig;

    fn pmo_cap(kernel: &Kernel) -> (Handle<CapGroup>, CapId) {
        let group = kernel.current_cap_group(ROOT_CPU).unwrap();
        let cap = kernel.sys_create_pmo(ROOT_CPU, 4096).unwrap();
        (group, cap)
    }

    #[test]
    fn test_alloc_and_get() {
        let kernel = boot_kernel(1);
        let (group, cap) = pmo_cap(&kernel);
        let pmo = kernel.obj_get::<Pmo>(&group, cap).unwrap();
        assert_eq!(pmo.size(), 4096);
        assert_eq!(pmo.object().refcount(), 2);
        drop(pmo);

        let (_, rights) = kernel.lookup_cap::<Pmo>(&group, cap, CapRights::NONE).unwrap();
        assert_eq!(rights, CapRights::ALL);
    }

    #[test]
    fn test_get_rejects_wrong_type_and_empty_slot() {
        let kernel = boot_kernel(1);
        let (group, cap) = pmo_cap(&kernel);
        assert!(matches!(
            kernel.obj_get::<CapGroup>(&group, cap),
            Err(KernelError::InvalidCapability)
        ));
        assert!(matches!(
            kernel.lookup_cap::<CapGroup>(&group, cap, CapRights::NONE),
            Err(CapabilityError::TypeMismatch { .. })
        ));
        assert!(matches!(
            kernel.lookup_cap::<Pmo>(&group, CapId::new(40), CapRights::NONE),
            Err(CapabilityError::EmptySlot(_))
        ));
    }

    #[test]
    fn test_copy_narrows_rights() {
        let kernel = boot_kernel(1);
        let (group, cap) = pmo_cap(&kernel);
        let copy = kernel
            .cap_copy(&group, &group, cap, CapRights::WRITE | CapRights::EXEC, CapRights::NONE)
            .unwrap();

        assert!(kernel.obj_get_with_rights::<Pmo>(&group, copy, CapRights::READ).is_ok());
        assert!(matches!(
            kernel.obj_get_with_rights::<Pmo>(&group, copy, CapRights::WRITE),
            Err(KernelError::InvalidCapability)
        ));
        let slot = group.slot(copy).unwrap();
        assert_eq!(slot.object.copy_count(), 2);
        assert_eq!(slot.object.refcount(), 2);
    }

    #[test]
    fn test_copy_requires_copy_right() {
        let kernel = boot_kernel(1);
        let (group, cap) = pmo_cap(&kernel);
        let no_copy = kernel
            .cap_copy(&group, &group, cap, CapRights::COPY, CapRights::NONE)
            .unwrap();
        assert_eq!(
            kernel.cap_copy(&group, &group, no_copy, CapRights::NONE, CapRights::NONE),
            Err(KernelError::InvalidCapability)
        );
    }

    #[test]
    fn test_free_last_slot_deinitializes() {
        let kernel = boot_kernel(1);
        let (group, cap) = pmo_cap(&kernel);
        let object = Arc::clone(&group.slot(cap).unwrap().object);
        kernel.cap_free(&group, cap).unwrap();
        assert!(object.is_deinitialized());
        assert_eq!(kernel.cap_free(&group, cap), Err(KernelError::InvalidCapability));
    }

    #[test]
    fn test_revoke_all_frees_copies_everywhere() {
        let kernel = boot_kernel(1);
        let child = spawn_process(&kernel, ROOT_CPU, "child");
        let (group, cap) = pmo_cap(&kernel);
        let object = Arc::clone(&group.slot(cap).unwrap().object);

        let child_cap = kernel
            .cap_copy(&group, &child.cap_group, cap, CapRights::NONE, CapRights::NONE)
            .unwrap();
        kernel
            .cap_copy(&group, &group, cap, CapRights::NONE, CapRights::NONE)
            .unwrap();
        assert_eq!(object.copy_count(), 3);

        kernel.sys_revoke_cap(ROOT_CPU, cap, true).unwrap();
        assert_eq!(object.copy_count(), 0);
        assert_eq!(object.refcount(), 0);
        assert!(object.is_deinitialized());
        assert!(child.cap_group.slot(child_cap).is_none());

        let audit = kernel.capability_audit();
        assert!(audit.has_event(|e| matches!(
            e,
            CapabilityEvent::Revoked { slots_freed: 3, .. }
        )));
    }

    #[test]
    fn test_revoke_single_keeps_copies() {
        let kernel = boot_kernel(1);
        let (group, cap) = pmo_cap(&kernel);
        let copy = kernel
            .cap_copy(&group, &group, cap, CapRights::NONE, CapRights::NONE)
            .unwrap();
        kernel.sys_revoke_cap(ROOT_CPU, cap, false).unwrap();
        let slot = group.slot(copy).unwrap();
        assert_eq!(slot.object.refcount(), 1);
        assert!(!slot.object.is_deinitialized());
    }

    #[test]
    fn test_revoke_all_requires_right() {
        let kernel = boot_kernel(1);
        let (group, cap) = pmo_cap(&kernel);
        let weak = kernel
            .cap_copy(&group, &group, cap, CapRights::REVOKE_ALL, CapRights::NONE)
            .unwrap();
        assert_eq!(
            kernel.sys_revoke_cap(ROOT_CPU, weak, true),
            Err(KernelError::InvalidCapability)
        );
    }

    #[test]
    fn test_revoke_refuses_self() {
        let kernel = boot_kernel(1);
        assert_eq!(
            kernel.sys_revoke_cap(ROOT_CPU, crate::cap_group::CAP_GROUP_OBJ_ID, false),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            kernel.sys_revoke_cap(ROOT_CPU, crate::cap_group::ROOT_THREAD_OBJ_ID, true),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn test_slot_exhaustion_is_enomem() {
        let config = KernelConfig::default()
            .single_cpu()
            .with_slot_limits(64, 128);
        let kernel = crate::test_utils::boot_with(config);
        let group = kernel.current_cap_group(ROOT_CPU).unwrap();
        let mut last = Ok(CapId::new(0));
        for _ in 0..200 {
            last = kernel.sys_create_pmo(ROOT_CPU, 16);
            if last.is_err() {
                break;
            }
        }
        assert_eq!(last, Err(KernelError::OutOfMemory));
        assert_eq!(group.slot_table_size(), 128);
        assert_eq!(group.slot_count(), 128);
    }

    #[test]
    fn test_transfer_caps_per_entry_results() {
        let kernel = boot_kernel(1);
        let child = spawn_process(&kernel, ROOT_CPU, "child");
        let (_, cap) = pmo_cap(&kernel);

        let results = kernel
            .sys_transfer_caps(ROOT_CPU, child.group_cap, &[cap, CapId::new(60)])
            .unwrap();
        assert_eq!(results.len(), 2);
        let installed = results[0].unwrap();
        assert!(kernel
            .obj_get::<Pmo>(&child.cap_group, installed)
            .is_ok());
        assert_eq!(results[1], Err(KernelError::InvalidCapability));

        assert_eq!(
            kernel.sys_transfer_caps(ROOT_CPU, child.group_cap, &[]),
            Err(KernelError::InvalidArgument)
        );
    }
}
