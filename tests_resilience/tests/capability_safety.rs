//! Capability Safety Tests
//!
//! Validates that capabilities cannot leak or gain rights as they move
//! between cap groups, and that revocation leaves nothing behind.

use core_types::{CapRights, CapabilityEvent, ObjectType};
use kernel_api::{errno, KernelError, SyscallArgs, SyscallNumber};
use sim_kernel::pmo::Pmo;
use sim_kernel::test_utils::{map_scratch, spawn_process, ROOT_CPU};
use sim_kernel::thread::ExitState;
use sim_kernel::SyscallOutcome;
use tests_resilience::{expect_cap, test_bootstrap};

/// Test: A read-only copy cannot be used for writing
///
/// Process A creates a PMO and hands a copy to process B with WRITE masked
/// off. B may read through its slot but not write.
#[test]
fn test_read_only_delegation() {
    let kernel = test_bootstrap(1);
    let a = kernel.current_cap_group(ROOT_CPU).unwrap();
    let b = spawn_process(&kernel, ROOT_CPU, "b");

    let pmo_cap = kernel.sys_create_pmo(ROOT_CPU, 4096).unwrap();
    let in_b = kernel
        .cap_copy(&a, &b.cap_group, pmo_cap, CapRights::WRITE, CapRights::NONE)
        .unwrap();

    let write = kernel.obj_get_with_rights::<Pmo>(&b.cap_group, in_b, CapRights::WRITE);
    let err = write.err().unwrap();
    assert_eq!(err, KernelError::InvalidCapability);
    assert_eq!(err.errno(), -errno::ECAPBILITY);

    let read = kernel.obj_get_with_rights::<Pmo>(&b.cap_group, in_b, CapRights::READ);
    assert!(read.is_ok());
}

/// Test: Derived rights never exceed the source
///
/// Every mask/rest combination yields a subset of the source rights plus
/// at most what `rest` grants inside `mask`.
#[test]
fn test_copy_never_widens_rights() {
    let kernel = test_bootstrap(1);
    let root = kernel.current_cap_group(ROOT_CPU).unwrap();
    let pmo_cap = kernel.sys_create_pmo(ROOT_CPU, 4096).unwrap();
    let narrowed = kernel
        .cap_copy(&root, &root, pmo_cap, CapRights::WRITE, CapRights::NONE)
        .unwrap();
    let source = root.slot(narrowed).unwrap().rights;

    let samples = [
        CapRights::NONE,
        CapRights::READ,
        CapRights::WRITE,
        CapRights::RW,
        CapRights::COPY,
        CapRights::ALL,
    ];
    for mask in samples {
        for rest in samples {
            let Ok(cap) = kernel.cap_copy(&root, &root, narrowed, mask, rest) else {
                continue;
            };
            let derived = root.slot(cap).unwrap().rights;
            let allowed = source.difference(mask) | (rest & mask);
            assert!(
                allowed.contains(derived),
                "mask {:?} rest {:?} gave {:?}",
                mask,
                rest,
                derived
            );
            kernel.cap_free(&root, cap).unwrap();
        }
    }
}

/// Test: Revoking all copies leaves no live slot anywhere
#[test]
fn test_revoke_all_reaches_every_holder() {
    let kernel = test_bootstrap(1);
    let root = kernel.current_cap_group(ROOT_CPU).unwrap();
    let b = spawn_process(&kernel, ROOT_CPU, "b");
    let c = spawn_process(&kernel, ROOT_CPU, "c");

    let pmo_cap = kernel.sys_create_pmo(ROOT_CPU, 4096).unwrap();
    let object = root.slot(pmo_cap).unwrap().object;
    let in_b = kernel
        .cap_copy(&root, &b.cap_group, pmo_cap, CapRights::NONE, CapRights::NONE)
        .unwrap();
    let in_c = kernel
        .cap_copy(&b.cap_group, &c.cap_group, in_b, CapRights::NONE, CapRights::NONE)
        .unwrap();
    assert_eq!(object.refcount(), 3);
    assert_eq!(object.copy_count(), 3);

    kernel.sys_revoke_cap(ROOT_CPU, pmo_cap, true).unwrap();

    assert!(root.slot(pmo_cap).is_none());
    assert!(b.cap_group.slot(in_b).is_none());
    assert!(c.cap_group.slot(in_c).is_none());
    assert_eq!(object.refcount(), 0);
    assert_eq!(object.copy_count(), 0);
    assert!(object.is_deinitialized());

    let audit = kernel.capability_audit();
    let deinits = audit.count_events(|e| {
        matches!(
            e,
            CapabilityEvent::Deinitialized {
                object_type: ObjectType::Pmo,
                ..
            }
        ) && e.object() == object.id()
    });
    assert_eq!(deinits, 1);
}

/// Test: Refcount equals slots plus outstanding holds
#[test]
fn test_refcount_tracks_slots_and_holds() {
    let kernel = test_bootstrap(1);
    let root = kernel.current_cap_group(ROOT_CPU).unwrap();
    let b = spawn_process(&kernel, ROOT_CPU, "b");
    let pmo_cap = kernel.sys_create_pmo(ROOT_CPU, 4096).unwrap();
    let object = root.slot(pmo_cap).unwrap().object;
    kernel
        .cap_copy(&root, &b.cap_group, pmo_cap, CapRights::NONE, CapRights::NONE)
        .unwrap();

    {
        let _hold = kernel.obj_get::<Pmo>(&root, pmo_cap).unwrap();
        assert_eq!(object.refcount(), object.copy_count() + 1);
    }
    assert_eq!(object.refcount(), object.copy_count());

    kernel.cap_free(&root, pmo_cap).unwrap();
    assert_eq!(object.refcount(), 1);
    assert!(!object.is_deinitialized());
}

/// Test: Tearing down a killed group releases the slots it held
///
/// Revoking every cap to the group, its own included, deinitializes it.
#[test]
fn test_killed_group_releases_slots() {
    let kernel = test_bootstrap(1);
    let root = kernel.current_cap_group(ROOT_CPU).unwrap();
    let child = spawn_process(&kernel, ROOT_CPU, "child");
    let pmo_cap = kernel.sys_create_pmo(ROOT_CPU, 4096).unwrap();
    let object = root.slot(pmo_cap).unwrap().object;
    kernel
        .cap_copy(&root, &child.cap_group, pmo_cap, CapRights::NONE, CapRights::NONE)
        .unwrap();
    assert_eq!(object.copy_count(), 2);

    let group_object = child.cap_group.object().clone();

    assert_eq!(
        kernel.sys_kill_group(ROOT_CPU, child.group_cap),
        Ok(SyscallOutcome::Return(0))
    );
    kernel.sys_revoke_cap(ROOT_CPU, child.group_cap, true).unwrap();

    assert!(group_object.is_deinitialized());
    assert_eq!(child.cap_group.slot_count(), 0);
    assert_ne!(child.main_thread.exit_state(), ExitState::Running);
    assert_eq!(object.copy_count(), 1);
    assert_eq!(object.refcount(), 1);
}

/// Test: Transfer through the syscall gate reports per-entry results
#[test]
fn test_transfer_caps_via_gate() {
    let kernel = test_bootstrap(1);
    let child = spawn_process(&kernel, ROOT_CPU, "child");
    let buf = map_scratch(&kernel, ROOT_CPU, 4096);

    let SyscallOutcome::Return(raw) =
        kernel.syscall(ROOT_CPU, &SyscallArgs::new(SyscallNumber::CreatePmo, &[4096]))
    else {
        panic!("create_pmo switched");
    };
    let pmo_cap = expect_cap(raw);
    kernel
        .copy_to_user(ROOT_CPU, buf, &pmo_cap.as_raw().to_le_bytes())
        .unwrap();

    let frame = SyscallArgs::new(
        SyscallNumber::TransferCaps,
        &[child.group_cap.as_raw() as u64, buf, 1, buf + 8],
    );
    assert_eq!(kernel.syscall(ROOT_CPU, &frame), SyscallOutcome::Return(0));

    let out = kernel.copy_from_user(ROOT_CPU, buf + 8, 8).unwrap();
    let in_child = expect_cap(i64::from_le_bytes(out.try_into().unwrap()));
    assert!(kernel
        .obj_get_with_rights::<Pmo>(&child.cap_group, in_child, CapRights::RW)
        .is_ok());
}
