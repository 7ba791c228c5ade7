//! Test utilities
//!
//! Helpers for driving the simulated kernel from unit and integration
//! tests. They stand in for user code: they issue syscalls on behalf of
//! whatever thread is current on a CPU and panic on any unexpected error.

use crate::cap_group::{CapGroup, CAP_GROUP_OBJ_ID};
use crate::object::{Handle, Object};
use crate::syscall_gate::SyscallOutcome;
use crate::thread::{Thread, ThreadRef};
use crate::vmspace::VmPerm;
use crate::Kernel;
use core_types::{CapId, CapRights, CpuId};
use ipc::{IpcMsg, IpcVmConfig, IPC_MSG_DEFAULT_DATA_OFFSET, IPC_MSG_HEADER_LEN};
use kernel_api::{CapGroupArgs, KernelConfig, ThreadArgs, ThreadType};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// CPU the root thread starts on
pub const ROOT_CPU: CpuId = CpuId(0);

/// Base of the scratch mappings made by [`map_scratch`]
const SCRATCH_BASE: u64 = 0x4000_0000;
const SCRATCH_STRIDE: u64 = 0x0100_0000;

static NEXT_PID: AtomicU64 = AtomicU64::new(100);

/// Boots a kernel with the default configuration on `cpus` CPUs
pub fn boot_kernel(cpus: usize) -> Kernel {
    let mut config = KernelConfig::default();
    config.cpu_count = cpus;
    boot_with(config)
}

pub fn boot_with(config: KernelConfig) -> Kernel {
    match Kernel::new(config) {
        Ok(kernel) => kernel,
        Err(err) => panic!("boot failed: {}", err),
    }
}

/// Makes `thread` current on `cpu`, as if it had just been scheduled
pub fn run_on(kernel: &Kernel, cpu: CpuId, thread: &ThreadRef) {
    if let Err(err) = kernel.run_thread(cpu, thread) {
        panic!("cannot run {} on {}: {}", thread.id(), cpu, err);
    }
}

/// Arguments for a user thread in the cap group behind `group_cap`
///
/// Cap 0 is the caller's own cap group.
pub fn user_thread_args(group_cap: u64, pc: u64, prio: u32) -> ThreadArgs {
    ThreadArgs {
        cap_group_cap: group_cap,
        stack: 0x7fff_f000,
        pc,
        arg: 0,
        tls: 0,
        prio,
        thread_type: ThreadType::User as u32,
        clear_child_tid: 0,
    }
}

/// Slot of `object` in `group`, if the group holds one
pub fn cap_of(group: &Handle<CapGroup>, object: &Arc<Object>) -> Option<CapId> {
    group
        .slot_table
        .read()
        .iter()
        .find(|slot| Arc::ptr_eq(&slot.object, object))
        .map(|slot| slot.slot_id)
}

fn thread_behind(kernel: &Kernel, cpu: CpuId, cap: CapId) -> ThreadRef {
    let group = kernel
        .current_cap_group(cpu)
        .unwrap_or_else(|err| panic!("no cap group on {}: {}", cpu, err));
    match kernel.lookup_cap::<Thread>(&group, cap, CapRights::NONE) {
        Ok((thread, _)) => thread,
        Err(err) => panic!("{} is not a thread: {}", cap, err),
    }
}

/// Creates a user thread in the current cap group of `cpu`
pub fn spawn_thread(kernel: &Kernel, cpu: CpuId, prio: u32) -> ThreadRef {
    let cap = kernel
        .sys_create_thread(cpu, &user_thread_args(0, 0x40_0000, prio))
        .unwrap_or_else(|err| panic!("create_thread failed: {}", err));
    thread_behind(kernel, cpu, cap)
}

/// Maps a fresh zeroed read/write region in the current cap group
///
/// Returns its base address.
pub fn map_scratch(kernel: &Kernel, cpu: CpuId, size: u64) -> u64 {
    let group = kernel
        .current_cap_group(cpu)
        .unwrap_or_else(|err| panic!("no cap group on {}: {}", cpu, err));
    let pmo = kernel
        .sys_create_pmo(cpu, size)
        .unwrap_or_else(|err| panic!("create_pmo failed: {}", err));
    let mut vaddr = SCRATCH_BASE;
    while group.vmspace().lookup(vaddr).is_some() {
        vaddr += SCRATCH_STRIDE;
    }
    if let Err(err) = kernel.sys_map_pmo(cpu, CAP_GROUP_OBJ_ID, pmo, vaddr, VmPerm::RW) {
        panic!("map_pmo at {:#x} failed: {}", vaddr, err);
    }
    vaddr
}

/// A child process created by [`spawn_process`]
pub struct SpawnedProcess {
    pub cap_group: Handle<CapGroup>,
    /// The creator's cap to the cap group
    pub group_cap: CapId,
    /// Ready user thread of the new group
    pub main_thread: ThreadRef,
    /// The creator's cap to the main thread
    pub main_thread_cap: CapId,
}

/// Creates a cap group named `name` with one ready user thread
pub fn spawn_process(kernel: &Kernel, cpu: CpuId, name: &str) -> SpawnedProcess {
    let name_addr = map_scratch(kernel, cpu, 4096);
    if let Err(err) = kernel.copy_to_user(cpu, name_addr, name.as_bytes()) {
        panic!("writing process name failed: {}", err);
    }
    let args = CapGroupArgs {
        pid: NEXT_PID.fetch_add(1, Ordering::Relaxed),
        name: name_addr,
        name_len: name.len() as u64,
    };
    let group_cap = kernel
        .sys_create_cap_group(cpu, &args)
        .unwrap_or_else(|err| panic!("create_cap_group failed: {}", err));
    let parent = kernel
        .current_cap_group(cpu)
        .unwrap_or_else(|err| panic!("no cap group on {}: {}", cpu, err));
    let cap_group = match kernel.lookup_cap::<CapGroup>(&parent, group_cap, CapRights::NONE) {
        Ok((group, _)) => group,
        Err(err) => panic!("{} is not a cap group: {}", group_cap, err),
    };

    let prio = kernel.config().default_prio;
    let main_thread_cap = kernel
        .sys_create_thread(cpu, &user_thread_args(group_cap.as_raw() as u64, 0x40_0000, prio))
        .unwrap_or_else(|err| panic!("create_thread failed: {}", err));
    let main_thread = thread_behind(kernel, cpu, main_thread_cap);
    SpawnedProcess {
        cap_group,
        group_cap,
        main_thread,
        main_thread_cap,
    }
}

/// Writes a message header plus `payload` at the start of a shared region
pub fn write_request(group: &Handle<CapGroup>, vaddr: u64, payload: &[u8]) {
    let mut region = vec![0u8; IPC_MSG_DEFAULT_DATA_OFFSET as usize + payload.len()];
    if let Err(err) = IpcMsg::default().write(&mut region, payload) {
        panic!("cannot encode message: {}", err);
    }
    if let Err(err) = group.vmspace().write(vaddr, &region) {
        panic!("cannot write message at {:#x}: {}", vaddr, err);
    }
}

/// Reads the payload of the message at the start of a shared region
pub fn read_reply(group: &Handle<CapGroup>, vaddr: u64) -> Vec<u8> {
    let mut header = [0u8; IPC_MSG_HEADER_LEN];
    if let Err(err) = group.vmspace().read(vaddr, &mut header) {
        panic!("cannot read message at {:#x}: {}", vaddr, err);
    }
    let msg = match IpcMsg::from_bytes(&header) {
        Ok(msg) => msg,
        Err(err) => panic!("bad message header: {}", err),
    };
    let mut payload = vec![0u8; msg.data_len as usize];
    if let Err(err) = group
        .vmspace()
        .read(vaddr + u64::from(msg.data_offset), &mut payload)
    {
        panic!("cannot read payload: {}", err);
    }
    payload
}

pub const SERVER_ROUTINE: u64 = 0x50_1000;
pub const REGISTER_CB_ENTRY: u64 = 0x50_2000;
pub const EXIT_ROUTINE: u64 = 0x50_3000;
pub const DESTRUCTOR: u64 = 0x50_4000;
pub const HANDLER_ENTRY: u64 = 0x50_5000;
pub const CLIENT_SHM: u64 = 0x6000_0000;
pub const SERVER_SHM: u64 = 0x6800_0000;
pub const SHM_SIZE: u64 = 4096;

/// A server and a client joined by one connection
pub struct IpcFixture {
    pub server: SpawnedProcess,
    pub client: SpawnedProcess,
    pub register_cb: ThreadRef,
    pub handler: ThreadRef,
    /// The client's cap to the server's main thread
    pub server_cap_in_client: CapId,
    /// The client's connection cap
    pub conn_cap: CapId,
    pub client_shm: u64,
    pub server_shm: u64,
    pub shm_size: u64,
}

fn create_ipc_thread(
    kernel: &Kernel,
    process: &SpawnedProcess,
    thread_type: ThreadType,
    pc: u64,
) -> ThreadRef {
    let args = ThreadArgs {
        thread_type: thread_type as u32,
        ..user_thread_args(process.group_cap.as_raw() as u64, pc, 0)
    };
    let cap = kernel
        .sys_create_thread(ROOT_CPU, &args)
        .unwrap_or_else(|err| panic!("create {:?} thread failed: {}", thread_type, err));
    thread_behind(kernel, ROOT_CPU, cap)
}

/// Builds an [`IpcFixture`] on [`ROOT_CPU`]
///
/// Must be called while the root thread is current. Leaves the client's
/// main thread running with its connection cap in hand.
pub fn ipc_round_trip_setup(kernel: &Kernel) -> IpcFixture {
    let server = spawn_process(kernel, ROOT_CPU, "server");
    let client = spawn_process(kernel, ROOT_CPU, "client");
    let register_cb = create_ipc_thread(kernel, &server, ThreadType::Register, REGISTER_CB_ENTRY);
    let handler = create_ipc_thread(kernel, &server, ThreadType::Shadow, HANDLER_ENTRY);
    let root_group = kernel
        .current_cap_group(ROOT_CPU)
        .unwrap_or_else(|err| panic!("no root cap group: {}", err));
    let server_cap_in_client = kernel
        .cap_copy(
            &root_group,
            &client.cap_group,
            server.main_thread_cap,
            CapRights::NONE,
            CapRights::NONE,
        )
        .unwrap_or_else(|err| panic!("cannot hand the server to the client: {}", err));

    run_on(kernel, ROOT_CPU, &server.main_thread);
    let cb_cap = cap_of(&server.cap_group, register_cb.object())
        .unwrap_or_else(|| panic!("server holds no cap to its register callback"));
    if let Err(err) = kernel.sys_register_server(ROOT_CPU, SERVER_ROUTINE, cb_cap, DESTRUCTOR) {
        panic!("register_server failed: {}", err);
    }

    run_on(kernel, ROOT_CPU, &client.main_thread);
    let vm_config = IpcVmConfig {
        client_shm_uaddr: CLIENT_SHM,
        shm_size: SHM_SIZE,
    };
    match kernel.sys_register_client(ROOT_CPU, server_cap_in_client, &vm_config) {
        Ok(SyscallOutcome::Switch(id)) if id == register_cb.id() => {}
        other => panic!("register_client did not reach the callback: {:?}", other),
    }

    let handler_cap = cap_of(&server.cap_group, handler.object())
        .unwrap_or_else(|| panic!("server holds no cap to its handler"));
    match kernel.sys_ipc_register_cb_return(ROOT_CPU, handler_cap, EXIT_ROUTINE, SERVER_SHM) {
        Ok(SyscallOutcome::Switch(id)) if id == client.main_thread.id() => {}
        other => panic!("register callback did not return to the client: {:?}", other),
    }
    let conn_cap = CapId::from_raw(client.main_thread.ret())
        .unwrap_or_else(|| panic!("client got {} instead of a cap", client.main_thread.ret()));

    IpcFixture {
        server,
        client,
        register_cb,
        handler,
        server_cap_in_client,
        conn_cap,
        client_shm: CLIENT_SHM,
        server_shm: SERVER_SHM,
        shm_size: SHM_SIZE,
    }
}

/// Advances time until `cpu` idles; returns the ticks spent
///
/// Gives up after `max_ticks`.
pub fn advance_until_idle(kernel: &Kernel, cpu: CpuId, max_ticks: u64) -> u64 {
    let mut ticks = 0;
    while ticks < max_ticks && !kernel.is_idle(cpu).unwrap_or(true) {
        kernel.advance_ticks(1);
        ticks += 1;
    }
    ticks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_kernel_runs_root() {
        let kernel = boot_kernel(2);
        assert_eq!(kernel.config().cpu_count, 2);
        let root = kernel.current_thread(ROOT_CPU).unwrap();
        assert_eq!(root.thread_type(), ThreadType::Root);
    }

    #[test]
    fn test_map_scratch_picks_free_addresses() {
        let kernel = boot_kernel(1);
        let a = map_scratch(&kernel, ROOT_CPU, 4096);
        let b = map_scratch(&kernel, ROOT_CPU, 4096);
        assert_ne!(a, b);
        kernel.copy_to_user(ROOT_CPU, b, b"xy").unwrap();
        assert_eq!(kernel.copy_from_user(ROOT_CPU, b, 2).unwrap(), b"xy");
    }

    #[test]
    fn test_spawn_process_names_group() {
        let kernel = boot_kernel(1);
        let child = spawn_process(&kernel, ROOT_CPU, "init");
        assert_eq!(child.cap_group.name(), "init");
        assert_eq!(child.cap_group.thread_count(), 1);
        assert!(cap_of(&child.cap_group, child.main_thread.object()).is_some());
    }

    #[test]
    fn test_message_helpers() {
        let kernel = boot_kernel(1);
        let base = map_scratch(&kernel, ROOT_CPU, 4096);
        let group = kernel.current_cap_group(ROOT_CPU).unwrap();
        write_request(&group, base, b"ping");
        assert_eq!(read_reply(&group, base), b"ping");
    }

    #[test]
    fn test_advance_until_idle_stops_when_idle() {
        let kernel = boot_kernel(1);
        kernel.sys_thread_exit(ROOT_CPU).unwrap();
        assert_eq!(advance_until_idle(&kernel, ROOT_CPU, 10), 0);
    }
}
