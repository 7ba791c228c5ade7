//! Synchronous IPC connections
//!
//! A connection joins one client cap group to one server handler thread
//! through a shared memory region. Calls and returns never touch the ready
//! queues: the caller blocks, donates its scheduling context and the CPU
//! goes straight to the other side.
//!
//! ## Locks
//!
//! - `ownership` (per connection) is held by the client for the whole call,
//!   from `ipc_call` until the matching `ipc_return`
//! - `ipc_lock` (per handler thread) is held while the handler serves a
//!   call, so one handler never runs two calls at once
//! - `register_lock` (per register callback thread) serializes client
//!   registrations
//!
//! All three are released by a different syscall than the one that took
//! them, so they are [`HandoffLock`]s rather than guard-based mutexes.
//! Every acquisition is a `try_lock`; contention surfaces as `TryAgain`.
//!
//! ## Recycling
//!
//! `Valid -> IncomeStopped -> RecycleReady -> DeinitReady`, never backwards.
//! Calls are only admitted in `Valid`.

use crate::cap_group::CapGroup;
use crate::object::{Handle, Object, ObjectKind};
use crate::pmo::Pmo;
use crate::scheduler::SchedTrigger;
use crate::syscall_gate::SyscallOutcome;
use crate::thread::{ExitState, Thread, ThreadRef, ThreadState};
use crate::vmspace::VmPerm;
use crate::Kernel;
use core_types::{Badge, CapId, CapRights, CpuId};
use ipc::{CapTransfer, IpcMsg, IpcVmConfig, CONN_IPC_SERVER, MAX_CAP_TRANSFER};
use kernel_api::{KernelError, KernelResult, ThreadType};
use log::{debug, trace, warn};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

/// Recycling state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ConnState {
    Valid = 0,
    /// No new calls; an in-flight call may still finish
    IncomeStopped = 1,
    /// Shared memory and caps may be reclaimed
    RecycleReady = 2,
    /// The object may be freed
    DeinitReady = 3,
}

impl ConnState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnState::Valid,
            1 => ConnState::IncomeStopped,
            2 => ConnState::RecycleReady,
            _ => ConnState::DeinitReady,
        }
    }
}

/// A lock taken in one syscall and released in another
#[derive(Debug, Default)]
pub struct HandoffLock {
    locked: AtomicBool,
}

impl HandoffLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn unlock(&self) {
        if !self.locked.swap(false, Ordering::Release) {
            panic!("BUG: unlocking a free handoff lock");
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct ConnInner {
    current_client: Option<ThreadRef>,
    server_handler: Option<ThreadRef>,
    server_shm_uaddr: Option<u64>,
    shm_cap_in_client: Option<CapId>,
    shm_cap_in_server: Option<CapId>,
    conn_cap_in_client: Option<CapId>,
    conn_cap_in_server: Option<CapId>,
    client_cap_buf: [CapTransfer; MAX_CAP_TRANSFER],
    server_cap_buf: [CapTransfer; MAX_CAP_TRANSFER],
    /// Slots the server handed back on the last return
    client_received: [Option<CapId>; MAX_CAP_TRANSFER],
    /// Slots the client sent on the current call
    server_received: [Option<CapId>; MAX_CAP_TRANSFER],
}

pub struct Connection {
    client_badge: Badge,
    client_pid: u64,
    client_group: Weak<Object>,
    server_group: Weak<Object>,
    shm: Handle<Pmo>,
    client_shm_uaddr: u64,
    state: AtomicU8,
    ownership: HandoffLock,
    inner: spin::Mutex<ConnInner>,
}

impl Connection {
    fn new(
        client: &Handle<CapGroup>,
        server: &Handle<CapGroup>,
        shm: Handle<Pmo>,
        client_shm_uaddr: u64,
    ) -> Self {
        Self {
            client_badge: client.badge(),
            client_pid: client.pid(),
            client_group: Arc::downgrade(client.object()),
            server_group: Arc::downgrade(server.object()),
            shm,
            client_shm_uaddr,
            state: AtomicU8::new(ConnState::IncomeStopped as u8),
            ownership: HandoffLock::new(),
            inner: spin::Mutex::new(ConnInner::default()),
        }
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves the state forward; earlier states are ignored
    fn advance(&self, state: ConnState) {
        self.state.fetch_max(state as u8, Ordering::AcqRel);
    }

    /// Opens a freshly accepted connection unless it was stopped meanwhile
    fn admit(&self) -> bool {
        self.state
            .compare_exchange(
                ConnState::IncomeStopped as u8,
                ConnState::Valid as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn client_badge(&self) -> Badge {
        self.client_badge
    }

    pub fn client_pid(&self) -> u64 {
        self.client_pid
    }

    pub fn shm_size(&self) -> u64 {
        self.shm.size() as u64
    }

    pub fn client_shm_uaddr(&self) -> u64 {
        self.client_shm_uaddr
    }

    pub fn server_shm_uaddr(&self) -> Option<u64> {
        self.inner.lock().server_shm_uaddr
    }

    pub fn server_handler(&self) -> Option<ThreadRef> {
        self.inner.lock().server_handler.clone()
    }

    /// The client blocked in a call or registration, if any
    pub fn current_client(&self) -> Option<ThreadRef> {
        self.inner.lock().current_client.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.ownership.is_locked()
    }

    pub(crate) fn deinit(&self) {
        self.advance(ConnState::DeinitReady);
        *self.inner.lock() = ConnInner::default();
    }
}

fn group_of(weak: &Weak<Object>) -> Option<Handle<CapGroup>> {
    weak.upgrade().and_then(Handle::new)
}

/// Published server thread
pub(crate) struct ServerConfig {
    register_cb: ThreadRef,
    routine_entry: u64,
}

/// Caps of the registration being processed by a register callback
#[derive(Debug, Clone, Copy)]
struct PendingClient {
    conn_cap_in_client: CapId,
    conn_cap_in_server: CapId,
    shm_cap_in_server: CapId,
}

pub(crate) struct RegisterCbConfig {
    register_lock: HandoffLock,
    entry: u64,
    stack: u64,
    destructor: u64,
    pending: spin::Mutex<Option<PendingClient>>,
}

pub(crate) struct HandlerConfig {
    ipc_lock: HandoffLock,
    routine_entry: u64,
    routine_stack: u64,
    exit_routine_entry: u64,
    destructor: u64,
    active_conn: spin::Mutex<Option<Handle<Connection>>>,
}

#[derive(Clone)]
enum IpcRole {
    Server(Arc<ServerConfig>),
    RegisterCb(Arc<RegisterCbConfig>),
    Handler(Arc<HandlerConfig>),
}

/// IPC role of a thread; a thread takes at most one role, once
#[derive(Default)]
pub struct IpcThreadConfig {
    role: spin::Mutex<Option<IpcRole>>,
}

impl IpcThreadConfig {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn install(&self, role: IpcRole) -> bool {
        let mut slot = self.role.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(role);
        true
    }

    pub(crate) fn server(&self) -> Option<Arc<ServerConfig>> {
        match &*self.role.lock() {
            Some(IpcRole::Server(config)) => Some(Arc::clone(config)),
            _ => None,
        }
    }

    pub(crate) fn register_cb(&self) -> Option<Arc<RegisterCbConfig>> {
        match &*self.role.lock() {
            Some(IpcRole::RegisterCb(config)) => Some(Arc::clone(config)),
            _ => None,
        }
    }

    pub(crate) fn handler(&self) -> Option<Arc<HandlerConfig>> {
        match &*self.role.lock() {
            Some(IpcRole::Handler(config)) => Some(Arc::clone(config)),
            _ => None,
        }
    }

    pub fn is_server(&self) -> bool {
        self.server().is_some()
    }

    pub fn is_handler(&self) -> bool {
        self.handler().is_some()
    }

    /// Exit routine entry and destructor of a handler thread
    pub fn handler_exit_hooks(&self) -> Option<(u64, u64)> {
        self.handler()
            .map(|config| (config.exit_routine_entry, config.destructor))
    }

    /// Drops the role and whatever it references
    pub(crate) fn clear(&self) {
        self.role.lock().take();
    }
}

/// Which end of a connection a cap buffer operation works on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Server,
}

impl Kernel {
    /// Publishes the calling thread as an IPC server
    ///
    /// `register_cb_cap` names a register-type thread of the caller's cap
    /// group; it runs once per client registration.
    pub fn sys_register_server(
        &self,
        cpu: CpuId,
        ipc_routine: u64,
        register_cb_cap: CapId,
        destructor: u64,
    ) -> KernelResult<()> {
        let server = self.current_thread(cpu)?;
        let group = self.current_cap_group(cpu)?;
        if server.ipc.server().is_some() {
            return Err(KernelError::InvalidArgument);
        }
        let cb = self.obj_get::<Thread>(&group, register_cb_cap)?;
        if cb.thread_type() != ThreadType::Register
            || !cb.cap_group().is_some_and(|g| g.ptr_eq(&group))
        {
            return Err(KernelError::InvalidArgument);
        }

        let regs = cb.regs();
        let cb_config = Arc::new(RegisterCbConfig {
            register_lock: HandoffLock::new(),
            entry: regs.pc,
            stack: regs.sp,
            destructor,
            pending: spin::Mutex::new(None),
        });
        if !cb.ipc.install(IpcRole::RegisterCb(cb_config)) {
            return Err(KernelError::InvalidArgument);
        }
        let installed = server.ipc.install(IpcRole::Server(Arc::new(ServerConfig {
            register_cb: cb.handle().clone(),
            routine_entry: ipc_routine,
        })));
        if !installed {
            cb.ipc.clear();
            return Err(KernelError::InvalidArgument);
        }
        debug!(
            "register_server: {} in {} (cb {})",
            server.id(),
            group.badge(),
            cb.id()
        );
        Ok(())
    }

    /// Opens a connection to the server thread behind `server_cap`
    ///
    /// The caller blocks while the server's register callback accepts the
    /// connection; the connection cap arrives in its return register.
    pub fn sys_register_client(
        &self,
        cpu: CpuId,
        server_cap: CapId,
        vm_config: &IpcVmConfig,
    ) -> KernelResult<SyscallOutcome> {
        let client = self.current_thread(cpu)?;
        let group = self.current_cap_group(cpu)?;
        if vm_config.shm_size == 0 || vm_config.shm_size > crate::pmo::PMO_MAX_SIZE as u64 {
            return Err(KernelError::InvalidArgument);
        }
        let server = self.obj_get::<Thread>(&group, server_cap)?;
        let Some(server_config) = server.ipc.server() else {
            return Err(KernelError::TryAgain);
        };
        let server_group = server.cap_group().ok_or(KernelError::PeerExiting)?;
        let cb = server_config.register_cb.clone();
        let cb_config = cb.ipc.register_cb().ok_or(KernelError::InvalidArgument)?;
        if !cb_config.register_lock.try_lock() {
            return Err(KernelError::TryAgain);
        }

        let setup = self.setup_connection(&group, &server_group, vm_config);
        let (conn, pending) = match setup {
            Ok(done) => done,
            Err(err) => {
                cb_config.register_lock.unlock();
                return Err(err);
            }
        };
        conn.inner.lock().current_client = Some(client.clone());
        *cb_config.pending.lock() = Some(pending);

        client.set_state(ThreadState::Blocking);
        cb.with_regs(|regs| {
            regs.pc = cb_config.entry;
            regs.sp = cb_config.stack;
            regs.args = [
                pending.shm_cap_in_server.as_raw() as u64,
                vm_config.shm_size,
                conn.client_badge.as_raw(),
                conn.client_pid,
            ];
        });
        cb.set_sched_context(client.sched_context());
        debug!(
            "register_client: {} -> server {} (entry {:#x})",
            group.badge(),
            server.id(),
            server_config.routine_entry
        );
        Ok(self.handoff_to(cpu, &cb))
    }

    /// Allocates the shared memory and the connection, with caps in both groups
    fn setup_connection(
        &self,
        client: &Handle<CapGroup>,
        server: &Handle<CapGroup>,
        vm_config: &IpcVmConfig,
    ) -> KernelResult<(Handle<Connection>, PendingClient)> {
        let pmo = self.obj_alloc(ObjectKind::Pmo(Pmo::new(vm_config.shm_size as usize)));
        let shm = Handle::<Pmo>::new(Arc::clone(&pmo)).ok_or(KernelError::InvalidArgument)?;
        let shm_cap_in_client = self.cap_alloc(client, &pmo)?;
        let mut undo = Rollback::new(self);
        undo.free(client, shm_cap_in_client);

        if let Err(err) = client
            .vmspace()
            .map(vm_config.client_shm_uaddr, shm.clone(), VmPerm::RW)
        {
            undo.run();
            return Err(err);
        }
        undo.unmap(client, vm_config.client_shm_uaddr);

        let object = self.obj_alloc(ObjectKind::Connection(Connection::new(
            client,
            server,
            shm,
            vm_config.client_shm_uaddr,
        )));
        let conn = Handle::<Connection>::new(Arc::clone(&object)).ok_or(KernelError::InvalidArgument)?;

        let caps = (|| -> KernelResult<PendingClient> {
            let shm_cap_in_server =
                self.cap_copy(client, server, shm_cap_in_client, CapRights::NONE, CapRights::NONE)?;
            undo.free(server, shm_cap_in_server);
            let conn_cap_in_client = self.cap_alloc(client, &object)?;
            undo.free(client, conn_cap_in_client);
            let conn_cap_in_server =
                self.cap_copy(client, server, conn_cap_in_client, CapRights::NONE, CapRights::NONE)?;
            Ok(PendingClient {
                conn_cap_in_client,
                conn_cap_in_server,
                shm_cap_in_server,
            })
        })();
        match caps {
            Ok(pending) => {
                let mut inner = conn.inner.lock();
                inner.shm_cap_in_client = Some(shm_cap_in_client);
                inner.shm_cap_in_server = Some(pending.shm_cap_in_server);
                inner.conn_cap_in_client = Some(pending.conn_cap_in_client);
                inner.conn_cap_in_server = Some(pending.conn_cap_in_server);
                drop(inner);
                Ok((conn, pending))
            }
            Err(err) => {
                undo.run();
                if object.refcount() == 0 {
                    self.obj_free(object);
                }
                Err(err)
            }
        }
    }

    /// Register callback accepts the pending client
    ///
    /// Binds `handler_cap` (a shadow thread of the server's cap group) as the
    /// connection's handler, maps the server side of the shared memory at
    /// `server_shm_addr` and hands the CPU back to the client.
    pub fn sys_ipc_register_cb_return(
        &self,
        cpu: CpuId,
        handler_cap: CapId,
        exit_routine: u64,
        server_shm_addr: u64,
    ) -> KernelResult<SyscallOutcome> {
        let cb = self.current_thread(cpu)?;
        let group = self.current_cap_group(cpu)?;
        let config = cb.ipc.register_cb().ok_or(KernelError::InvalidArgument)?;
        let pending = (*config.pending.lock()).ok_or(KernelError::InvalidArgument)?;
        let conn = self.obj_get::<Connection>(&group, pending.conn_cap_in_server)?;
        let handler = self.obj_get::<Thread>(&group, handler_cap)?;
        if handler.thread_type() != ThreadType::Shadow {
            return Err(KernelError::InvalidArgument);
        }
        let client = conn.current_client().ok_or(KernelError::InvalidArgument)?;

        let handler_config = match handler.ipc.handler() {
            Some(existing) => existing,
            None => {
                let regs = handler.regs();
                let fresh = Arc::new(HandlerConfig {
                    ipc_lock: HandoffLock::new(),
                    routine_entry: regs.pc,
                    routine_stack: regs.sp,
                    exit_routine_entry: exit_routine,
                    destructor: config.destructor,
                    active_conn: spin::Mutex::new(None),
                });
                if !handler.ipc.install(IpcRole::Handler(Arc::clone(&fresh))) {
                    return Err(KernelError::InvalidArgument);
                }
                fresh
            }
        };
        trace!(
            "register_cb_return: handler {} routine {:#x}",
            handler.id(),
            handler_config.routine_entry
        );

        let shm = self.obj_get_with_rights::<Pmo>(&group, pending.shm_cap_in_server, CapRights::RW)?;
        if !shm.ptr_eq(&conn.shm) {
            return Err(KernelError::InvalidCapability);
        }
        group
            .vmspace()
            .map(server_shm_addr, shm.handle().clone(), VmPerm::RW)?;

        {
            let mut inner = conn.inner.lock();
            inner.server_handler = Some(handler.handle().clone());
            inner.server_shm_uaddr = Some(server_shm_addr);
            inner.current_client = None;
        }
        if !conn.admit() {
            debug!("register_cb_return: {} stopped before accept", conn.id());
        }
        client.set_ret(pending.conn_cap_in_client.as_raw());

        config.pending.lock().take();
        cb.set_state(ThreadState::Waiting);
        cb.set_sched_context(None);
        config.register_lock.unlock();
        debug!(
            "register_cb_return: connection {} for {} served by {}",
            conn.id(),
            conn.client_badge,
            handler.id()
        );
        Ok(self.handoff_to(cpu, &client))
    }

    /// Outcome for a caller that found a connection owned by someone else
    fn ownership_busy(&self, cpu: CpuId) -> KernelResult<SyscallOutcome> {
        let current = self.current_thread(cpu)?;
        if !current.is_exiting() {
            return Err(KernelError::TryAgain);
        }
        if current.thread_type() == ThreadType::Shadow {
            return Err(KernelError::PeerExiting);
        }
        Ok(self.switch_outcome(cpu, SchedTrigger::Exit))
    }

    /// Calls the server over `conn_cap`
    ///
    /// Sends the message in the shared memory plus the first `cap_num`
    /// entries of the client cap buffer. The caller blocks until the handler
    /// returns.
    pub fn sys_ipc_call(&self, cpu: CpuId, conn_cap: CapId, cap_num: u32) -> KernelResult<SyscallOutcome> {
        let cap_num = cap_num as usize;
        if cap_num > MAX_CAP_TRANSFER {
            return Err(KernelError::InvalidArgument);
        }
        let client = self.current_thread(cpu)?;
        let group = self.current_cap_group(cpu)?;
        let conn = self.obj_get::<Connection>(&group, conn_cap)?;
        if !conn.ownership.try_lock() {
            return self.ownership_busy(cpu);
        }

        match self.admit_call(&conn, &group, &client, cap_num) {
            Ok((handler, config, data_len, sent)) => {
                let server_shm = conn.server_shm_uaddr().unwrap_or(0);
                client.set_state(ThreadState::Blocking);
                handler.set_sched_context(client.sched_context());
                handler.with_regs(|regs| {
                    regs.pc = config.routine_entry;
                    regs.sp = config.routine_stack;
                    regs.args = [server_shm, u64::from(data_len), sent as u64, conn.client_badge.as_raw()];
                });
                trace!(
                    "ipc_call: {} -> {} ({} bytes, {} caps)",
                    client.id(),
                    handler.id(),
                    data_len,
                    sent
                );
                Ok(self.handoff_to(cpu, &handler))
            }
            Err(err) => {
                conn.ownership.unlock();
                Err(err)
            }
        }
    }

    /// Checks the connection and handler, moves the caps and claims the handler
    ///
    /// On error nothing is left locked except the caller's `ownership`.
    fn admit_call(
        &self,
        conn: &Handle<Connection>,
        group: &Handle<CapGroup>,
        client: &ThreadRef,
        cap_num: usize,
    ) -> KernelResult<(ThreadRef, Arc<HandlerConfig>, u32, usize)> {
        if conn.state() != ConnState::Valid {
            return Err(KernelError::InvalidArgument);
        }
        let handler = conn.server_handler().ok_or(KernelError::InvalidArgument)?;
        if handler.exit_state() != ExitState::Running {
            conn.advance(ConnState::IncomeStopped);
            return Err(KernelError::PeerExiting);
        }
        let server_group = group_of(&conn.server_group).ok_or(KernelError::PeerExiting)?;
        let config = handler.ipc.handler().ok_or(KernelError::InvalidArgument)?;

        let data_len = conn
            .shm
            .with_bytes(|region| IpcMsg::from_bytes(region).and_then(|msg| msg.validate(region.len()).map(|_| msg)))
            .map_err(|err| {
                debug!("ipc_call: bad message in {}: {}", conn.id(), err);
                KernelError::InvalidArgument
            })?
            .data_len;

        if !config.ipc_lock.try_lock() {
            return Err(KernelError::TryAgain);
        }
        let entries = {
            let mut inner = conn.inner.lock();
            let entries: Vec<CapTransfer> = inner.client_cap_buf[..cap_num].to_vec();
            inner.client_cap_buf[..cap_num].fill(CapTransfer::EMPTY);
            entries
        };
        let received = match self.transfer_cap_buf(group, &server_group, &entries) {
            Ok(received) => received,
            Err(err) => {
                config.ipc_lock.unlock();
                return Err(err);
            }
        };

        {
            let mut inner = conn.inner.lock();
            inner.server_received = received;
            inner.server_cap_buf = [CapTransfer::EMPTY; MAX_CAP_TRANSFER];
            inner.current_client = Some(client.clone());
        }
        *config.active_conn.lock() = Some(conn.clone());
        Ok((handler, config, data_len, cap_num))
    }

    /// Copies every entry from `from` into `to`, all or nothing
    fn transfer_cap_buf(
        &self,
        from: &Handle<CapGroup>,
        to: &Handle<CapGroup>,
        entries: &[CapTransfer],
    ) -> KernelResult<[Option<CapId>; MAX_CAP_TRANSFER]> {
        let mut received = [None; MAX_CAP_TRANSFER];
        for (index, entry) in entries.iter().enumerate() {
            let copied = if entry.valid {
                self.cap_copy(from, to, entry.cap, entry.mask, entry.rest)
            } else {
                Err(KernelError::InvalidArgument)
            };
            match copied {
                Ok(cap) => received[index] = Some(cap),
                Err(err) => {
                    warn!(
                        "ipc cap transfer {} -> {} failed at entry {}: {}",
                        from.badge(),
                        to.badge(),
                        index,
                        err
                    );
                    for cap in received.iter().flatten() {
                        if let Err(free_err) = self.cap_free(to, *cap) {
                            panic!("BUG: rollback of {} in {} failed: {}", cap, to.badge(), free_err);
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(received)
    }

    /// Handler answers the call it is serving
    ///
    /// Sends the first `cap_num` entries of the server cap buffer back. A
    /// failed transfer is reported to the client instead of `ret`.
    pub fn sys_ipc_return(&self, cpu: CpuId, ret: i64, cap_num: u32) -> KernelResult<SyscallOutcome> {
        let handler = self.current_thread(cpu)?;
        let config = handler.ipc.handler().ok_or(KernelError::InvalidArgument)?;
        let conn = config
            .active_conn
            .lock()
            .clone()
            .ok_or(KernelError::InvalidArgument)?;
        let cap_num = cap_num as usize;
        if cap_num > MAX_CAP_TRANSFER {
            return Err(KernelError::InvalidArgument);
        }
        let client = conn.current_client().ok_or(KernelError::InvalidArgument)?;
        let mut ret = ret;

        if handler.is_exiting() {
            conn.advance(ConnState::IncomeStopped);
            handler.set_exit_state(ExitState::Exited);
            ret = KernelError::PeerExiting.errno();
        }

        if client.is_exiting() {
            conn.advance(ConnState::IncomeStopped);
            if client.thread_type() != ThreadType::Shadow {
                self.release_handler(&handler, &config, &conn);
                client.set_exit_state(ExitState::Exited);
                debug!("ipc_return: client {} exited during call", client.id());
                return Ok(self.switch_outcome(cpu, SchedTrigger::Block));
            }
        }

        if cap_num > 0 {
            let client_group = group_of(&conn.client_group);
            let server_group = group_of(&conn.server_group);
            let entries: Vec<CapTransfer> = conn.inner.lock().server_cap_buf[..cap_num].to_vec();
            let sent = match (&server_group, &client_group) {
                (Some(from), Some(to)) => self.transfer_cap_buf(from, to, &entries),
                _ => Err(KernelError::PeerExiting),
            };
            let mut inner = conn.inner.lock();
            match sent {
                Ok(received) => inner.client_received = received,
                Err(err) => {
                    inner.client_received = [None; MAX_CAP_TRANSFER];
                    ret = err.errno();
                }
            }
            inner.server_cap_buf[..cap_num].fill(CapTransfer::EMPTY);
        }

        self.release_handler(&handler, &config, &conn);
        client.set_ret(ret);
        trace!("ipc_return: {} -> {} ret {}", handler.id(), client.id(), ret);
        Ok(self.handoff_to(cpu, &client))
    }

    /// Ends the handler's part of a call and frees the connection
    fn release_handler(&self, handler: &ThreadRef, config: &HandlerConfig, conn: &Handle<Connection>) {
        config.active_conn.lock().take();
        conn.inner.lock().current_client = None;
        if handler.exit_state() == ExitState::Running {
            handler.set_state(ThreadState::Waiting);
        }
        handler.set_sched_context(None);
        config.ipc_lock.unlock();
        conn.ownership.unlock();
    }

    /// Handler finished its exit routine
    pub fn sys_ipc_exit_routine_return(&self, cpu: CpuId) -> KernelResult<SyscallOutcome> {
        let handler = self.current_thread(cpu)?;
        handler.set_ret(0);
        if let Some(config) = handler.ipc.handler() {
            handler.set_state(ThreadState::Waiting);
            handler.set_sched_context(None);
            if config.ipc_lock.is_locked() {
                config.ipc_lock.unlock();
            }
        }
        Ok(self.switch_outcome(cpu, SchedTrigger::Block))
    }

    /// Resolves `conn` to a connection and the caller's side of it
    ///
    /// `CONN_IPC_SERVER` means the connection the calling handler serves.
    fn with_conn_side<R>(
        &self,
        cpu: CpuId,
        conn: i64,
        f: impl FnOnce(&mut ConnInner, Side) -> KernelResult<R>,
    ) -> KernelResult<R> {
        if conn == CONN_IPC_SERVER {
            let handler = self.current_thread(cpu)?;
            let config = handler.ipc.handler().ok_or(KernelError::InvalidArgument)?;
            let active = config
                .active_conn
                .lock()
                .clone()
                .ok_or(KernelError::InvalidArgument)?;
            let mut inner = active.inner.lock();
            return f(&mut inner, Side::Server);
        }

        let cap = CapId::from_raw(conn).ok_or(KernelError::InvalidCapability)?;
        let group = self.current_cap_group(cpu)?;
        let conn = self.obj_get::<Connection>(&group, cap)?;
        if !conn.ownership.try_lock() {
            let current = self.current_thread(cpu)?;
            return Err(if current.is_exiting() {
                KernelError::PeerExiting
            } else {
                KernelError::TryAgain
            });
        }
        let result = if conn.state() == ConnState::Valid {
            f(&mut conn.inner.lock(), Side::Client)
        } else {
            Err(KernelError::InvalidArgument)
        };
        conn.ownership.unlock();
        result
    }

    /// Declares `cap` for transfer at `index` of the caller's send buffer
    pub fn sys_ipc_set_cap(
        &self,
        cpu: CpuId,
        conn: i64,
        index: u64,
        cap: CapId,
        mask: CapRights,
        rest: CapRights,
    ) -> KernelResult<()> {
        let index = cap_index(index)?;
        self.with_conn_side(cpu, conn, |inner, side| {
            let entry = CapTransfer::new(cap, mask, rest);
            match side {
                Side::Client => inner.client_cap_buf[index] = entry,
                Side::Server => inner.server_cap_buf[index] = entry,
            }
            Ok(())
        })
    }

    /// Returns the slot a cap received at `index` was installed in
    pub fn sys_ipc_get_cap(&self, cpu: CpuId, conn: i64, index: u64) -> KernelResult<CapId> {
        let index = cap_index(index)?;
        self.with_conn_side(cpu, conn, |inner, side| {
            let received = match side {
                Side::Client => inner.client_received[index],
                Side::Server => inner.server_received[index],
            };
            received.ok_or(KernelError::InvalidCapability)
        })
    }

    /// Recycle driver step: stops new calls and waits out the in-flight one
    ///
    /// Returns `TryAgain` while a call is in flight; the connection then
    /// stays in `IncomeStopped` and the step can be retried.
    pub fn stop_connection(&self, conn: &Handle<Connection>) -> KernelResult<ConnState> {
        if conn.state() >= ConnState::RecycleReady {
            return Ok(conn.state());
        }
        conn.advance(ConnState::IncomeStopped);
        if !conn.ownership.try_lock() {
            return Err(KernelError::TryAgain);
        }
        let config = conn.server_handler().and_then(|handler| handler.ipc.handler());
        if let Some(config) = &config {
            if !config.ipc_lock.try_lock() {
                conn.ownership.unlock();
                return Err(KernelError::TryAgain);
            }
        }
        conn.advance(ConnState::RecycleReady);
        if let Some(config) = &config {
            config.ipc_lock.unlock();
        }
        conn.ownership.unlock();
        debug!("stop_connection: {} ready for recycling", conn.id());
        Ok(ConnState::RecycleReady)
    }

    /// Stops every connection the cap group holds a cap to
    ///
    /// Connections with a call in flight are left in `IncomeStopped`.
    pub(crate) fn stop_group_connections(&self, group: &Handle<CapGroup>) {
        let conns: Vec<Handle<Connection>> = group
            .slot_table
            .read()
            .iter()
            .filter_map(|slot| Handle::<Connection>::new(Arc::clone(&slot.object)))
            .collect();
        for conn in conns {
            match self.stop_connection(&conn) {
                Ok(state) => trace!("stop {}: {:?}", conn.id(), state),
                Err(err) => debug!("stop {}: {} (left {:?})", conn.id(), err, conn.state()),
            }
        }
    }

    /// Releases a stopped connection
    ///
    /// Unmaps the shared memory and frees the shared memory and connection
    /// caps of both sides. Fails with `InvalidArgument` while the connection
    /// is still valid.
    pub fn sys_ipc_close_connection(&self, cpu: CpuId, conn_cap: CapId) -> KernelResult<()> {
        let group = self.current_cap_group(cpu)?;
        let conn = self.obj_get::<Connection>(&group, conn_cap)?;
        match conn.state() {
            ConnState::Valid | ConnState::DeinitReady => return Err(KernelError::InvalidArgument),
            ConnState::IncomeStopped => {
                self.stop_connection(conn.handle())?;
            }
            ConnState::RecycleReady => {}
        }

        let (client_caps, server_caps, server_shm) = {
            let mut inner = conn.inner.lock();
            (
                [inner.shm_cap_in_client.take(), inner.conn_cap_in_client.take()],
                [inner.shm_cap_in_server.take(), inner.conn_cap_in_server.take()],
                inner.server_shm_uaddr.take(),
            )
        };
        conn.advance(ConnState::DeinitReady);

        let shm = conn.shm.object();
        if let Some(client) = group_of(&conn.client_group) {
            self.release_side(&client, Some(conn.client_shm_uaddr), &client_caps, shm, conn.object());
        }
        if let Some(server) = group_of(&conn.server_group) {
            self.release_side(&server, server_shm, &server_caps, shm, conn.object());
        }
        debug!("close_connection: {} by {}", conn.id(), group.badge());
        Ok(())
    }

    /// Unmaps one side's shared memory and frees its caps
    ///
    /// Slots reused for other objects since are left alone.
    fn release_side(
        &self,
        group: &Handle<CapGroup>,
        shm_uaddr: Option<u64>,
        caps: &[Option<CapId>; 2],
        shm: &Arc<Object>,
        conn: &Arc<Object>,
    ) {
        if let Some(vaddr) = shm_uaddr {
            if let Err(err) = group.vmspace().unmap(vaddr) {
                debug!("close_connection: unmap {:#x} in {}: {}", vaddr, group.badge(), err);
            }
        }
        for (cap, object) in caps.iter().zip([shm, conn]) {
            let Some(cap) = *cap else {
                continue;
            };
            let same = group
                .slot(cap)
                .is_some_and(|slot| Arc::ptr_eq(&slot.object, object));
            if same {
                if let Err(err) = self.cap_free(group, cap) {
                    debug!("close_connection: free {} in {}: {}", cap, group.badge(), err);
                }
            }
        }
    }
}

fn cap_index(index: u64) -> KernelResult<usize> {
    usize::try_from(index)
        .ok()
        .filter(|i| *i < MAX_CAP_TRANSFER)
        .ok_or(KernelError::InvalidArgument)
}

/// Undo list for a multi-step setup
struct Rollback<'k> {
    kernel: &'k Kernel,
    steps: Vec<RollbackStep>,
}

enum RollbackStep {
    Free(Handle<CapGroup>, CapId),
    Unmap(Handle<CapGroup>, u64),
}

impl<'k> Rollback<'k> {
    fn new(kernel: &'k Kernel) -> Self {
        Self {
            kernel,
            steps: Vec::new(),
        }
    }

    fn free(&mut self, group: &Handle<CapGroup>, cap: CapId) {
        self.steps.push(RollbackStep::Free(group.clone(), cap));
    }

    fn unmap(&mut self, group: &Handle<CapGroup>, vaddr: u64) {
        self.steps.push(RollbackStep::Unmap(group.clone(), vaddr));
    }

    /// Undoes every recorded step, newest first
    fn run(&mut self) {
        while let Some(step) = self.steps.pop() {
            let result = match &step {
                RollbackStep::Free(group, cap) => self.kernel.cap_free(group, *cap),
                RollbackStep::Unmap(group, vaddr) => group.vmspace().unmap(*vaddr).map(|_| ()),
            };
            if let Err(err) = result {
                panic!("BUG: connection setup rollback failed: {}", err);
            }
        }
    }
}
