//! Syscall table and argument layouts
//!
//! Syscalls are dispatched by number. Arguments travel in up to six
//! registers; structured arguments are passed as user virtual addresses and
//! copied in by the kernel using the layouts defined here.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed syscall numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u64)]
pub enum SyscallNumber {
    CreatePmo = 2,
    MapPmo = 4,
    RevokeCap = 9,
    TransferCaps = 10,
    CreateCapGroup = 11,
    ExitGroup = 12,
    CreateThread = 13,
    ThreadExit = 14,
    IpcCloseConnection = 17,
    Yield = 18,
    SetAffinity = 19,
    GetAffinity = 20,
    SetPrio = 21,
    GetPrio = 22,
    Suspend = 23,
    Resume = 24,
    RegisterServer = 26,
    RegisterClient = 27,
    IpcRegisterCbReturn = 28,
    IpcCall = 29,
    IpcReturn = 30,
    IpcExitRoutineReturn = 31,
    IpcGetCap = 32,
    IpcSetCap = 33,
    CreateNotifc = 34,
    Wait = 35,
    Notify = 36,
    ClockGettime = 43,
    ClockNanosleep = 44,
    Futex = 57,
    SetTidAddress = 58,
    KillGroup = 60,
}

/// Size of the syscall table; numbers at or above it are rejected
pub const NR_SYSCALL: u64 = 64;

impl SyscallNumber {
    /// Every implemented syscall
    pub const ALL: [SyscallNumber; 32] = [
        SyscallNumber::CreatePmo,
        SyscallNumber::MapPmo,
        SyscallNumber::RevokeCap,
        SyscallNumber::TransferCaps,
        SyscallNumber::CreateCapGroup,
        SyscallNumber::ExitGroup,
        SyscallNumber::CreateThread,
        SyscallNumber::ThreadExit,
        SyscallNumber::IpcCloseConnection,
        SyscallNumber::Yield,
        SyscallNumber::SetAffinity,
        SyscallNumber::GetAffinity,
        SyscallNumber::SetPrio,
        SyscallNumber::GetPrio,
        SyscallNumber::Suspend,
        SyscallNumber::Resume,
        SyscallNumber::RegisterServer,
        SyscallNumber::RegisterClient,
        SyscallNumber::IpcRegisterCbReturn,
        SyscallNumber::IpcCall,
        SyscallNumber::IpcReturn,
        SyscallNumber::IpcExitRoutineReturn,
        SyscallNumber::IpcGetCap,
        SyscallNumber::IpcSetCap,
        SyscallNumber::CreateNotifc,
        SyscallNumber::Wait,
        SyscallNumber::Notify,
        SyscallNumber::ClockGettime,
        SyscallNumber::ClockNanosleep,
        SyscallNumber::Futex,
        SyscallNumber::SetTidAddress,
        SyscallNumber::KillGroup,
    ];

    /// Returns the numeric id
    pub const fn as_raw(self) -> u64 {
        self as u64
    }

    /// Looks up a syscall by number
    pub fn from_raw(raw: u64) -> Option<Self> {
        Self::ALL.iter().copied().find(|nr| nr.as_raw() == raw)
    }

    pub const fn name(self) -> &'static str {
        match self {
            SyscallNumber::CreatePmo => "create_pmo",
            SyscallNumber::MapPmo => "map_pmo",
            SyscallNumber::RevokeCap => "revoke_cap",
            SyscallNumber::TransferCaps => "transfer_caps",
            SyscallNumber::CreateCapGroup => "create_cap_group",
            SyscallNumber::ExitGroup => "exit_group",
            SyscallNumber::CreateThread => "create_thread",
            SyscallNumber::ThreadExit => "thread_exit",
            SyscallNumber::IpcCloseConnection => "ipc_close_connection",
            SyscallNumber::Yield => "yield",
            SyscallNumber::SetAffinity => "set_affinity",
            SyscallNumber::GetAffinity => "get_affinity",
            SyscallNumber::SetPrio => "set_prio",
            SyscallNumber::GetPrio => "get_prio",
            SyscallNumber::Suspend => "suspend",
            SyscallNumber::Resume => "resume",
            SyscallNumber::RegisterServer => "register_server",
            SyscallNumber::RegisterClient => "register_client",
            SyscallNumber::IpcRegisterCbReturn => "ipc_register_cb_return",
            SyscallNumber::IpcCall => "ipc_call",
            SyscallNumber::IpcReturn => "ipc_return",
            SyscallNumber::IpcExitRoutineReturn => "ipc_exit_routine_return",
            SyscallNumber::IpcGetCap => "ipc_get_cap",
            SyscallNumber::IpcSetCap => "ipc_set_cap",
            SyscallNumber::CreateNotifc => "create_notifc",
            SyscallNumber::Wait => "wait",
            SyscallNumber::Notify => "notify",
            SyscallNumber::ClockGettime => "clock_gettime",
            SyscallNumber::ClockNanosleep => "clock_nanosleep",
            SyscallNumber::Futex => "futex",
            SyscallNumber::SetTidAddress => "set_tid_address",
            SyscallNumber::KillGroup => "kill_group",
        }
    }
}

impl fmt::Display for SyscallNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sys_{}({})", self.name(), self.as_raw())
    }
}

/// Raw register state of one syscall
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyscallArgs {
    pub number: u64,
    pub args: [u64; 6],
}

impl SyscallArgs {
    /// Builds a syscall frame; missing arguments are zero
    pub fn new(number: SyscallNumber, args: &[u64]) -> Self {
        Self::raw(number.as_raw(), args)
    }

    /// Builds a frame for an arbitrary (possibly unknown) number
    pub fn raw(number: u64, args: &[u64]) -> Self {
        let mut regs = [0u64; 6];
        for (slot, value) in regs.iter_mut().zip(args) {
            *slot = *value;
        }
        Self { number, args: regs }
    }

    /// Argument `index` reinterpreted as a signed value
    pub fn signed(&self, index: usize) -> i64 {
        self.args[index] as i64
    }
}

/// Futex operation codes
pub mod futex_op {
    pub const FUTEX_WAIT: u64 = 0;
    pub const FUTEX_WAKE: u64 = 1;
    pub const FUTEX_REQUEUE: u64 = 3;
    /// Process-private futex; the only supported kind
    pub const FUTEX_PRIVATE: u64 = 128;
    pub const FUTEX_CMD_MASK: u64 = !FUTEX_PRIVATE;
}

/// Thread type as encoded in [`ThreadArgs`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ThreadType {
    /// Per-CPU idle thread
    Idle = 0,
    /// First thread of the root cap group
    Root = 1,
    /// Ordinary user thread with its own scheduling context
    User = 2,
    /// IPC handler thread; runs on the caller's scheduling context
    Shadow = 3,
    /// IPC registration callback thread
    Register = 4,
}

impl ThreadType {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(ThreadType::Idle),
            1 => Some(ThreadType::Root),
            2 => Some(ThreadType::User),
            3 => Some(ThreadType::Shadow),
            4 => Some(ThreadType::Register),
            _ => None,
        }
    }

    /// Whether the thread owns a scheduling context
    pub const fn has_sched_context(self) -> bool {
        matches!(self, ThreadType::Root | ThreadType::User | ThreadType::Idle)
    }
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(word)
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(word)
}

/// User-memory argument block of `create_thread`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadArgs {
    /// Cap group the thread is created in
    pub cap_group_cap: u64,
    pub stack: u64,
    pub pc: u64,
    pub arg: u64,
    pub tls: u64,
    pub prio: u32,
    /// Raw [`ThreadType`]
    pub thread_type: u32,
    /// Address cleared and futex-woken when the thread exits, 0 for none
    pub clear_child_tid: u64,
}

impl ThreadArgs {
    pub const ENCODED_LEN: usize = 56;

    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[0..8].copy_from_slice(&self.cap_group_cap.to_le_bytes());
        out[8..16].copy_from_slice(&self.stack.to_le_bytes());
        out[16..24].copy_from_slice(&self.pc.to_le_bytes());
        out[24..32].copy_from_slice(&self.arg.to_le_bytes());
        out[32..40].copy_from_slice(&self.tls.to_le_bytes());
        out[40..44].copy_from_slice(&self.prio.to_le_bytes());
        out[44..48].copy_from_slice(&self.thread_type.to_le_bytes());
        out[48..56].copy_from_slice(&self.clear_child_tid.to_le_bytes());
        out
    }

    /// Decodes the block; `None` if `bytes` is too short
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::ENCODED_LEN {
            return None;
        }
        Some(Self {
            cap_group_cap: read_u64(bytes, 0),
            stack: read_u64(bytes, 8),
            pc: read_u64(bytes, 16),
            arg: read_u64(bytes, 24),
            tls: read_u64(bytes, 32),
            prio: read_u32(bytes, 40),
            thread_type: read_u32(bytes, 44),
            clear_child_tid: read_u64(bytes, 48),
        })
    }
}

/// User-memory argument block of `create_cap_group`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapGroupArgs {
    /// Process id recorded in the group (reported to IPC servers)
    pub pid: u64,
    /// User address of the name bytes
    pub name: u64,
    pub name_len: u64,
}

impl CapGroupArgs {
    pub const ENCODED_LEN: usize = 24;
    /// Longest accepted name
    pub const MAX_NAME_LEN: u64 = 64;

    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[0..8].copy_from_slice(&self.pid.to_le_bytes());
        out[8..16].copy_from_slice(&self.name.to_le_bytes());
        out[16..24].copy_from_slice(&self.name_len.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::ENCODED_LEN {
            return None;
        }
        Some(Self {
            pid: read_u64(bytes, 0),
            name: read_u64(bytes, 8),
            name_len: read_u64(bytes, 16),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syscall_numbers_are_stable() {
        assert_eq!(SyscallNumber::RevokeCap.as_raw(), 9);
        assert_eq!(SyscallNumber::IpcCall.as_raw(), 29);
        assert_eq!(SyscallNumber::ClockNanosleep.as_raw(), 44);
        assert_eq!(SyscallNumber::KillGroup.as_raw(), 60);
    }

    #[test]
    fn test_from_raw() {
        for nr in SyscallNumber::ALL {
            assert_eq!(SyscallNumber::from_raw(nr.as_raw()), Some(nr));
            assert!(nr.as_raw() < NR_SYSCALL);
        }
        assert_eq!(SyscallNumber::from_raw(0), None);
        assert_eq!(SyscallNumber::from_raw(999), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(SyscallNumber::Yield.to_string(), "sys_yield(18)");
    }

    #[test]
    fn test_args_padding() {
        let frame = SyscallArgs::new(SyscallNumber::IpcCall, &[3, 1]);
        assert_eq!(frame.number, 29);
        assert_eq!(frame.args, [3, 1, 0, 0, 0, 0]);
        let neg = SyscallArgs::raw(7, &[(-1i64) as u64]);
        assert_eq!(neg.signed(0), -1);
    }

    #[test]
    fn test_thread_args_layout() {
        let args = ThreadArgs {
            cap_group_cap: 2,
            stack: 0x7000,
            pc: 0x1000,
            arg: 9,
            tls: 0,
            prio: 10,
            thread_type: ThreadType::User as u32,
            clear_child_tid: 0x2000,
        };
        let bytes = args.to_bytes();
        assert_eq!(ThreadArgs::from_bytes(&bytes), Some(args));
        assert_eq!(ThreadArgs::from_bytes(&bytes[..40]), None);
    }

    #[test]
    fn test_thread_type_codes() {
        assert_eq!(ThreadType::from_raw(3), Some(ThreadType::Shadow));
        assert_eq!(ThreadType::from_raw(7), None);
        assert!(!ThreadType::Shadow.has_sched_context());
        assert!(!ThreadType::Register.has_sched_context());
        assert!(ThreadType::User.has_sched_context());
    }

    #[test]
    fn test_futex_cmd_mask() {
        use futex_op::*;
        assert_eq!((FUTEX_WAKE | FUTEX_PRIVATE) & FUTEX_CMD_MASK, FUTEX_WAKE);
    }
}
