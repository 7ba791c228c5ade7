//! Syscall gate
//!
//! The only way user code reaches the kernel. A syscall arrives as a raw
//! register frame ([`SyscallArgs`]); the gate looks the number up in the
//! [`SyscallTable`], decodes register and user-memory arguments and runs
//! the handler on behalf of the thread current on the CPU.
//!
//! Pointer arguments are user virtual addresses of the calling cap group.
//! Arrays of capabilities are little-endian 64-bit words.
//!
//! Unknown and disabled numbers go to a placeholder that logs and fails
//! with `-ENOSYS`.

use crate::vmspace::VmPerm;
use crate::Kernel;
use core_types::{CapId, CapRights, CpuId, ThreadId};
use ipc::{IpcVmConfig, MAX_CAP_TRANSFER};
use kernel_api::{
    CapGroupArgs, ClockId, KernelError, KernelResult, SyscallArgs, SyscallNumber, ThreadArgs,
    TimeSpec, NR_SYSCALL,
};
use log::{debug, trace, warn};

/// What the caller sees when a syscall leaves the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallOutcome {
    /// The caller keeps the CPU with this value in its return register
    Return(i64),
    /// The CPU now runs another thread; the caller's value arrives later
    Switch(ThreadId),
}

impl SyscallOutcome {
    pub fn is_switch(&self) -> bool {
        matches!(self, SyscallOutcome::Switch(_))
    }
}

/// Syscall audit event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyscallEvent {
    Invoked {
        thread: ThreadId,
        syscall: SyscallNumber,
        cpu: CpuId,
        timestamp_ticks: u64,
    },
    Completed {
        thread: ThreadId,
        syscall: SyscallNumber,
        outcome: SyscallOutcome,
        timestamp_ticks: u64,
    },
    Rejected {
        thread: ThreadId,
        syscall: SyscallNumber,
        error: KernelError,
        timestamp_ticks: u64,
    },
    /// Number not in the table, or disabled
    Unknown {
        thread: ThreadId,
        number: u64,
        timestamp_ticks: u64,
    },
}

/// Audit log for syscall operations
#[derive(Debug, Clone, Default)]
pub struct SyscallAuditLog {
    events: Vec<SyscallEvent>,
}

impl SyscallAuditLog {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn record(&mut self, event: SyscallEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[SyscallEvent] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn has_event<F>(&self, predicate: F) -> bool
    where
        F: Fn(&SyscallEvent) -> bool,
    {
        self.events.iter().any(predicate)
    }

    pub fn count_events<F>(&self, predicate: F) -> usize
    where
        F: Fn(&SyscallEvent) -> bool,
    {
        self.events.iter().filter(|e| predicate(e)).count()
    }
}

pub type SyscallHandler = fn(&Kernel, CpuId, &SyscallArgs) -> KernelResult<SyscallOutcome>;

/// Handlers indexed by syscall number
pub struct SyscallTable {
    entries: Vec<Option<(SyscallNumber, SyscallHandler)>>,
}

impl SyscallTable {
    /// A table with every known syscall enabled
    pub fn new() -> Self {
        let mut table = Self {
            entries: vec![None; NR_SYSCALL as usize],
        };
        for nr in SyscallNumber::ALL {
            table.entries[nr.as_raw() as usize] = Some((nr, handler_for(nr)));
        }
        table
    }

    /// Routes `nr` to the placeholder
    pub fn disable(&mut self, nr: SyscallNumber) {
        self.entries[nr.as_raw() as usize] = None;
    }

    pub fn is_enabled(&self, nr: SyscallNumber) -> bool {
        self.lookup(nr.as_raw()).is_some()
    }

    fn lookup(&self, number: u64) -> Option<(SyscallNumber, SyscallHandler)> {
        usize::try_from(number)
            .ok()
            .and_then(|index| self.entries.get(index).copied().flatten())
    }
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Target of every unknown or disabled number
fn sys_null_placeholder(_kernel: &Kernel, cpu: CpuId, frame: &SyscallArgs) -> KernelResult<SyscallOutcome> {
    warn!("{}: syscall {} is not implemented", cpu, frame.number);
    Err(KernelError::NotSupported)
}

fn ret(value: i64) -> KernelResult<SyscallOutcome> {
    Ok(SyscallOutcome::Return(value))
}

fn cap_arg(frame: &SyscallArgs, index: usize) -> KernelResult<CapId> {
    CapId::from_raw(frame.signed(index)).ok_or(KernelError::InvalidCapability)
}

fn u32_arg(frame: &SyscallArgs, index: usize) -> KernelResult<u32> {
    u32::try_from(frame.args[index]).map_err(|_| KernelError::InvalidArgument)
}

fn clock_arg(frame: &SyscallArgs, index: usize) -> KernelResult<ClockId> {
    ClockId::from_raw(frame.args[index]).ok_or(KernelError::InvalidArgument)
}

/// Copies a fixed-size structure in from user memory
fn read_user<T>(
    kernel: &Kernel,
    cpu: CpuId,
    vaddr: u64,
    len: usize,
    decode: impl FnOnce(&[u8]) -> Option<T>,
) -> KernelResult<T> {
    let bytes = kernel.copy_from_user(cpu, vaddr, len)?;
    decode(&bytes).ok_or(KernelError::BadAddress)
}

fn read_cap_array(kernel: &Kernel, cpu: CpuId, vaddr: u64, count: usize) -> KernelResult<Vec<CapId>> {
    let bytes = kernel.copy_from_user(cpu, vaddr, count * 8)?;
    bytes
        .chunks_exact(8)
        .map(|word| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(word);
            CapId::from_raw(i64::from_le_bytes(raw)).ok_or(KernelError::InvalidCapability)
        })
        .collect()
}

fn handler_for(nr: SyscallNumber) -> SyscallHandler {
    match nr {
        SyscallNumber::CreatePmo => |k, cpu, a| ret(k.sys_create_pmo(cpu, a.args[0])?.as_raw()),
        SyscallNumber::MapPmo => |k, cpu, a| {
            let perm = VmPerm::from_bits(a.args[3]).ok_or(KernelError::InvalidArgument)?;
            k.sys_map_pmo(cpu, cap_arg(a, 0)?, cap_arg(a, 1)?, a.args[2], perm)?;
            ret(0)
        },
        SyscallNumber::RevokeCap => |k, cpu, a| {
            k.sys_revoke_cap(cpu, cap_arg(a, 0)?, a.args[1] != 0)?;
            ret(0)
        },
        SyscallNumber::TransferCaps => |k, cpu, a| {
            let count = usize::try_from(a.args[2]).map_err(|_| KernelError::InvalidArgument)?;
            if count == 0 || count > MAX_CAP_TRANSFER {
                return Err(KernelError::InvalidArgument);
            }
            let caps = read_cap_array(k, cpu, a.args[1], count)?;
            let results = k.sys_transfer_caps(cpu, cap_arg(a, 0)?, &caps)?;
            let out: Vec<u8> = results
                .iter()
                .flat_map(|r| match r {
                    Ok(cap) => cap.as_raw(),
                    Err(err) => err.errno(),
                }
                .to_le_bytes())
                .collect();
            k.copy_to_user(cpu, a.args[3], &out)?;
            ret(0)
        },
        SyscallNumber::CreateCapGroup => |k, cpu, a| {
            let args = read_user(k, cpu, a.args[0], CapGroupArgs::ENCODED_LEN, CapGroupArgs::from_bytes)?;
            ret(k.sys_create_cap_group(cpu, &args)?.as_raw())
        },
        SyscallNumber::ExitGroup => |k, cpu, a| k.sys_exit_group(cpu, a.signed(0)),
        SyscallNumber::CreateThread => |k, cpu, a| {
            let args = read_user(k, cpu, a.args[0], ThreadArgs::ENCODED_LEN, ThreadArgs::from_bytes)?;
            ret(k.sys_create_thread(cpu, &args)?.as_raw())
        },
        SyscallNumber::ThreadExit => |k, cpu, _| k.sys_thread_exit(cpu),
        SyscallNumber::IpcCloseConnection => |k, cpu, a| {
            k.sys_ipc_close_connection(cpu, cap_arg(a, 0)?)?;
            ret(0)
        },
        SyscallNumber::Yield => |k, cpu, _| k.sys_yield(cpu),
        SyscallNumber::SetAffinity => |k, cpu, a| {
            k.sys_set_affinity(cpu, cap_arg(a, 0)?, a.signed(1))?;
            ret(0)
        },
        SyscallNumber::GetAffinity => |k, cpu, a| ret(k.sys_get_affinity(cpu, cap_arg(a, 0)?)?),
        SyscallNumber::SetPrio => |k, cpu, a| {
            k.sys_set_prio(cpu, cap_arg(a, 0)?, u32_arg(a, 1)?)?;
            ret(0)
        },
        SyscallNumber::GetPrio => |k, cpu, a| ret(i64::from(k.sys_get_prio(cpu, cap_arg(a, 0)?)?)),
        SyscallNumber::Suspend => |k, cpu, a| k.sys_suspend(cpu, cap_arg(a, 0)?),
        SyscallNumber::Resume => |k, cpu, a| {
            k.sys_resume(cpu, cap_arg(a, 0)?)?;
            ret(0)
        },
        SyscallNumber::RegisterServer => |k, cpu, a| {
            k.sys_register_server(cpu, a.args[0], cap_arg(a, 1)?, a.args[2])?;
            ret(0)
        },
        SyscallNumber::RegisterClient => |k, cpu, a| {
            let config = read_user(k, cpu, a.args[1], IpcVmConfig::ENCODED_LEN, |b| {
                IpcVmConfig::from_bytes(b).ok()
            })?;
            k.sys_register_client(cpu, cap_arg(a, 0)?, &config)
        },
        SyscallNumber::IpcRegisterCbReturn => |k, cpu, a| {
            k.sys_ipc_register_cb_return(cpu, cap_arg(a, 0)?, a.args[1], a.args[2])
        },
        SyscallNumber::IpcCall => |k, cpu, a| k.sys_ipc_call(cpu, cap_arg(a, 0)?, u32_arg(a, 1)?),
        SyscallNumber::IpcReturn => |k, cpu, a| k.sys_ipc_return(cpu, a.signed(0), u32_arg(a, 1)?),
        SyscallNumber::IpcExitRoutineReturn => |k, cpu, _| k.sys_ipc_exit_routine_return(cpu),
        SyscallNumber::IpcGetCap => |k, cpu, a| ret(k.sys_ipc_get_cap(cpu, a.signed(0), a.args[1])?.as_raw()),
        SyscallNumber::IpcSetCap => |k, cpu, a| {
            k.sys_ipc_set_cap(
                cpu,
                a.signed(0),
                a.args[1],
                cap_arg(a, 2)?,
                CapRights::from_bits_truncate(a.args[3]),
                CapRights::from_bits_truncate(a.args[4]),
            )?;
            ret(0)
        },
        SyscallNumber::CreateNotifc => |k, cpu, _| ret(k.sys_create_notifc(cpu)?.as_raw()),
        SyscallNumber::Wait => |k, cpu, a| {
            let timeout = match a.args[2] {
                0 => None,
                ptr => Some(read_user(k, cpu, ptr, TimeSpec::ENCODED_LEN, TimeSpec::from_bytes)?),
            };
            k.sys_wait(cpu, cap_arg(a, 0)?, a.args[1] != 0, timeout.as_ref())
        },
        SyscallNumber::Notify => |k, cpu, a| {
            k.sys_notify(cpu, cap_arg(a, 0)?)?;
            ret(0)
        },
        SyscallNumber::ClockGettime => |k, cpu, a| {
            let now = k.sys_clock_gettime(cpu, clock_arg(a, 0)?)?;
            k.copy_to_user(cpu, a.args[1], &now.to_bytes())?;
            ret(0)
        },
        SyscallNumber::ClockNanosleep => |k, cpu, a| {
            let req = read_user(k, cpu, a.args[2], TimeSpec::ENCODED_LEN, TimeSpec::from_bytes)?;
            k.sys_clock_nanosleep(cpu, clock_arg(a, 0)?, a.args[1], &req)
        },
        SyscallNumber::Futex => |k, cpu, a| {
            k.sys_futex(cpu, a.args[0], a.args[1], a.args[2] as u32, a.args[3], a.args[4])
        },
        SyscallNumber::SetTidAddress => |k, cpu, a| ret(k.sys_set_tid_address(cpu, a.args[0])? as i64),
        SyscallNumber::KillGroup => |k, cpu, a| k.sys_kill_group(cpu, cap_arg(a, 0)?),
    }
}

impl Kernel {
    /// Syscall audit trail
    pub fn syscall_audit(&self) -> spin::MutexGuard<'_, SyscallAuditLog> {
        self.syscall_audit.lock()
    }

    /// Enters the kernel from the thread current on `cpu`
    ///
    /// Errors come back as negative errno values. A `Return` value is also
    /// left in the caller's return register.
    pub fn syscall(&self, cpu: CpuId, frame: &SyscallArgs) -> SyscallOutcome {
        let caller = match self.current_thread(cpu) {
            Ok(thread) => thread,
            Err(err) => return SyscallOutcome::Return(err.errno()),
        };
        let timestamp_ticks = self.clock.now();

        let Some((syscall, handler)) = self.syscalls.lookup(frame.number) else {
            self.syscall_audit.lock().record(SyscallEvent::Unknown {
                thread: caller.id(),
                number: frame.number,
                timestamp_ticks,
            });
            let outcome = match sys_null_placeholder(self, cpu, frame) {
                Ok(outcome) => outcome,
                Err(err) => SyscallOutcome::Return(err.errno()),
            };
            if let SyscallOutcome::Return(value) = outcome {
                caller.set_ret(value);
            }
            return outcome;
        };

        trace!("{}: {} enters {}", cpu, caller.id(), syscall);
        self.syscall_audit.lock().record(SyscallEvent::Invoked {
            thread: caller.id(),
            syscall,
            cpu,
            timestamp_ticks,
        });

        let outcome = match handler(self, cpu, frame) {
            Ok(outcome) => {
                self.syscall_audit.lock().record(SyscallEvent::Completed {
                    thread: caller.id(),
                    syscall,
                    outcome,
                    timestamp_ticks,
                });
                outcome
            }
            Err(err) => {
                debug!("{}: {} from {} failed: {}", cpu, syscall, caller.id(), err);
                self.syscall_audit.lock().record(SyscallEvent::Rejected {
                    thread: caller.id(),
                    syscall,
                    error: err,
                    timestamp_ticks,
                });
                SyscallOutcome::Return(err.errno())
            }
        };
        if let SyscallOutcome::Return(value) = outcome {
            caller.set_ret(value);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmo::Pmo;
    use crate::test_utils::{boot_kernel, boot_with, map_scratch, spawn_thread, ROOT_CPU};
    use kernel_api::{errno, KernelConfig};

    fn call(kernel: &Kernel, nr: SyscallNumber, args: &[u64]) -> SyscallOutcome {
        kernel.syscall(ROOT_CPU, &SyscallArgs::new(nr, args))
    }

    #[test]
    fn test_every_number_has_a_handler() {
        let table = SyscallTable::new();
        for nr in SyscallNumber::ALL {
            assert!(table.is_enabled(nr), "{} missing", nr);
        }
    }

    #[test]
    fn test_unknown_number_is_enosys() {
        let kernel = boot_kernel(1);
        let outcome = kernel.syscall(ROOT_CPU, &SyscallArgs::raw(5, &[]));
        assert_eq!(outcome, SyscallOutcome::Return(-errno::ENOSYS));
        let outcome = kernel.syscall(ROOT_CPU, &SyscallArgs::raw(NR_SYSCALL + 3, &[]));
        assert_eq!(outcome, SyscallOutcome::Return(-errno::ENOSYS));
        assert_eq!(kernel.current_thread(ROOT_CPU).unwrap().ret(), -errno::ENOSYS);

        let audit = kernel.syscall_audit();
        assert_eq!(
            audit.count_events(|e| matches!(e, SyscallEvent::Unknown { .. })),
            2
        );
    }

    #[test]
    fn test_disabled_entry_goes_to_placeholder() {
        let mut table = SyscallTable::new();
        table.disable(SyscallNumber::Yield);
        assert!(!table.is_enabled(SyscallNumber::Yield));
        assert!(table.lookup(SyscallNumber::Yield.as_raw()).is_none());
    }

    #[test]
    fn test_create_pmo_through_gate() {
        let kernel = boot_kernel(1);
        let outcome = call(&kernel, SyscallNumber::CreatePmo, &[4096]);
        let SyscallOutcome::Return(raw) = outcome else {
            panic!("unexpected {:?}", outcome);
        };
        let group = kernel.current_cap_group(ROOT_CPU).unwrap();
        let cap = CapId::from_raw(raw).unwrap();
        assert!(kernel.lookup_cap::<Pmo>(&group, cap, CapRights::RW).is_ok());

        let audit = kernel.syscall_audit();
        assert!(audit.has_event(|e| matches!(
            e,
            SyscallEvent::Completed {
                syscall: SyscallNumber::CreatePmo,
                ..
            }
        )));
    }

    #[test]
    fn test_errors_become_negative_errno() {
        let kernel = boot_kernel(1);
        assert_eq!(
            call(&kernel, SyscallNumber::Notify, &[77]),
            SyscallOutcome::Return(-errno::ECAPBILITY)
        );
        assert_eq!(
            call(&kernel, SyscallNumber::ClockGettime, &[9, 0x1000]),
            SyscallOutcome::Return(-errno::EINVAL)
        );
        assert_eq!(
            call(&kernel, SyscallNumber::ClockNanosleep, &[1, 0, 0xdead_0000]),
            SyscallOutcome::Return(-errno::EFAULT)
        );
        let audit = kernel.syscall_audit();
        assert!(audit.has_event(|e| matches!(
            e,
            SyscallEvent::Rejected {
                error: KernelError::BadAddress,
                ..
            }
        )));
    }

    #[test]
    fn test_clock_gettime_writes_user_memory() {
        let kernel = boot_kernel(1);
        let buf = map_scratch(&kernel, ROOT_CPU, 4096);
        kernel.advance_ticks(3);
        assert_eq!(
            call(&kernel, SyscallNumber::ClockGettime, &[1, buf]),
            SyscallOutcome::Return(0)
        );
        let bytes = kernel.copy_from_user(ROOT_CPU, buf, TimeSpec::ENCODED_LEN).unwrap();
        let ts = TimeSpec::from_bytes(&bytes).unwrap();
        assert_eq!(ts, TimeSpec::from_ticks(3, kernel.config().tick_ns));
    }

    #[test]
    fn test_nanosleep_switches() {
        let kernel = boot_kernel(1);
        let _other = spawn_thread(&kernel, ROOT_CPU, 5);
        let buf = map_scratch(&kernel, ROOT_CPU, 4096);
        kernel
            .copy_to_user(ROOT_CPU, buf, &TimeSpec::from_millis(30).to_bytes())
            .unwrap();
        let outcome = call(&kernel, SyscallNumber::ClockNanosleep, &[1, 0, buf]);
        assert!(outcome.is_switch());
    }

    #[test]
    fn test_transfer_caps_writes_results() {
        let kernel = boot_with(KernelConfig::default().single_cpu());
        let buf = map_scratch(&kernel, ROOT_CPU, 4096);
        let pmo = kernel.sys_create_pmo(ROOT_CPU, 4096).unwrap();
        let mut caps = Vec::new();
        caps.extend_from_slice(&pmo.as_raw().to_le_bytes());
        caps.extend_from_slice(&900i64.to_le_bytes());
        kernel.copy_to_user(ROOT_CPU, buf, &caps).unwrap();

        let outcome = call(&kernel, SyscallNumber::TransferCaps, &[0, buf, 2, buf + 64]);
        assert_eq!(outcome, SyscallOutcome::Return(0));
        let out = kernel.copy_from_user(ROOT_CPU, buf + 64, 16).unwrap();
        let first = i64::from_le_bytes(out[0..8].try_into().unwrap());
        let second = i64::from_le_bytes(out[8..16].try_into().unwrap());
        assert!(first > 0);
        assert_eq!(second, -errno::ECAPBILITY);

        assert_eq!(
            call(&kernel, SyscallNumber::TransferCaps, &[0, buf, 17, buf + 64]),
            SyscallOutcome::Return(-errno::EINVAL)
        );
    }
}
