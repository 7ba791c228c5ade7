//! Kernel error types
//!
//! Every recoverable failure is reported to user space as a negative errno
//! in the return register. [`KernelError`] is the typed view of that value.

use core_types::CapabilityError;
use ipc::IpcMsgError;
use thiserror::Error;

/// Positive errno values used by the kernel ABI
pub mod errno {
    pub const EPERM: i64 = 1;
    pub const ESRCH: i64 = 3;
    pub const EAGAIN: i64 = 11;
    pub const ENOMEM: i64 = 12;
    pub const EFAULT: i64 = 14;
    pub const EINVAL: i64 = 22;
    pub const ENOSYS: i64 = 38;
    pub const ETIMEDOUT: i64 = 110;
    /// Missing, mistyped or under-privileged capability
    pub const ECAPBILITY: i64 = 500;
}

/// Errors that can occur when interacting with the kernel
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum KernelError {
    /// Missing, mistyped or insufficient-rights capability
    #[error("Invalid capability")]
    InvalidCapability,

    /// Malformed argument
    #[error("Invalid argument")]
    InvalidArgument,

    /// Slot, object or memory exhaustion
    #[error("Out of memory")]
    OutOfMemory,

    /// Transient contention; the operation had no effect and may be retried
    #[error("Resource busy, try again")]
    TryAgain,

    /// A timed wait expired
    #[error("Operation timed out")]
    TimedOut,

    /// Unknown or unsupported operation
    #[error("Operation not supported")]
    NotSupported,

    /// Unmapped or permission-violating user address
    #[error("Bad user address")]
    BadAddress,

    /// The caller is not allowed to perform the operation
    #[error("Operation not permitted")]
    PermissionDenied,

    /// The peer thread is exiting
    #[error("Peer thread is exiting")]
    PeerExiting,
}

/// Result type used throughout the kernel core
pub type KernelResult<T> = Result<T, KernelError>;

impl KernelError {
    /// Returns the negative errno delivered to user space
    pub const fn errno(&self) -> i64 {
        -match self {
            KernelError::InvalidCapability => errno::ECAPBILITY,
            KernelError::InvalidArgument => errno::EINVAL,
            KernelError::OutOfMemory => errno::ENOMEM,
            KernelError::TryAgain => errno::EAGAIN,
            KernelError::TimedOut => errno::ETIMEDOUT,
            KernelError::NotSupported => errno::ENOSYS,
            KernelError::BadAddress => errno::EFAULT,
            KernelError::PermissionDenied => errno::EPERM,
            KernelError::PeerExiting => errno::ESRCH,
        }
    }

    /// Maps a negative errno back to its error
    pub fn from_errno(value: i64) -> Option<Self> {
        let err = match -value {
            errno::ECAPBILITY => KernelError::InvalidCapability,
            errno::EINVAL => KernelError::InvalidArgument,
            errno::ENOMEM => KernelError::OutOfMemory,
            errno::EAGAIN => KernelError::TryAgain,
            errno::ETIMEDOUT => KernelError::TimedOut,
            errno::ENOSYS => KernelError::NotSupported,
            errno::EFAULT => KernelError::BadAddress,
            errno::EPERM => KernelError::PermissionDenied,
            errno::ESRCH => KernelError::PeerExiting,
            _ => return None,
        };
        Some(err)
    }

    /// Interprets a raw return register
    ///
    /// Non-negative values are successes.
    pub fn check(ret: i64) -> KernelResult<u64> {
        if ret >= 0 {
            return Ok(ret as u64);
        }
        Err(Self::from_errno(ret).unwrap_or(KernelError::InvalidArgument))
    }
}

impl From<CapabilityError> for KernelError {
    fn from(_: CapabilityError) -> Self {
        KernelError::InvalidCapability
    }
}

impl From<IpcMsgError> for KernelError {
    fn from(_: IpcMsgError) -> Self {
        KernelError::InvalidArgument
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::CapId;

    #[test]
    fn test_errno_values() {
        assert_eq!(KernelError::InvalidCapability.errno(), -500);
        assert_eq!(KernelError::InvalidArgument.errno(), -22);
        assert_eq!(KernelError::OutOfMemory.errno(), -12);
        assert_eq!(KernelError::TryAgain.errno(), -11);
        assert_eq!(KernelError::NotSupported.errno(), -38);
    }

    #[test]
    fn test_from_errno_reverses_errno() {
        for err in [
            KernelError::InvalidCapability,
            KernelError::TimedOut,
            KernelError::BadAddress,
            KernelError::PermissionDenied,
            KernelError::PeerExiting,
        ] {
            assert_eq!(KernelError::from_errno(err.errno()), Some(err));
        }
        assert_eq!(KernelError::from_errno(-9999), None);
    }

    #[test]
    fn test_check_return_register() {
        assert_eq!(KernelError::check(7), Ok(7));
        assert_eq!(KernelError::check(-500), Err(KernelError::InvalidCapability));
    }

    #[test]
    fn test_capability_error_maps_to_ecapbility() {
        let err: KernelError = CapabilityError::EmptySlot(CapId::new(9)).into();
        assert_eq!(err.errno(), -errno::ECAPBILITY);
    }
}
