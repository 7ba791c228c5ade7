//! Connection setup and capability transfer records

use core_types::{CapId, CapRights};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum number of capabilities moved by one call or return
pub const MAX_CAP_TRANSFER: usize = 16;

/// Connection argument meaning "the connection I am currently serving"
///
/// Handler threads do not hold the connection cap of the client they serve;
/// they pass this value to `ipc_get_cap`/`ipc_set_cap` instead.
pub const CONN_IPC_SERVER: i64 = -1;

/// Client-side shared memory request passed to `register_client`
///
/// The kernel allocates a region of `shm_size` bytes and maps it at
/// `client_shm_uaddr` in the client. The server picks its own address when it
/// accepts the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcVmConfig {
    /// Where the client wants the region mapped
    pub client_shm_uaddr: u64,
    /// Region size in bytes
    pub shm_size: u64,
}

/// Error decoding an [`IpcVmConfig`] from user memory
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("vm config needs {} bytes, got {0}", IpcVmConfig::ENCODED_LEN)]
pub struct VmConfigTruncated(pub usize);

impl IpcVmConfig {
    /// Size of the user-memory representation
    pub const ENCODED_LEN: usize = 16;

    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[0..8].copy_from_slice(&self.client_shm_uaddr.to_le_bytes());
        out[8..16].copy_from_slice(&self.shm_size.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VmConfigTruncated> {
        if bytes.len() < Self::ENCODED_LEN {
            return Err(VmConfigTruncated(bytes.len()));
        }
        let mut addr = [0u8; 8];
        let mut size = [0u8; 8];
        addr.copy_from_slice(&bytes[0..8]);
        size.copy_from_slice(&bytes[8..16]);
        Ok(Self {
            client_shm_uaddr: u64::from_le_bytes(addr),
            shm_size: u64::from_le_bytes(size),
        })
    }
}

/// One entry of a connection's cap send buffer
///
/// `mask` and `rest` are applied with [`CapRights::change`] when the cap is
/// copied into the receiving cap group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapTransfer {
    pub valid: bool,
    pub cap: CapId,
    pub mask: CapRights,
    pub rest: CapRights,
}

impl CapTransfer {
    /// An unused entry
    pub const EMPTY: CapTransfer = CapTransfer {
        valid: false,
        cap: CapId::new(0),
        mask: CapRights::NONE,
        rest: CapRights::NONE,
    };

    /// Declares `cap` for transfer with the given rights adjustment
    pub const fn new(cap: CapId, mask: CapRights, rest: CapRights) -> Self {
        Self {
            valid: true,
            cap,
            mask,
            rest,
        }
    }

    /// Rights the receiver ends up with, given the sender slot's rights
    pub const fn derived_rights(&self, source: CapRights) -> CapRights {
        source.change(self.mask, self.rest)
    }
}

impl Default for CapTransfer {
    fn default() -> Self {
        Self::EMPTY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_config_user_layout() {
        let config = IpcVmConfig {
            client_shm_uaddr: 0x4000_0000,
            shm_size: 0x1000,
        };
        let bytes = config.to_bytes();
        assert_eq!(IpcVmConfig::from_bytes(&bytes), Ok(config));
        assert_eq!(IpcVmConfig::from_bytes(&bytes[..10]), Err(VmConfigTruncated(10)));
    }

    #[test]
    fn test_cap_transfer_read_only() {
        let entry = CapTransfer::new(CapId::new(3), CapRights::RW, CapRights::READ);
        assert!(entry.valid);
        let rights = entry.derived_rights(CapRights::ALL);
        assert!(rights.contain(CapRights::READ));
        assert!(!rights.contain(CapRights::WRITE));
    }

    #[test]
    fn test_empty_entry_is_invalid() {
        assert!(!CapTransfer::default().valid);
        assert_eq!(CapTransfer::default(), CapTransfer::EMPTY);
    }

    #[test]
    fn test_cap_transfer_serializes() {
        let entry = CapTransfer::new(CapId::new(1), CapRights::NONE, CapRights::NONE);
        let json = serde_json::to_string(&entry).unwrap();
        let back: CapTransfer = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }
}
