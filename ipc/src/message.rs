//! IPC message header and payload access
//!
//! The shared memory region of a connection starts with a 12-byte
//! little-endian header:
//!
//! | offset | field             |
//! |--------|-------------------|
//! | 0      | `data_len`        |
//! | 4      | `cap_slot_number` |
//! | 8      | `data_offset`     |
//!
//! The payload lives at `data_offset` (relative to the start of the region)
//! and is `data_len` bytes long.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of the encoded header in bytes
pub const IPC_MSG_HEADER_LEN: usize = 12;

/// Payload offset used by [`IpcMsg::new`]
pub const IPC_MSG_DEFAULT_DATA_OFFSET: u32 = 16;

/// Errors produced while reading or writing a message in a shared region
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum IpcMsgError {
    /// The region cannot even hold the header
    #[error("shared region of {len} bytes cannot hold the message header")]
    RegionTooSmall { len: usize },
    /// The payload would overlap the header
    #[error("data offset {offset} overlaps the header")]
    OffsetInHeader { offset: u32 },
    /// The payload extends past the end of the region
    #[error("payload [{offset}, {offset}+{len}) exceeds region of {region} bytes")]
    PayloadOutOfBounds { offset: u32, len: u32, region: usize },
}

/// Header of a message in a connection's shared memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcMsg {
    /// Payload length in bytes
    pub data_len: u32,
    /// Number of capabilities declared for transfer
    pub cap_slot_number: u32,
    /// Start of the payload relative to the region base
    pub data_offset: u32,
}

impl IpcMsg {
    /// Creates a header for a payload of `data_len` bytes and no caps
    pub const fn new(data_len: u32) -> Self {
        Self {
            data_len,
            cap_slot_number: 0,
            data_offset: IPC_MSG_DEFAULT_DATA_OFFSET,
        }
    }

    /// Sets the number of capabilities sent alongside the payload
    pub const fn with_caps(mut self, cap_slot_number: u32) -> Self {
        self.cap_slot_number = cap_slot_number;
        self
    }

    /// Encodes the header into its wire representation
    pub fn to_bytes(&self) -> [u8; IPC_MSG_HEADER_LEN] {
        let mut out = [0u8; IPC_MSG_HEADER_LEN];
        out[0..4].copy_from_slice(&self.data_len.to_le_bytes());
        out[4..8].copy_from_slice(&self.cap_slot_number.to_le_bytes());
        out[8..12].copy_from_slice(&self.data_offset.to_le_bytes());
        out
    }

    /// Decodes a header from the first bytes of `region`
    pub fn from_bytes(region: &[u8]) -> Result<Self, IpcMsgError> {
        if region.len() < IPC_MSG_HEADER_LEN {
            return Err(IpcMsgError::RegionTooSmall { len: region.len() });
        }
        let word = |at: usize| u32::from_le_bytes([region[at], region[at + 1], region[at + 2], region[at + 3]]);
        Ok(Self {
            data_len: word(0),
            cap_slot_number: word(4),
            data_offset: word(8),
        })
    }

    /// Checks that the payload described by this header fits in `region_len`
    pub fn validate(&self, region_len: usize) -> Result<(), IpcMsgError> {
        if region_len < IPC_MSG_HEADER_LEN {
            return Err(IpcMsgError::RegionTooSmall { len: region_len });
        }
        if (self.data_offset as usize) < IPC_MSG_HEADER_LEN {
            return Err(IpcMsgError::OffsetInHeader {
                offset: self.data_offset,
            });
        }
        let end = self.data_offset as u64 + self.data_len as u64;
        if end > region_len as u64 {
            return Err(IpcMsgError::PayloadOutOfBounds {
                offset: self.data_offset,
                len: self.data_len,
                region: region_len,
            });
        }
        Ok(())
    }

    /// Returns the payload slice of `region`
    pub fn data<'a>(&self, region: &'a [u8]) -> Result<&'a [u8], IpcMsgError> {
        self.validate(region.len())?;
        let start = self.data_offset as usize;
        Ok(&region[start..start + self.data_len as usize])
    }

    /// Writes the header and `payload` into `region`
    ///
    /// `data_len` is taken from the payload.
    pub fn write(mut self, region: &mut [u8], payload: &[u8]) -> Result<Self, IpcMsgError> {
        self.data_len = u32::try_from(payload.len()).map_err(|_| IpcMsgError::PayloadOutOfBounds {
            offset: self.data_offset,
            len: u32::MAX,
            region: region.len(),
        })?;
        self.validate(region.len())?;
        region[..IPC_MSG_HEADER_LEN].copy_from_slice(&self.to_bytes());
        let start = self.data_offset as usize;
        region[start..start + payload.len()].copy_from_slice(payload);
        Ok(self)
    }
}

impl Default for IpcMsg {
    fn default() -> Self {
        Self::new(0)
    }
}
