//! # Inter-Process Communication (IPC) wire format
//!
//! This crate defines the user/kernel contract of the synchronous IPC path.
//!
//! ## Philosophy
//!
//! - **Shared memory for data, kernel for control**: the payload travels in a
//!   per-connection shared memory region; the kernel only moves control and
//!   capabilities
//! - **Fixed header**: every message starts with an [`IpcMsg`] header that the
//!   kernel can parse without trusting the rest of the buffer
//! - **Bounded transfer**: at most [`MAX_CAP_TRANSFER`] capabilities per call
//!
//! ## Architecture
//!
//! A client registers with a server and receives a connection capability.
//! Each call writes an [`IpcMsg`] into the shared region, declares the caps
//! to send with [`CapTransfer`] entries and hands the CPU to the server's
//! handler thread. The handler answers in place and hands the CPU back.

pub mod message;
pub mod shm;

pub use message::{IpcMsg, IpcMsgError, IPC_MSG_DEFAULT_DATA_OFFSET, IPC_MSG_HEADER_LEN};
pub use shm::{CapTransfer, IpcVmConfig, VmConfigTruncated, CONN_IPC_SERVER, MAX_CAP_TRANSFER};
