//! # Core Types
//!
//! This crate defines the fundamental vocabulary shared by the kernel core
//! and everything that talks to it.
//!
//! ## Philosophy
//!
//! - **Explicit over implicit**: capabilities are slot numbers with rights, never
//!   raw object pointers.
//! - **Type safety first**: identifiers are newtypes and cannot be confused.
//! - **No ambient authority**: every operation names the capability it uses.
//!
//! ## Key Types
//!
//! - [`CapId`]: a capability number (slot index) inside one cap group
//! - [`CapRights`]: the rights mask carried by a slot
//! - [`ObjectType`]: the closed set of kernel object types
//! - [`ObjectId`], [`Badge`], [`CpuId`]: global identifiers

pub mod capability;
pub mod ids;
pub mod rights;

pub use capability::{CapabilityError, CapabilityEvent, ObjectType};
pub use ids::{Badge, CapId, CpuId, ObjectId, ThreadId};
pub use rights::{cap_rights_change, cap_rights_contain, CapRights};
