//! # Hardware Abstraction Layer (HAL)
//!
//! This crate defines the hardware traits the kernel core consumes.
//!
//! ## Philosophy
//!
//! **Architecture must be fully abstracted and swappable.**
//!
//! The kernel core only needs a monotonic tick source and a way to ask for
//! the next timer interrupt. Boot code, MMU and interrupt controllers are
//! provided by architecture crates and are not modelled here.

pub mod timer;

pub use timer::TimerDevice;
