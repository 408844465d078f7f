//! kcore - portable microkernel core
//!
//! The architecture-independent heart of a small microkernel: a reentrant
//! readers-writer gate and the page pool it is allocated from, a kernel heap
//! with fixed-record pools on top, per-process VMA trees with copy-on-write
//! fault resolution, per-CPU priority scheduling, and synchronous message
//! passing with asynchronous signals.
//!
//! Architecture code supplies the services in [`hal`], builds a
//! [`Kernel`], and drives it through [`Kernel::bootstrap`] and
//! [`Kernel::init`].

#![cfg_attr(not(test), no_std)]
// Kernel-appropriate clippy configuration
// Hardware register code often uses explicit bit shifts for documentation
#![allow(clippy::identity_op)]
// Manual ceiling division is clearer in memory allocation contexts
#![allow(clippy::manual_div_ceil)]

extern crate alloc;

// Core types
pub mod config;
pub mod error;
pub mod types;

// Boot handoff and fatal halts
pub mod boot;
pub mod panic;

// Boundary services
pub mod hal;

// Subsystems
pub mod ipc;
pub mod kern;
pub mod vm;

pub use config::KernelConfig;
pub use error::{GateError, KernError, KernResult};
pub use kern::{Holder, InitPhase, Kernel};

/// Kernel version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Kernel name
pub const NAME: &str = "kcore";
