//! Error types for the kernel core
//!
//! Recoverable failures (bad arguments, exhaustion, lookup and access
//! failures) are values of [`KernError`] and travel up to the syscall
//! boundary, where [`KernError::code`] turns them into a [`KernReturn`].
//! Structural corruption is not represented here; see [`crate::panic`].

use thiserror::Error;

/// Kernel return code written back into the caller's return register
pub type KernReturn = i32;

// ============================================================================
// Return Codes
// ============================================================================

/// Success
pub const KERN_SUCCESS: KernReturn = 0;
/// Address outside the caller's legal range
pub const KERN_INVALID_ADDRESS: KernReturn = 1;
/// Access violates protection
pub const KERN_PROTECTION_FAILURE: KernReturn = 2;
/// No space
pub const KERN_NO_SPACE: KernReturn = 3;
/// Invalid argument
pub const KERN_INVALID_ARGUMENT: KernReturn = 4;
/// Invalid task
pub const KERN_INVALID_TASK: KernReturn = 5;
/// Resource shortage
pub const KERN_RESOURCE_SHORTAGE: KernReturn = 6;
/// Object is not in a state that allows the operation
pub const KERN_INVALID_STATE: KernReturn = 7;
/// Name already in use
pub const KERN_NAME_EXISTS: KernReturn = 13;
/// Lock or object was destroyed underneath the caller
pub const KERN_TERMINATED: KernReturn = 37;
/// Nobody is listening
pub const KERN_NO_RECEIVER: KernReturn = 40;
/// Message does not fit the receiver's buffer
pub const KERN_MSG_TOO_LARGE: KernReturn = 41;
/// Subsystem not initialized yet
pub const KERN_NOT_READY: KernReturn = 45;
/// Invalid thread
pub const KERN_INVALID_THREAD: KernReturn = 47;
/// Lock is held elsewhere
pub const KERN_LOCK_CONTENDED: KernReturn = 48;

// ============================================================================
// Error Enums
// ============================================================================

/// Failures of a gate acquisition
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateError {
    #[error("gate has self-destructed")]
    Destroyed,

    #[error("gate is held by another holder")]
    Contended,

    #[error("concurrent reader may not upgrade to writer")]
    UpgradeDenied,

    #[error("holder already has access through this gate")]
    Reentrant,
}

/// Recoverable kernel error
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernError {
    #[error("invalid argument")]
    InvalidArgument,

    #[error("address or size is not page aligned")]
    Misaligned,

    #[error("out of memory")]
    OutOfMemory,

    #[error("region overlaps an existing area")]
    AlreadyExists,

    #[error("access outside any area or against its protection")]
    BadAccess,

    #[error("buffer outside the legal address range")]
    BadAddress,

    #[error("no receiver")]
    NoReceiver,

    #[error("message of {len} bytes exceeds receiver maximum {max}")]
    MessageTooLarge { len: usize, max: usize },

    #[error("no such thread")]
    NoSuchThread,

    #[error("no such process")]
    NoSuchProcess,

    #[error("no such memory area")]
    NoSuchVma,

    #[error("object is in the wrong state")]
    InvalidState,

    #[error("kernel subsystem not initialized")]
    NotReady,

    #[error("gate: {0}")]
    Gate(#[from] GateError),
}

impl KernError {
    /// Numeric code for the syscall boundary
    pub fn code(&self) -> KernReturn {
        match self {
            KernError::InvalidArgument | KernError::Misaligned => KERN_INVALID_ARGUMENT,
            KernError::OutOfMemory => KERN_RESOURCE_SHORTAGE,
            KernError::AlreadyExists => KERN_NO_SPACE,
            KernError::BadAccess => KERN_PROTECTION_FAILURE,
            KernError::BadAddress => KERN_INVALID_ADDRESS,
            KernError::NoReceiver => KERN_NO_RECEIVER,
            KernError::MessageTooLarge { .. } => KERN_MSG_TOO_LARGE,
            KernError::NoSuchThread => KERN_INVALID_THREAD,
            KernError::NoSuchProcess => KERN_INVALID_TASK,
            KernError::NoSuchVma => KERN_INVALID_ADDRESS,
            KernError::InvalidState => KERN_INVALID_STATE,
            KernError::NotReady => KERN_NOT_READY,
            KernError::Gate(GateError::Destroyed) => KERN_TERMINATED,
            KernError::Gate(GateError::Contended) => KERN_LOCK_CONTENDED,
            KernError::Gate(GateError::UpgradeDenied | GateError::Reentrant) => {
                KERN_INVALID_STATE
            }
        }
    }
}

/// Result alias used throughout the core
pub type KernResult<T> = Result<T, KernError>;

/// Collapse a result into the code written back to user space
pub fn to_return(result: KernResult<()>) -> KernReturn {
    match result {
        Ok(()) => KERN_SUCCESS,
        Err(e) => e.code(),
    }
}
