//! Fatal kernel conditions
//!
//! Structural corruption and deadlock detection do not return errors: the
//! diagnostic is logged and the kernel halts. On a hosted build the halt is a
//! regular Rust panic so tests can observe it with `#[should_panic]`.

use thiserror::Error;

use crate::kern::lock::Holder;
use crate::types::ThreadId;

/// Reason for a kernel halt
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalReason {
    #[error("heap block at {addr:#x} has bad magic {magic:#x}")]
    HeapCorruption { addr: usize, magic: u32 },

    #[error("heap block at {addr:#x} freed twice")]
    DoubleFree { addr: usize },

    #[error("pointer {addr:#x} is outside the heap")]
    WildPointer { addr: usize },

    #[error("stale gate handle page {page} slot {slot}")]
    StaleGate { page: usize, slot: usize },

    #[error("gate deadline expired: {waiter:?} waiting on {owner:?}")]
    GateDeadline {
        waiter: Holder,
        owner: Option<Holder>,
    },

    #[error("boot environment failed sanity check")]
    BootSanity,

    #[error("scheduler state for {0} is inconsistent")]
    SchedulerCorruption(ThreadId),
}

/// Log the diagnostic and halt
#[cold]
#[track_caller]
pub fn fatal(reason: FatalReason) -> ! {
    let location = core::panic::Location::caller();
    log::error!(
        "KERNEL FATAL: {} at {}:{}",
        reason,
        location.file(),
        location.line()
    );
    panic!("kernel fatal: {}", reason);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "freed twice")]
    fn test_fatal_panics() {
        fatal(FatalReason::DoubleFree { addr: 0x1000 });
    }
}
