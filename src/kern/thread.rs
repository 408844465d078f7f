//! Thread Management
//!
//! Based on Mach4 kern/thread.h/c by Avadis Tevanian, Jr.
//!
//! A thread belongs to exactly one process, which provides its address
//! space. Threads live in the scheduler's thread table; everything here is
//! plain data mutated under that table's gate.
//!
//! ## State machine
//!
//! ```text
//! Ready -> Running -> Ready            (preempted, yielded)
//!                  -> Blocked(reason)  (send, receive, reply wait, sleep)
//!                  -> Dead             (exit; reaped later)
//! Blocked -> Ready                     (wake)
//! ```

use alloc::vec::Vec;

use crate::kern::priority::Priority;
use crate::types::{CpuId, ProcessId, ThreadId, VirtAddr};

/// Why a thread is off the run queues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// Waiting for a message to arrive
    Receive,
    /// Message queued, no receiver has taken it yet
    Send,
    /// Sent a message and waits for the reply
    Reply,
    /// Sleeping until the CPU's tick counter reaches `until`
    Sleep { until: u64 },
    /// Held back by its creator or the executive
    Suspended,
}

/// Scheduling state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    Blocked(BlockReason),
    Dead,
}

impl ThreadState {
    pub fn is_runnable(self) -> bool {
        matches!(self, ThreadState::Ready | ThreadState::Running)
    }

    pub fn is_dead(self) -> bool {
        self == ThreadState::Dead
    }
}

/// Portable register block
///
/// The architecture layer copies the trap frame into this on entry and back
/// out on return; the scheduler swaps whole blocks on a context switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Registers {
    pub pc: usize,
    pub sp: usize,
    /// Argument registers; `args[0]` also carries syscall results
    pub args: [usize; 6],
    pub flags: usize,
}

impl Registers {
    pub const fn entry(pc: usize, sp: usize) -> Self {
        Self {
            pc,
            sp,
            args: [0; 6],
            flags: 0,
        }
    }
}

/// A thread control block
#[derive(Debug, Clone)]
pub struct Thread {
    pub id: ThreadId,
    pub pid: ProcessId,
    pub state: ThreadState,
    pub priority: Priority,
    /// CPU this thread last ran on, or is queued on
    pub cpu: CpuId,
    /// CPU to move to once `cpu` has saved the registers it still holds
    pub migrate: Option<CpuId>,
    pub regs: Registers,
    /// Ticks left in the current timeslice
    pub slice: u32,
    pub stack_base: VirtAddr,
    /// Saved floating-point area, allocated on first use by the arch layer
    pub fp_state: Option<VirtAddr>,
    /// IRQ lines this thread drives
    pub irq_lines: Vec<u32>,
}

impl Thread {
    pub fn new(
        id: ThreadId,
        pid: ProcessId,
        cpu: CpuId,
        priority: Priority,
        regs: Registers,
        stack_base: VirtAddr,
    ) -> Self {
        Self {
            id,
            pid,
            state: ThreadState::Ready,
            priority,
            cpu,
            migrate: None,
            regs,
            slice: 0,
            stack_base,
            fp_state: None,
            irq_lines: Vec::new(),
        }
    }
}

/// Snapshot of a thread for callers outside the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub pid: ProcessId,
    pub state: ThreadState,
    pub priority: Priority,
    pub cpu: CpuId,
    pub stack_base: VirtAddr,
}

impl From<&Thread> for ThreadInfo {
    fn from(t: &Thread) -> Self {
        Self {
            id: t.id,
            pid: t.pid,
            state: t.state,
            priority: t.priority,
            cpu: t.cpu,
            stack_base: t.stack_base,
        }
    }
}
