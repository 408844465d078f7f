//! Kern subsystem - Core kernel primitives
//!
//! Based on Mach4 kern/ directory
//! Contains the gate lock and its pool, the kernel heap and record pools,
//! processor descriptors, scheduling, processes and kernel startup.

pub mod kheap;
pub mod kpool;
pub mod lock;
pub mod lock_pool;
pub mod priority;
pub mod process;
pub mod processor;
pub mod runq;
pub mod sched;
pub mod startup;
pub mod thread;

pub use kheap::{Heap, HeapStats, KernelAllocator, KERNEL_ALLOCATOR};
pub use kpool::{GrowReport, Pool, PoolSlot};
pub use lock::{AsGate, Gate, GateCell, GateFlags, GateMode, Holder, SimpleLock};
pub use lock_pool::{GateHandle, LockPool, LockPoolStats, PooledGate};
pub use priority::Priority;
pub use process::{Process, ProcessRights, ProcessTable};
pub use processor::CpuDescriptor;
pub use runq::RunQueue;
pub use sched::Scheduler;
pub use startup::{InitPhase, IrqDriver, Kernel};
pub use thread::{BlockReason, Registers, Thread, ThreadInfo, ThreadState};
