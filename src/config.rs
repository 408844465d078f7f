//! Kernel configuration
//!
//! Tunables fixed at kernel construction time. The embedding layer builds a
//! [`KernelConfig`] (usually from the defaults plus a few `with_*` calls) and
//! hands it to [`crate::kern::startup::Kernel::new`].

use crate::error::{KernError, KernResult};
use crate::types::PAGE_SIZE;

/// Default number of scheduler priority levels
pub const SCHED_PRIORITY_MAX: usize = 32;

/// Upper bound on configurable CPUs
pub const MAX_CPUS: usize = 64;

/// Kernel tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Number of CPUs the scheduler manages
    pub cpus: usize,
    /// Number of priority levels; valid priorities are `0..sched_priorities`
    pub sched_priorities: usize,
    /// Priority given to threads that do not ask for one
    pub default_priority: usize,
    /// Timer ticks in one timeslice
    pub timeslice_ticks: u32,
    /// Heap minimum block size (power of two, at least 16)
    pub heap_min_block: usize,
    /// Bytes the heap claims from its window at init
    pub heap_initial: usize,
    /// Heap headroom a creating call must find before it commits anything
    pub heap_reserve: usize,
    /// Initial mapping records per VMA
    pub mapping_pool_initial: usize,
    /// Largest IPC payload a receiver may declare
    pub max_message_bytes: usize,
}

impl KernelConfig {
    pub const fn new() -> Self {
        Self {
            cpus: 1,
            sched_priorities: SCHED_PRIORITY_MAX,
            default_priority: SCHED_PRIORITY_MAX / 2,
            timeslice_ticks: 4,
            heap_min_block: 32,
            heap_initial: 16 * PAGE_SIZE,
            heap_reserve: 1024,
            mapping_pool_initial: 2,
            max_message_bytes: 4 * PAGE_SIZE,
        }
    }

    pub const fn with_cpus(mut self, cpus: usize) -> Self {
        self.cpus = cpus;
        self
    }

    pub const fn with_priorities(mut self, levels: usize, default: usize) -> Self {
        self.sched_priorities = levels;
        self.default_priority = default;
        self
    }

    pub const fn with_timeslice(mut self, ticks: u32) -> Self {
        self.timeslice_ticks = ticks;
        self
    }

    pub const fn with_heap(mut self, min_block: usize, initial: usize) -> Self {
        self.heap_min_block = min_block;
        self.heap_initial = initial;
        self
    }

    pub const fn with_heap_reserve(mut self, bytes: usize) -> Self {
        self.heap_reserve = bytes;
        self
    }

    pub const fn with_mapping_pool(mut self, initial: usize) -> Self {
        self.mapping_pool_initial = initial;
        self
    }

    pub const fn with_max_message(mut self, bytes: usize) -> Self {
        self.max_message_bytes = bytes;
        self
    }

    /// Check the tunables for consistency
    pub fn validate(&self) -> KernResult<()> {
        if self.cpus == 0 || self.cpus > MAX_CPUS {
            return Err(KernError::InvalidArgument);
        }
        if self.sched_priorities == 0 || self.default_priority >= self.sched_priorities {
            return Err(KernError::InvalidArgument);
        }
        if self.timeslice_ticks == 0 {
            return Err(KernError::InvalidArgument);
        }
        if !self.heap_min_block.is_power_of_two()
            || self.heap_min_block < 16
            || self.heap_min_block > PAGE_SIZE
        {
            return Err(KernError::InvalidArgument);
        }
        if self.mapping_pool_initial == 0 || self.max_message_bytes == 0 {
            return Err(KernError::InvalidArgument);
        }
        Ok(())
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}
