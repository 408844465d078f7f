//! Hardware abstraction boundary
//!
//! The core never touches page tables, physical frame bitmaps or interrupt
//! controllers itself. Those live in architecture code, reached through the
//! traits below. [`hosted`] provides implementations on top of `alloc` so the
//! core runs in an ordinary process.

use alloc::sync::Arc;

use bitflags::bitflags;

use crate::error::KernResult;
use crate::types::{CpuId, PhysAddr, ProcessId, VirtAddr};

pub mod hosted;

bitflags! {
    /// Preferences for a physical page request
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFlags: u32 {
        /// Map uncached (lock pages, device memory)
        const NO_CACHE = 1 << 0;
        /// Disable write buffering
        const NO_BUFFER = 1 << 1;
        /// Hand the page out zero-filled
        const ZERO = 1 << 2;
    }
}

/// Physical frame allocator
pub trait PhysPageService: Send + Sync {
    /// Allocate one page-aligned frame
    fn alloc_phys_page(&self, flags: PageFlags) -> KernResult<PhysAddr>;

    /// Return a frame obtained from `alloc_phys_page`
    fn free_phys_page(&self, page: PhysAddr);

    /// Kernel direct-map address of a frame
    fn phys_to_virt(&self, page: PhysAddr) -> *mut u8;
}

/// Page-table editing performed on behalf of the VMA layer
pub trait PageTableService: Send + Sync {
    fn unmap_page(&self, pid: ProcessId, virt: VirtAddr);

    /// Drop write permission so the next write faults (copy-on-write)
    fn write_protect(&self, pid: ProcessId, virt: VirtAddr);

    fn flush_tlb(&self, pid: ProcessId, base: VirtAddr, len: usize);
}

/// Inter-processor interrupts
pub trait IpiService: Send + Sync {
    /// Ask `cpu` to re-pick at its next safe point
    fn request_reschedule(&self, cpu: CpuId);
}

/// Service handles the kernel is constructed with
#[derive(Clone)]
pub struct Platform {
    pub phys: Arc<dyn PhysPageService>,
    pub page_tables: Arc<dyn PageTableService>,
    pub ipi: Arc<dyn IpiService>,
}

impl Platform {
    pub fn new(
        phys: Arc<dyn PhysPageService>,
        page_tables: Arc<dyn PageTableService>,
        ipi: Arc<dyn IpiService>,
    ) -> Self {
        Self {
            phys,
            page_tables,
            ipi,
        }
    }
}

impl core::fmt::Debug for Platform {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Platform").finish_non_exhaustive()
    }
}
