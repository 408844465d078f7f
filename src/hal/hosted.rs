//! Hosted platform
//!
//! Boundary services backed by the process allocator. Physical addresses are
//! host addresses, so the direct map is the identity. Page-table and IPI
//! requests are recorded for inspection instead of touching hardware.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::collections::BTreeSet;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::boot::{BootEnvironment, BootModule, HeapWindow, MemoryKind, MemoryRegion};
use crate::error::{KernError, KernResult};
use crate::hal::{IpiService, PageFlags, PageTableService, PhysPageService, Platform};
use crate::types::{align_up, CpuId, PhysAddr, ProcessId, VirtAddr, PAGE_SIZE};

fn page_layout(pages: usize) -> KernResult<Layout> {
    Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).map_err(|_| KernError::InvalidArgument)
}

// ============================================================================
// Physical Pages
// ============================================================================

/// Frame allocator on top of the global allocator
pub struct HostedPhysPages {
    live: Mutex<BTreeSet<usize>>,
    limit: Option<usize>,
}

impl HostedPhysPages {
    pub fn new() -> Self {
        Self {
            live: Mutex::new(BTreeSet::new()),
            limit: None,
        }
    }

    /// Refuse allocations beyond `pages` live frames
    pub fn with_limit(pages: usize) -> Self {
        Self {
            live: Mutex::new(BTreeSet::new()),
            limit: Some(pages),
        }
    }

    pub fn allocated(&self) -> usize {
        self.live.lock().len()
    }

    pub fn is_allocated(&self, page: PhysAddr) -> bool {
        self.live.lock().contains(&page.0)
    }
}

impl Default for HostedPhysPages {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysPageService for HostedPhysPages {
    fn alloc_phys_page(&self, _flags: PageFlags) -> KernResult<PhysAddr> {
        let mut live = self.live.lock();
        if let Some(limit) = self.limit {
            if live.len() >= limit {
                return Err(KernError::OutOfMemory);
            }
        }
        let layout = page_layout(1)?;
        // SAFETY: layout has non-zero size
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(KernError::OutOfMemory);
        }
        live.insert(ptr as usize);
        Ok(PhysAddr(ptr as usize))
    }

    fn free_phys_page(&self, page: PhysAddr) {
        if !self.live.lock().remove(&page.0) {
            log::warn!("free of unknown frame {}", page);
            return;
        }
        if let Ok(layout) = page_layout(1) {
            // SAFETY: the frame came from alloc_zeroed with this layout
            unsafe { dealloc(page.0 as *mut u8, layout) };
        }
    }

    fn phys_to_virt(&self, page: PhysAddr) -> *mut u8 {
        page.0 as *mut u8
    }
}

impl Drop for HostedPhysPages {
    fn drop(&mut self) {
        if let Ok(layout) = page_layout(1) {
            for &addr in self.live.lock().iter() {
                // SAFETY: every live entry came from alloc_zeroed
                unsafe { dealloc(addr as *mut u8, layout) };
            }
        }
    }
}

// ============================================================================
// Page Tables and IPIs
// ============================================================================

/// A page-table request issued by the VMA layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageTableOp {
    Unmap { pid: ProcessId, virt: VirtAddr },
    WriteProtect { pid: ProcessId, virt: VirtAddr },
    Flush { pid: ProcessId, base: VirtAddr, len: usize },
}

/// Records page-table requests
#[derive(Default)]
pub struct RecordingPageTables {
    ops: Mutex<Vec<PageTableOp>>,
}

impl RecordingPageTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> Vec<PageTableOp> {
        self.ops.lock().clone()
    }

    /// Drain the recorded requests
    pub fn take(&self) -> Vec<PageTableOp> {
        core::mem::take(&mut *self.ops.lock())
    }
}

impl PageTableService for RecordingPageTables {
    fn unmap_page(&self, pid: ProcessId, virt: VirtAddr) {
        self.ops.lock().push(PageTableOp::Unmap { pid, virt });
    }

    fn write_protect(&self, pid: ProcessId, virt: VirtAddr) {
        self.ops.lock().push(PageTableOp::WriteProtect { pid, virt });
    }

    fn flush_tlb(&self, pid: ProcessId, base: VirtAddr, len: usize) {
        self.ops.lock().push(PageTableOp::Flush { pid, base, len });
    }
}

/// Records reschedule IPIs
#[derive(Default)]
pub struct RecordingIpi {
    sent: Mutex<Vec<CpuId>>,
}

impl RecordingIpi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<CpuId> {
        self.sent.lock().clone()
    }
}

impl IpiService for RecordingIpi {
    fn request_reschedule(&self, cpu: CpuId) {
        self.sent.lock().push(cpu);
    }
}

// ============================================================================
// Heap Window
// ============================================================================

/// Contiguous, page-aligned region reserved for the kernel heap
pub struct HostedHeapWindow {
    base: *mut u8,
    len: usize,
}

// The window is plain memory owned by this value
unsafe impl Send for HostedHeapWindow {}
unsafe impl Sync for HostedHeapWindow {}

impl HostedHeapWindow {
    pub fn reserve(len: usize) -> KernResult<Self> {
        let len = align_up(len.max(PAGE_SIZE), PAGE_SIZE);
        let layout = page_layout(len / PAGE_SIZE)?;
        // SAFETY: layout has non-zero size
        let base = unsafe { alloc_zeroed(layout) };
        if base.is_null() {
            return Err(KernError::OutOfMemory);
        }
        Ok(Self { base, len })
    }

    pub fn window(&self) -> HeapWindow {
        HeapWindow {
            base: VirtAddr(self.base as usize),
            len: self.len,
        }
    }
}

impl Drop for HostedHeapWindow {
    fn drop(&mut self) {
        if let Ok(layout) = page_layout(self.len / PAGE_SIZE) {
            // SAFETY: allocated in reserve() with the same layout
            unsafe { dealloc(self.base, layout) };
        }
    }
}

// ============================================================================
// Bundle
// ============================================================================

/// Every hosted service plus a heap window
///
/// Keep this alive for as long as the kernel built from it.
pub struct HostedPlatform {
    pub phys: Arc<HostedPhysPages>,
    pub page_tables: Arc<RecordingPageTables>,
    pub ipi: Arc<RecordingIpi>,
    pub heap: HostedHeapWindow,
}

impl HostedPlatform {
    pub fn new(heap_len: usize) -> KernResult<Self> {
        Ok(Self {
            phys: Arc::new(HostedPhysPages::new()),
            page_tables: Arc::new(RecordingPageTables::new()),
            ipi: Arc::new(RecordingIpi::new()),
            heap: HostedHeapWindow::reserve(heap_len)?,
        })
    }

    pub fn with_page_limit(heap_len: usize, pages: usize) -> KernResult<Self> {
        let mut hosted = Self::new(heap_len)?;
        hosted.phys = Arc::new(HostedPhysPages::with_limit(pages));
        Ok(hosted)
    }

    pub fn platform(&self) -> Platform {
        Platform::new(self.phys.clone(), self.page_tables.clone(), self.ipi.clone())
    }

    /// Boot descriptor whose only usable region is the heap window
    pub fn boot_environment(&self) -> BootEnvironment {
        let window = self.heap.window();
        BootEnvironment {
            memory_map: vec![MemoryRegion {
                base: window.base.0,
                length: window.len,
                kind: MemoryKind::Usable,
            }],
            modules: vec![BootModule {
                start: 0,
                end: 0,
                name: String::from("none"),
            }],
            page_size: PAGE_SIZE,
            flags: 0,
            heap_window: window,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phys_pages() {
        let phys = HostedPhysPages::with_limit(2);
        let a = phys.alloc_phys_page(PageFlags::ZERO).unwrap();
        let b = phys.alloc_phys_page(PageFlags::NO_CACHE).unwrap();
        assert!(a.is_page_aligned());
        assert_ne!(a, b);
        assert_eq!(phys.alloc_phys_page(PageFlags::empty()), Err(KernError::OutOfMemory));

        // SAFETY: hosted frames are identity mapped host memory
        let first = unsafe { *phys.phys_to_virt(a) };
        assert_eq!(first, 0);

        phys.free_phys_page(a);
        assert!(!phys.is_allocated(a));
        assert_eq!(phys.allocated(), 1);
        assert!(phys.alloc_phys_page(PageFlags::empty()).is_ok());
    }

    #[test]
    fn test_recorders() {
        let tables = RecordingPageTables::new();
        tables.unmap_page(ProcessId(1), VirtAddr(0x1000));
        tables.flush_tlb(ProcessId(1), VirtAddr(0x1000), PAGE_SIZE);
        assert_eq!(tables.take().len(), 2);
        assert!(tables.ops().is_empty());

        let ipi = RecordingIpi::new();
        ipi.request_reschedule(CpuId(3));
        assert_eq!(ipi.sent(), vec![CpuId(3)]);
    }

    #[test]
    fn test_boot_environment_validates() {
        let hosted = HostedPlatform::new(8 * PAGE_SIZE).unwrap();
        let env = hosted.boot_environment();
        assert!(env.validate().is_ok());
        assert_eq!(env.heap_window.len, 8 * PAGE_SIZE);
    }
}
