//! Lock Pool Allocator
//!
//! Gates for heap-managed structures are carved out of dedicated physical
//! pages instead of the general heap, because the heap itself is protected
//! by a gate. The pool list is guarded by `lock_lock`, a gate constructed in
//! place before any allocator exists; page zero is carved by
//! [`LockPool::bootstrap`] with raw memory writes.
//!
//! Each page holds [`GATES_PER_PAGE`] gate slots. A set bit in the page's
//! free map means the slot is free; the bit is the only source of truth for
//! liveness. Pages are never returned to the physical page service.

use core::mem::size_of;
use core::ptr::NonNull;

use crate::error::{KernError, KernResult};
use crate::hal::{PageFlags, PhysPageService};
use crate::kern::lock::{AsGate, Gate, GateCell, Holder};
use crate::panic::{fatal, FatalReason};
use crate::types::{PhysAddr, PAGE_SIZE};

// ============================================================================
// Constants
// ============================================================================

/// Gate slots per pool page (bounded by the 64-bit free map)
pub const GATES_PER_PAGE: usize = {
    let n = PAGE_SIZE / size_of::<Gate>();
    if n > 64 {
        64
    } else {
        n
    }
};

/// Most pool pages the pool will chain
pub const MAX_POOL_PAGES: usize = 64;

const FULL_MAP: u64 = if GATES_PER_PAGE == 64 {
    u64::MAX
} else {
    (1u64 << GATES_PER_PAGE) - 1
};

// ============================================================================
// Handles
// ============================================================================

/// Generation-checked address of a gate slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GateHandle {
    pub page: usize,
    pub slot: usize,
    pub generation: u32,
}

/// A gate living in a pool page
///
/// Not clonable: exactly one owner returns it through
/// [`LockPool::free_gate`].
#[derive(Debug)]
pub struct PooledGate {
    ptr: NonNull<Gate>,
    handle: GateHandle,
}

// The slot stays mapped for the kernel's lifetime and Gate is Sync
unsafe impl Send for PooledGate {}
unsafe impl Sync for PooledGate {}

impl PooledGate {
    pub fn handle(&self) -> GateHandle {
        self.handle
    }
}

impl AsGate for PooledGate {
    fn gate(&self) -> &Gate {
        // SAFETY: pool pages are never unmapped and the slot is live until
        // this value is consumed by free_gate
        unsafe { self.ptr.as_ref() }
    }
}

// ============================================================================
// Pool Pages
// ============================================================================

struct PoolPage {
    phys: PhysAddr,
    base: *mut Gate,
    free_map: u64,
    free: usize,
    /// Last slot returned; tried first on the next allocation
    last_free: usize,
    generations: [u32; GATES_PER_PAGE],
}

// Only reached under lock_lock
unsafe impl Send for PoolPage {}
unsafe impl Sync for PoolPage {}

impl PoolPage {
    fn carve(phys: &dyn PhysPageService) -> KernResult<Self> {
        let frame =
            phys.alloc_phys_page(PageFlags::NO_CACHE | PageFlags::NO_BUFFER | PageFlags::ZERO)?;
        let base = phys.phys_to_virt(frame) as *mut Gate;
        if base.is_null() {
            return Err(KernError::OutOfMemory);
        }
        for slot in 0..GATES_PER_PAGE {
            // SAFETY: the frame is PAGE_SIZE bytes, page aligned, and holds
            // GATES_PER_PAGE gates
            unsafe { base.add(slot).write(Gate::new()) };
        }
        Ok(Self {
            phys: frame,
            base,
            free_map: FULL_MAP,
            free: GATES_PER_PAGE,
            last_free: 0,
            generations: [0; GATES_PER_PAGE],
        })
    }

    fn is_free(&self, slot: usize) -> bool {
        self.free_map & (1u64 << slot) != 0
    }

    fn take_slot(&mut self) -> Option<usize> {
        if self.free == 0 {
            return None;
        }
        let slot = if self.is_free(self.last_free) {
            self.last_free
        } else {
            self.free_map.trailing_zeros() as usize
        };
        self.free_map &= !(1u64 << slot);
        self.free -= 1;
        Some(slot)
    }
}

/// Pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPoolStats {
    pub pages: usize,
    pub capacity: usize,
    pub live: usize,
}

// ============================================================================
// Lock Pool
// ============================================================================

/// Bitmap allocator of gates on uncached pages
pub struct LockPool {
    /// Page records; the cell's own gate is `lock_lock`
    pages: GateCell<heapless::Vec<PoolPage, MAX_POOL_PAGES>>,
}

impl LockPool {
    pub const fn new() -> Self {
        Self {
            pages: GateCell::new(heapless::Vec::new()),
        }
    }

    /// The hand-built gate guarding the pool list
    pub fn lock_lock(&self) -> &Gate {
        self.pages.gate()
    }

    /// Carve page zero
    pub fn bootstrap(&self, phys: &dyn PhysPageService, holder: Holder) -> KernResult<()> {
        let mut pages = self.pages.write(holder)?;
        if !pages.is_empty() {
            return Err(KernError::InvalidState);
        }
        let page = PoolPage::carve(phys)?;
        let frame = page.phys;
        pages.push(page).map_err(|_| KernError::OutOfMemory)?;
        log::info!(
            "lock pool: page zero at {}, {} gates per page",
            frame,
            GATES_PER_PAGE
        );
        Ok(())
    }

    /// Allocate a fresh, unowned gate
    ///
    /// Scans the chained pages for a free slot and appends a new page when
    /// all are full.
    pub fn alloc_gate(&self, phys: &dyn PhysPageService, holder: Holder) -> KernResult<PooledGate> {
        let mut pages = self.pages.write(holder)?;
        if pages.is_empty() {
            return Err(KernError::NotReady);
        }

        let index = match pages.iter().position(|p| p.free > 0) {
            Some(index) => index,
            None => {
                if pages.is_full() {
                    return Err(KernError::OutOfMemory);
                }
                let page = PoolPage::carve(phys)?;
                log::debug!("lock pool: chained page {} at {}", pages.len(), page.phys);
                pages.push(page).map_err(|_| KernError::OutOfMemory)?;
                pages.len() - 1
            }
        };

        let page = &mut pages[index];
        let slot = page.take_slot().ok_or(KernError::OutOfMemory)?;
        // SAFETY: slot < GATES_PER_PAGE inside a live pool page
        let ptr = unsafe { page.base.add(slot) };
        // SAFETY: the slot was free, so nothing references the old gate
        unsafe { ptr.write(Gate::new()) };

        let ptr = NonNull::new(ptr).ok_or(KernError::OutOfMemory)?;
        Ok(PooledGate {
            ptr,
            handle: GateHandle {
                page: index,
                slot,
                generation: page.generations[slot],
            },
        })
    }

    /// Return a gate to the pool
    ///
    /// The gate self-destructs first, so late acquirers fail instead of
    /// taking a recycled slot. Waits for current holders to drain.
    pub fn free_gate(&self, gate: PooledGate, holder: Holder) -> KernResult<()> {
        let handle = gate.handle;
        self.verify(handle, holder)?;
        if gate.gate().is_held_by(holder) {
            return Err(KernError::InvalidState);
        }

        gate.gate().destroy();
        while !gate.gate().is_idle() {
            core::hint::spin_loop();
        }

        let mut pages = self.pages.write(holder)?;
        let page = &mut pages[handle.page];
        page.free_map |= 1u64 << handle.slot;
        page.free += 1;
        page.last_free = handle.slot;
        page.generations[handle.slot] = page.generations[handle.slot].wrapping_add(1);
        Ok(())
    }

    /// Halt on a handle whose slot has been freed or reused
    pub fn verify(&self, handle: GateHandle, holder: Holder) -> KernResult<()> {
        let pages = self.pages.read(holder)?;
        let live = pages.get(handle.page).is_some_and(|page| {
            handle.slot < GATES_PER_PAGE
                && !page.is_free(handle.slot)
                && page.generations[handle.slot] == handle.generation
        });
        if !live {
            fatal(FatalReason::StaleGate {
                page: handle.page,
                slot: handle.slot,
            });
        }
        Ok(())
    }

    pub fn stats(&self, holder: Holder) -> KernResult<LockPoolStats> {
        let pages = self.pages.read(holder)?;
        let free: usize = pages.iter().map(|p| p.free).sum();
        Ok(LockPoolStats {
            pages: pages.len(),
            capacity: pages.len() * GATES_PER_PAGE,
            live: pages.len() * GATES_PER_PAGE - free,
        })
    }
}

impl Default for LockPool {
    fn default() -> Self {
        Self::new()
    }
}
