//! Kernel Heap
//!
//! First-fit free-list allocator over the contiguous heap window handed over
//! at boot. Memory below `top` is carved into blocks; each block is a
//! [`BlockHeader`] padded to the minimum block size, followed by data whose
//! capacity is a multiple of that size. Free blocks form a doubly linked list
//! sorted by address, which makes neighbour coalescing a local operation.
//!
//! When no free block fits, the heap extends `top` by whole pages until the
//! window is exhausted.
//!
//! A header whose magic is neither FREE nor INUSE means something scribbled
//! over heap metadata. That is fatal, as is freeing a block twice.
//!
//! [`KernelAllocator`] puts the heap behind `alloc`, so that thread tables,
//! VMA trees and message buffers come out of the heap window too. With the
//! `global-heap` feature it is registered as the global allocator.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::alloc::{GlobalAlloc, Layout};
use core::mem::size_of;
use core::ptr::{self, null_mut, NonNull};

use spin::{Mutex, Once};

use crate::boot::HeapWindow;
use crate::error::{KernError, KernResult};
use crate::kern::lock::{GateCell, Holder};
use crate::kern::lock_pool::PooledGate;
use crate::panic::{fatal, FatalReason};
use crate::types::{align_up, PAGE_SIZE};

// ============================================================================
// Block Header
// ============================================================================

const MAGIC_FREE: u32 = 0xF4EE_B10C;
const MAGIC_INUSE: u32 = 0x1A5E_B10C;

#[repr(C)]
struct BlockHeader {
    magic: u32,
    _reserved: u32,
    /// Bytes requested by the caller
    inuse: usize,
    /// Data bytes, a multiple of the minimum block size
    capacity: usize,
    /// Free-list links (0 = none); unused while the block is in use
    prev: usize,
    next: usize,
}

#[inline]
fn header(addr: usize) -> *mut BlockHeader {
    addr as *mut BlockHeader
}

/// A free block as reported by [`Heap::free_list`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
    pub addr: usize,
    pub capacity: usize,
}

/// Heap occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    /// Size of the reserved window
    pub window: usize,
    /// Bytes below `top`
    pub mapped: usize,
    pub free_blocks: usize,
    pub free_bytes: usize,
    pub inuse_blocks: usize,
    pub inuse_bytes: usize,
    pub extensions: usize,
}

// ============================================================================
// Heap Internals
// ============================================================================

struct HeapInner {
    base: usize,
    top: usize,
    end: usize,
    min_block: usize,
    hdr_span: usize,
    free_head: usize,
    inuse_blocks: usize,
    inuse_bytes: usize,
    extensions: usize,
}

impl HeapInner {
    fn block_end(&self, addr: usize) -> usize {
        // SAFETY: addr is a block header below top
        addr + self.hdr_span + unsafe { (*header(addr)).capacity }
    }

    /// Validate a user pointer and return its block address
    fn block_of(&self, ptr: usize) -> usize {
        if ptr < self.base + self.hdr_span || ptr >= self.top {
            fatal(FatalReason::WildPointer { addr: ptr });
        }
        let addr = ptr - self.hdr_span;
        if (addr - self.base) % self.min_block != 0 {
            fatal(FatalReason::WildPointer { addr: ptr });
        }
        // SAFETY: addr lies inside the mapped part of the window
        let magic = unsafe { (*header(addr)).magic };
        match magic {
            MAGIC_INUSE => addr,
            MAGIC_FREE => fatal(FatalReason::DoubleFree { addr }),
            other => fatal(FatalReason::HeapCorruption { addr, magic: other }),
        }
    }

    fn unlink(&mut self, addr: usize) {
        // SAFETY: addr and its neighbours are free block headers
        unsafe {
            let h = header(addr);
            let (prev, next) = ((*h).prev, (*h).next);
            if prev != 0 {
                (*header(prev)).next = next;
            } else {
                self.free_head = next;
            }
            if next != 0 {
                (*header(next)).prev = prev;
            }
            (*h).prev = 0;
            (*h).next = 0;
        }
    }

    /// Put `[addr, addr + hdr_span + capacity)` on the free list, merging
    /// with free neighbours
    fn insert_free(&mut self, addr: usize, capacity: usize) {
        let mut prev = 0;
        let mut cur = self.free_head;
        // SAFETY: every address walked is a free block header
        unsafe {
            while cur != 0 && cur < addr {
                prev = cur;
                cur = (*header(cur)).next;
            }

            let h = header(addr);
            (*h).magic = MAGIC_FREE;
            (*h).inuse = 0;
            (*h).capacity = capacity;
            (*h).prev = prev;
            (*h).next = cur;
            if prev != 0 {
                (*header(prev)).next = addr;
            } else {
                self.free_head = addr;
            }
            if cur != 0 {
                (*header(cur)).prev = addr;
            }

            if cur != 0 && self.block_end(addr) == cur {
                let absorbed = (*header(cur)).capacity;
                self.unlink(cur);
                (*header(cur)).magic = 0;
                (*h).capacity += self.hdr_span + absorbed;
            }
            if prev != 0 && self.block_end(prev) == addr {
                let absorbed = (*h).capacity;
                self.unlink(addr);
                (*h).magic = 0;
                (*header(prev)).capacity += self.hdr_span + absorbed;
            }
        }
    }

    fn first_fit(&self, need: usize) -> Option<usize> {
        let mut cur = self.free_head;
        while cur != 0 {
            // SAFETY: cur is a free block header
            let h = unsafe { &*header(cur) };
            if h.capacity >= need {
                return Some(cur);
            }
            cur = h.next;
        }
        None
    }

    /// Shrink an in-use block to `need`, returning the surplus to the free
    /// list when it can hold a block of its own
    fn trim(&mut self, addr: usize, need: usize) {
        // SAFETY: addr is an in-use block header
        let capacity = unsafe { (*header(addr)).capacity };
        if capacity - need >= self.hdr_span + self.min_block {
            unsafe { (*header(addr)).capacity = need };
            let rest = addr + self.hdr_span + need;
            self.insert_free(rest, capacity - need - self.hdr_span);
        }
    }

    fn take(&mut self, addr: usize, need: usize, size: usize) -> usize {
        self.unlink(addr);
        // SAFETY: addr is a block header just removed from the free list
        unsafe {
            (*header(addr)).magic = MAGIC_INUSE;
            (*header(addr)).inuse = size;
        }
        self.trim(addr, need);
        self.inuse_blocks += 1;
        self.inuse_bytes += size;
        addr + self.hdr_span
    }

    /// Move `top` up to make room for at least `bytes` more
    fn extend(&mut self, bytes: usize) -> KernResult<()> {
        let remaining = self.end - self.top;
        let mut grow = align_up(bytes, PAGE_SIZE);
        if grow > remaining {
            grow = remaining;
        }
        if grow < self.hdr_span + self.min_block {
            return Err(KernError::OutOfMemory);
        }
        let at = self.top;
        self.top += grow;
        self.extensions += 1;
        self.insert_free(at, grow - self.hdr_span);
        log::debug!("kheap: extended by {:#x} to top {:#x}", grow, self.top);
        Ok(())
    }

    fn alloc(&mut self, size: usize) -> KernResult<usize> {
        if size == 0 {
            return Err(KernError::InvalidArgument);
        }
        if size > self.end - self.base {
            return Err(KernError::OutOfMemory);
        }
        let need = align_up(size, self.min_block);

        if let Some(addr) = self.first_fit(need) {
            return Ok(self.take(addr, need, size));
        }
        self.extend(self.hdr_span + need)?;
        match self.first_fit(need) {
            Some(addr) => Ok(self.take(addr, need, size)),
            None => Err(KernError::OutOfMemory),
        }
    }

    fn free(&mut self, ptr: usize) {
        let addr = self.block_of(ptr);
        // SAFETY: block_of verified the header
        let (capacity, inuse) = unsafe { ((*header(addr)).capacity, (*header(addr)).inuse) };
        self.inuse_blocks -= 1;
        self.inuse_bytes -= inuse;
        self.insert_free(addr, capacity);
    }

    fn realloc(&mut self, ptr: usize, size: usize) -> KernResult<usize> {
        if size == 0 {
            return Err(KernError::InvalidArgument);
        }
        let addr = self.block_of(ptr);
        let need = align_up(size, self.min_block);
        // SAFETY: block_of verified the header
        let (capacity, inuse) = unsafe { ((*header(addr)).capacity, (*header(addr)).inuse) };

        if need <= capacity {
            unsafe { (*header(addr)).inuse = size };
            self.inuse_bytes = self.inuse_bytes - inuse + size;
            self.trim(addr, need);
            return Ok(ptr);
        }

        // Grow in place into a free physical successor
        let next = self.block_end(addr);
        if next < self.top {
            // SAFETY: next is the header following addr inside the mapped window
            let (magic, next_cap) = unsafe { ((*header(next)).magic, (*header(next)).capacity) };
            if magic == MAGIC_FREE && capacity + self.hdr_span + next_cap >= need {
                self.unlink(next);
                unsafe {
                    (*header(next)).magic = 0;
                    (*header(addr)).capacity = capacity + self.hdr_span + next_cap;
                    (*header(addr)).inuse = size;
                }
                self.inuse_bytes = self.inuse_bytes - inuse + size;
                self.trim(addr, need);
                return Ok(ptr);
            }
        }

        let new = self.alloc(size)?;
        // SAFETY: both blocks are live and distinct; inuse < size here
        unsafe { ptr::copy_nonoverlapping(ptr as *const u8, new as *mut u8, inuse) };
        self.free(ptr);
        Ok(new)
    }

    fn for_each_free(&self, mut f: impl FnMut(FreeBlock)) {
        let mut cur = self.free_head;
        while cur != 0 {
            // SAFETY: cur is a free block header
            let h = unsafe { &*header(cur) };
            f(FreeBlock {
                addr: cur,
                capacity: h.capacity,
            });
            cur = h.next;
        }
    }

    /// Could `size` bytes be allocated without failing
    fn has_room(&self, size: usize) -> bool {
        let need = align_up(size.max(1), self.min_block);
        self.first_fit(need).is_some() || self.end - self.top >= self.hdr_span + need
    }
}

// ============================================================================
// Heap
// ============================================================================

/// The kernel heap, serialized by a gate from the lock pool
pub struct Heap {
    inner: GateCell<HeapInner, PooledGate>,
    base: usize,
    end: usize,
    hdr_span: usize,
    min_block: usize,
}

impl Heap {
    /// Build a heap over `window`, claiming `initial` bytes up front
    pub fn new(
        window: HeapWindow,
        min_block: usize,
        initial: usize,
        gate: PooledGate,
        holder: Holder,
    ) -> KernResult<Self> {
        if !min_block.is_power_of_two() || min_block < 16 {
            return Err(KernError::InvalidArgument);
        }
        if !window.base.is_page_aligned() || window.len == 0 {
            return Err(KernError::Misaligned);
        }
        let base = window.base.0;
        let hdr_span = align_up(size_of::<BlockHeader>(), min_block);
        let inner = HeapInner {
            base,
            top: base,
            end: base + window.len,
            min_block,
            hdr_span,
            free_head: 0,
            inuse_blocks: 0,
            inuse_bytes: 0,
            extensions: 0,
        };
        let heap = Self {
            inner: GateCell::with_gate(gate, inner),
            base,
            end: base + window.len,
            hdr_span,
            min_block,
        };
        if initial > 0 {
            heap.inner.write(holder)?.extend(initial.min(window.len))?;
        }
        log::info!(
            "kheap: window {:#x}..{:#x}, min block {}",
            base,
            base + window.len,
            min_block
        );
        Ok(heap)
    }

    pub fn alloc(&self, holder: Holder, size: usize) -> KernResult<NonNull<u8>> {
        let addr = self.inner.write(holder)?.alloc(size)?;
        NonNull::new(addr as *mut u8).ok_or(KernError::OutOfMemory)
    }

    /// Allocate zero-filled memory
    pub fn alloc_zeroed(&self, holder: Holder, size: usize) -> KernResult<NonNull<u8>> {
        let ptr = self.alloc(holder, size)?;
        // SAFETY: the block holds at least `size` bytes
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, size) };
        Ok(ptr)
    }

    /// Release a block. Bad magic or a second free halts the kernel.
    pub fn free(&self, holder: Holder, ptr: NonNull<u8>) -> KernResult<()> {
        self.inner.write(holder)?.free(ptr.as_ptr() as usize);
        Ok(())
    }

    /// Resize a block, in place when possible; contents are preserved up to
    /// the smaller of the two sizes
    pub fn realloc(&self, holder: Holder, ptr: NonNull<u8>, size: usize) -> KernResult<NonNull<u8>> {
        let addr = self.inner.write(holder)?.realloc(ptr.as_ptr() as usize, size)?;
        NonNull::new(addr as *mut u8).ok_or(KernError::OutOfMemory)
    }

    /// Data capacity of the block behind `ptr`
    pub fn usable_size(&self, holder: Holder, ptr: NonNull<u8>) -> KernResult<usize> {
        let inner = self.inner.read(holder)?;
        let addr = inner.block_of(ptr.as_ptr() as usize);
        // SAFETY: block_of verified the header
        Ok(unsafe { (*header(addr)).capacity })
    }

    /// Fail with `OutOfMemory` unless an allocation of `size` bytes would
    /// succeed right now
    pub fn ensure_room(&self, holder: Holder, size: usize) -> KernResult<()> {
        if self.inner.read(holder)?.has_room(size) {
            Ok(())
        } else {
            log::warn!("kheap: no room for {:#x} bytes", size);
            Err(KernError::OutOfMemory)
        }
    }

    pub fn stats(&self, holder: Holder) -> KernResult<HeapStats> {
        let inner = self.inner.read(holder)?;
        let (mut free_blocks, mut free_bytes) = (0, 0);
        inner.for_each_free(|b| {
            free_blocks += 1;
            free_bytes += b.capacity;
        });
        Ok(HeapStats {
            window: inner.end - inner.base,
            mapped: inner.top - inner.base,
            free_blocks,
            free_bytes,
            inuse_blocks: inner.inuse_blocks,
            inuse_bytes: inner.inuse_bytes,
            extensions: inner.extensions,
        })
    }

    /// Free blocks in address order
    pub fn free_list(&self, holder: Holder) -> KernResult<Vec<FreeBlock>> {
        // Sized before the walk: the buffer may itself come from this heap
        let count = self.stats(holder)?.free_blocks;
        let mut blocks = Vec::new();
        blocks
            .try_reserve_exact(count)
            .map_err(|_| KernError::OutOfMemory)?;
        self.inner.read(holder)?.for_each_free(|b| {
            if blocks.len() < blocks.capacity() {
                blocks.push(b);
            }
        });
        Ok(blocks)
    }

    /// Is `addr` inside the heap window
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end
    }

    /// Bytes of header in front of every block
    pub fn header_span(&self) -> usize {
        self.hdr_span
    }

    /// Alignment every block's data is guaranteed
    pub fn min_block(&self) -> usize {
        self.min_block
    }

    /// Give the gate back, e.g. to return it to the lock pool
    pub fn into_gate(self) -> PooledGate {
        self.inner.into_parts().0
    }
}

// ============================================================================
// Global Allocator
// ============================================================================

/// Bump arena for allocations made before the heap exists
struct EarlyArena {
    start: usize,
    end: usize,
    next: usize,
}

impl EarlyArena {
    const fn new() -> Self {
        Self {
            start: 0,
            end: 0,
            next: 0,
        }
    }

    fn allocate(&mut self, layout: Layout) -> *mut u8 {
        let at = align_up(self.next, layout.align());
        match at.checked_add(layout.size()) {
            Some(end) if self.start != 0 && end <= self.end => {
                self.next = end;
                at as *mut u8
            }
            _ => null_mut(),
        }
    }

    fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// `alloc` on top of the kernel heap
///
/// Until [`KernelAllocator::install`] runs, requests are served from the
/// early arena, whose blocks are never reclaimed. Afterwards every request
/// goes to the heap under the lock identity the installed function reports.
/// Alignments above the heap's minimum block are refused.
pub struct KernelAllocator {
    heap: Once<(Arc<Heap>, fn() -> Holder)>,
    early: Mutex<EarlyArena>,
}

impl KernelAllocator {
    pub const fn new() -> Self {
        Self {
            heap: Once::new(),
            early: Mutex::new(EarlyArena::new()),
        }
    }

    /// Give the allocator memory to use before the heap is up
    ///
    /// # Safety
    ///
    /// `[start, start + len)` must be writable, unused by anything else,
    /// and stay valid for the kernel's lifetime.
    pub unsafe fn init_early(&self, start: usize, len: usize) {
        let mut early = self.early.lock();
        early.start = start;
        early.end = start + len;
        early.next = start;
    }

    /// Route all further allocations to `heap`
    pub fn install(&self, heap: Arc<Heap>, holder: fn() -> Holder) -> KernResult<()> {
        let mut fresh = false;
        self.heap.call_once(|| {
            fresh = true;
            (heap, holder)
        });
        if !fresh {
            return Err(KernError::AlreadyExists);
        }
        log::info!("kheap: serving the global allocator");
        Ok(())
    }

    pub fn is_installed(&self) -> bool {
        self.heap.is_completed()
    }
}

impl Default for KernelAllocator {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match self.heap.get() {
            Some((heap, holder)) if layout.align() <= heap.min_block() => heap
                .alloc(holder(), layout.size().max(1))
                .map_or(null_mut(), NonNull::as_ptr),
            Some(_) => null_mut(),
            None => self.early.lock().allocate(layout),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if self.early.lock().contains(ptr as usize) {
            return;
        }
        if let (Some((heap, holder)), Some(p)) = (self.heap.get(), NonNull::new(ptr)) {
            if let Err(err) = heap.free(holder(), p) {
                log::error!("kheap: free of {:p} failed: {}", ptr, err);
            }
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        match (self.heap.get(), NonNull::new(ptr)) {
            (Some((heap, holder)), Some(p)) if heap.contains(ptr as usize) => heap
                .realloc(holder(), p, new_size.max(1))
                .map_or(null_mut(), NonNull::as_ptr),
            _ => {
                // Early block: move it into whatever serves allocations now
                let Ok(new_layout) = Layout::from_size_align(new_size, layout.align()) else {
                    return null_mut();
                };
                // SAFETY: caller guarantees ptr/layout describe a live block
                let new = unsafe { self.alloc(new_layout) };
                if !new.is_null() {
                    unsafe { ptr::copy_nonoverlapping(ptr, new, layout.size().min(new_size)) };
                    unsafe { self.dealloc(ptr, layout) };
                }
                new
            }
        }
    }
}

/// The kernel's allocator instance
#[cfg_attr(all(feature = "global-heap", not(test)), global_allocator)]
pub static KERNEL_ALLOCATOR: KernelAllocator = KernelAllocator::new();

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::hosted::{HostedHeapWindow, HostedPhysPages};
    use crate::kern::lock_pool::LockPool;
    use crate::types::CpuId;

    const H: Holder = Holder::Cpu(CpuId(0));

    struct Fixture {
        heap: Heap,
        _window: HostedHeapWindow,
        _pool: LockPool,
        _phys: HostedPhysPages,
    }

    fn fixture(window_pages: usize, initial: usize) -> Fixture {
        let phys = HostedPhysPages::new();
        let pool = LockPool::new();
        pool.bootstrap(&phys, H).unwrap();
        let window = HostedHeapWindow::reserve(window_pages * PAGE_SIZE).unwrap();
        let gate = pool.alloc_gate(&phys, H).unwrap();
        let heap = Heap::new(window.window(), 32, initial, gate, H).unwrap();
        Fixture {
            heap,
            _window: window,
            _pool: pool,
            _phys: phys,
        }
    }

    #[test]
    fn test_alloc_alignment_and_size() {
        let f = fixture(4, PAGE_SIZE);
        let p = f.heap.alloc(H, 10).unwrap();
        assert_eq!(p.as_ptr() as usize % 32, 0);
        assert_eq!(f.heap.usable_size(H, p).unwrap(), 32);
        assert_eq!(f.heap.alloc(H, 0), Err(KernError::InvalidArgument));

        // SAFETY: block holds 32 bytes
        unsafe { ptr::write_bytes(p.as_ptr(), 0xAB, 10) };
        let stats = f.heap.stats(H).unwrap();
        assert_eq!(stats.inuse_blocks, 1);
        assert_eq!(stats.inuse_bytes, 10);
        f.heap.free(H, p).unwrap();
    }

    #[test]
    fn test_coalescing_restores_single_block() {
        let f = fixture(4, PAGE_SIZE);
        let before = f.heap.free_list(H).unwrap();
        assert_eq!(before.len(), 1);

        let a = f.heap.alloc(H, 64).unwrap();
        let b = f.heap.alloc(H, 64).unwrap();
        let c = f.heap.alloc(H, 64).unwrap();
        f.heap.free(H, b).unwrap();
        assert_eq!(f.heap.free_list(H).unwrap().len(), 2);
        f.heap.free(H, a).unwrap();
        assert_eq!(f.heap.free_list(H).unwrap().len(), 2);
        f.heap.free(H, c).unwrap();

        assert_eq!(f.heap.free_list(H).unwrap(), before);
    }

    #[test]
    fn test_first_fit_reuses_hole() {
        let f = fixture(4, PAGE_SIZE);
        let a = f.heap.alloc(H, 128).unwrap();
        let _b = f.heap.alloc(H, 32).unwrap();
        f.heap.free(H, a).unwrap();
        let c = f.heap.alloc(H, 64).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn test_extends_then_exhausts() {
        let f = fixture(2, 0);
        assert_eq!(f.heap.stats(H).unwrap().mapped, 0);
        let p = f.heap.alloc(H, 100).unwrap();
        let stats = f.heap.stats(H).unwrap();
        assert_eq!(stats.mapped, PAGE_SIZE);
        assert_eq!(stats.extensions, 1);

        let big = f.heap.alloc(H, PAGE_SIZE).unwrap();
        assert_eq!(f.heap.stats(H).unwrap().mapped, 2 * PAGE_SIZE);
        assert_eq!(f.heap.alloc(H, PAGE_SIZE), Err(KernError::OutOfMemory));

        f.heap.free(H, big).unwrap();
        f.heap.free(H, p).unwrap();
        assert_eq!(f.heap.free_list(H).unwrap().len(), 1);
    }

    #[test]
    fn test_realloc_in_place_and_moving() {
        let f = fixture(4, PAGE_SIZE);
        let a = f.heap.alloc(H, 32).unwrap();
        // SAFETY: 32 byte block
        unsafe { ptr::write_bytes(a.as_ptr(), 7, 32) };

        // Successor is free: grows in place
        let grown = f.heap.realloc(H, a, 200).unwrap();
        assert_eq!(grown, a);
        assert!(f.heap.usable_size(H, grown).unwrap() >= 200);

        // Pin the successor, then grow again: must move
        let _pin = f.heap.alloc(H, 32).unwrap();
        let moved = f.heap.realloc(H, grown, 1024).unwrap();
        assert_ne!(moved, grown);
        // SAFETY: moved block holds 1024 bytes, the first 32 copied
        let head = unsafe { core::slice::from_raw_parts(moved.as_ptr(), 32) };
        assert!(head.iter().all(|&b| b == 7));

        // Shrinking stays in place
        let shrunk = f.heap.realloc(H, moved, 16).unwrap();
        assert_eq!(shrunk, moved);
        assert_eq!(f.heap.stats(H).unwrap().inuse_bytes, 16 + 32);
    }

    #[test]
    #[should_panic(expected = "freed twice")]
    fn test_double_free_is_fatal() {
        let f = fixture(4, PAGE_SIZE);
        let p = f.heap.alloc(H, 48).unwrap();
        f.heap.free(H, p).unwrap();
        let _ = f.heap.free(H, p);
    }

    #[test]
    #[should_panic(expected = "bad magic")]
    fn test_corrupt_header_is_fatal() {
        let f = fixture(4, PAGE_SIZE);
        let p = f.heap.alloc(H, 48).unwrap();
        // SAFETY: scribble over the block header on purpose
        unsafe { ptr::write_bytes(p.as_ptr().sub(f.heap.header_span()), 0x5A, 4) };
        let _ = f.heap.free(H, p);
    }

    fn boot_holder() -> Holder {
        H
    }

    #[test]
    fn test_allocator_early_arena_then_heap() {
        let Fixture {
            heap,
            _window,
            _pool,
            _phys,
        } = fixture(4, PAGE_SIZE);
        let heap = Arc::new(heap);
        let a = KernelAllocator::new();
        let mut arena = vec![0u64; 16];
        let small = Layout::from_size_align(24, 8).unwrap();
        let big = Layout::from_size_align(128, 8).unwrap();

        assert!(unsafe { a.alloc(small) }.is_null());
        // SAFETY: the arena outlives every block handed out below
        unsafe { a.init_early(arena.as_mut_ptr() as usize, 128) };
        let e = unsafe { a.alloc(small) };
        assert!(!e.is_null());
        assert!(!heap.contains(e as usize));
        // Early blocks are never reclaimed
        unsafe { a.dealloc(e, small) };
        assert!(unsafe { a.alloc(big) }.is_null());

        a.install(heap.clone(), boot_holder).unwrap();
        assert_eq!(a.install(heap.clone(), boot_holder), Err(KernError::AlreadyExists));
        assert!(a.is_installed());
        let p = unsafe { a.alloc(big) };
        assert!(heap.contains(p as usize));
        assert_eq!(heap.stats(H).unwrap().inuse_blocks, 1);

        unsafe { ptr::write_bytes(p, 0x3C, 128) };
        let q = unsafe { a.realloc(p, big, 512) };
        let head = unsafe { core::slice::from_raw_parts(q, 128) };
        assert!(head.iter().all(|&b| b == 0x3C));
        unsafe { a.dealloc(q, Layout::from_size_align(512, 8).unwrap()) };
        assert_eq!(heap.stats(H).unwrap().inuse_blocks, 0);

        // Growing an early block moves it into the heap
        unsafe { ptr::write_bytes(e, 0x11, 24) };
        let moved = unsafe { a.realloc(e, small, 64) };
        assert!(heap.contains(moved as usize));
        assert_eq!(unsafe { *moved.add(23) }, 0x11);
        unsafe { a.dealloc(moved, Layout::from_size_align(64, 8).unwrap()) };
        assert_eq!(heap.stats(H).unwrap().inuse_blocks, 0);
        drop(arena);
    }

    #[test]
    fn test_allocator_exhaustion_is_null() {
        let Fixture {
            heap,
            _window,
            _pool,
            _phys,
        } = fixture(4, PAGE_SIZE);
        let heap = Arc::new(heap);
        let a = KernelAllocator::new();
        a.install(heap.clone(), boot_holder).unwrap();

        let huge = Layout::from_size_align(8 * PAGE_SIZE, 8).unwrap();
        assert!(unsafe { a.alloc(huge) }.is_null());
        let over_aligned = Layout::from_size_align(64, PAGE_SIZE).unwrap();
        assert!(unsafe { a.alloc(over_aligned) }.is_null());
        assert_eq!(heap.stats(H).unwrap().inuse_blocks, 0);
    }

    #[test]
    fn test_ensure_room_tracks_window() {
        let f = fixture(2, PAGE_SIZE);
        assert!(f.heap.ensure_room(H, PAGE_SIZE / 2).is_ok());
        assert_eq!(
            f.heap.ensure_room(H, 4 * PAGE_SIZE),
            Err(KernError::OutOfMemory)
        );

        let mut held = Vec::new();
        while let Ok(p) = f.heap.alloc(H, 256) {
            held.push(p);
        }
        assert_eq!(f.heap.ensure_room(H, 256), Err(KernError::OutOfMemory));
        f.heap.free(H, held.pop().unwrap()).unwrap();
        assert!(f.heap.ensure_room(H, 256).is_ok());
        for p in held {
            f.heap.free(H, p).unwrap();
        }
    }
}
