//! Fixed-size Pool
//!
//! Same-size records carved from a single heap block, in the manner of a
//! zone: no per-allocation search, O(1) alloc and free. Each record starts
//! with a [`Link`] holding absolute addresses; free records form a singly
//! linked list and in-use records a doubly linked list in allocation order.
//!
//! ## Growth
//!
//! Growing reallocates the backing block. When the block moves, every
//! absolute address stored in the pool (record links and list heads) is
//! rebased from the old block to the new one. Callers that kept raw record
//! addresses rebase them through the returned [`GrowReport`]; callers that
//! kept [`PoolSlot`] handles need nothing.

use core::marker::PhantomData;
use core::mem::{align_of, size_of};
use core::ptr::NonNull;

use crate::error::{KernError, KernResult};
use crate::kern::kheap::Heap;
use crate::kern::lock::Holder;
use crate::types::align_up;

const STATE_FREE: u32 = 0;
const STATE_INUSE: u32 = 1;

/// Largest record alignment the heap can honour
const MAX_RECORD_ALIGN: usize = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Link {
    prev: usize,
    next: usize,
    generation: u32,
    state: u32,
}

/// Generation-checked reference to a pool record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolSlot {
    pub index: usize,
    pub generation: u32,
}

/// Outcome of [`Pool::grow`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrowReport {
    pub old_base: usize,
    pub new_base: usize,
    /// Bytes of the backing block before growth
    pub old_len: usize,
}

impl GrowReport {
    pub fn moved(&self) -> bool {
        self.old_base != self.new_base
    }

    /// Translate an address into the old block to the new block
    pub fn rebase(&self, addr: usize) -> usize {
        if addr >= self.old_base && addr < self.old_base + self.old_len {
            addr - self.old_base + self.new_base
        } else {
            addr
        }
    }
}

/// Pool of `T` records backed by one heap block
#[derive(Debug)]
pub struct Pool<T: Copy> {
    stride: usize,
    data_offset: usize,
    backing: usize,
    total: usize,
    free: usize,
    inuse: usize,
    head: usize,
    tail: usize,
    free_head: usize,
    _marker: PhantomData<T>,
}

impl<T: Copy> Pool<T> {
    /// Create a pool with room for `initial` records
    pub fn create(heap: &Heap, holder: Holder, initial: usize) -> KernResult<Self> {
        if initial == 0 || align_of::<T>() > MAX_RECORD_ALIGN {
            return Err(KernError::InvalidArgument);
        }
        let align = align_of::<T>().max(align_of::<Link>());
        let data_offset = align_up(size_of::<Link>(), align_of::<T>());
        let stride = align_up(data_offset + size_of::<T>(), align);

        let backing = heap.alloc(holder, stride * initial)?;
        let mut pool = Self {
            stride,
            data_offset,
            backing: backing.as_ptr() as usize,
            total: 0,
            free: 0,
            inuse: 0,
            head: 0,
            tail: 0,
            free_head: 0,
            _marker: PhantomData,
        };
        pool.thread_free(0, initial);
        Ok(pool)
    }

    fn record(&self, index: usize) -> usize {
        self.backing + index * self.stride
    }

    fn index_of(&self, addr: usize) -> usize {
        (addr - self.backing) / self.stride
    }

    fn link(&self, addr: usize) -> *mut Link {
        addr as *mut Link
    }

    fn data(&self, addr: usize) -> *mut T {
        (addr + self.data_offset) as *mut T
    }

    /// Push records `from..to` onto the free list
    fn thread_free(&mut self, from: usize, to: usize) {
        for index in (from..to).rev() {
            let addr = self.record(index);
            // SAFETY: index < capacity of the backing block
            unsafe {
                self.link(addr).write(Link {
                    prev: 0,
                    next: self.free_head,
                    generation: 0,
                    state: STATE_FREE,
                });
            }
            self.free_head = addr;
        }
        self.total += to - from;
        self.free += to - from;
    }

    /// Store `value` in a free record, growing the pool when none is left
    pub fn alloc(&mut self, heap: &Heap, holder: Holder, value: T) -> KernResult<PoolSlot> {
        if self.backing == 0 {
            return Err(KernError::InvalidState);
        }
        if self.free_head == 0 {
            self.grow(heap, holder, self.total.max(1))?;
        }

        let addr = self.free_head;
        // SAFETY: addr heads the free list, so it is a record of this pool
        let slot = unsafe {
            let link = self.link(addr);
            self.free_head = (*link).next;
            (*link).state = STATE_INUSE;
            (*link).prev = self.tail;
            (*link).next = 0;
            if self.tail != 0 {
                (*self.link(self.tail)).next = addr;
            } else {
                self.head = addr;
            }
            self.tail = addr;
            self.data(addr).write(value);
            PoolSlot {
                index: self.index_of(addr),
                generation: (*link).generation,
            }
        };
        self.free -= 1;
        self.inuse += 1;
        Ok(slot)
    }

    fn live_record(&self, slot: PoolSlot) -> Option<usize> {
        if self.backing == 0 || slot.index >= self.total {
            return None;
        }
        let addr = self.record(slot.index);
        // SAFETY: index < total
        let link = unsafe { *self.link(addr) };
        (link.state == STATE_INUSE && link.generation == slot.generation).then_some(addr)
    }

    /// Return a record to the free list, yielding its value
    pub fn free(&mut self, slot: PoolSlot) -> KernResult<T> {
        let addr = self.live_record(slot).ok_or(KernError::InvalidArgument)?;
        // SAFETY: addr is a live in-use record
        let value = unsafe {
            let link = self.link(addr);
            let (prev, next) = ((*link).prev, (*link).next);
            if prev != 0 {
                (*self.link(prev)).next = next;
            } else {
                self.head = next;
            }
            if next != 0 {
                (*self.link(next)).prev = prev;
            } else {
                self.tail = prev;
            }
            (*link).state = STATE_FREE;
            (*link).generation = (*link).generation.wrapping_add(1);
            (*link).prev = 0;
            (*link).next = self.free_head;
            self.free_head = addr;
            self.data(addr).read()
        };
        self.free += 1;
        self.inuse -= 1;
        Ok(value)
    }

    pub fn get(&self, slot: PoolSlot) -> Option<T> {
        let addr = self.live_record(slot)?;
        // SAFETY: live record
        Some(unsafe { self.data(addr).read() })
    }

    pub fn set(&mut self, slot: PoolSlot, value: T) -> KernResult<()> {
        let addr = self.live_record(slot).ok_or(KernError::InvalidArgument)?;
        // SAFETY: live record
        unsafe { self.data(addr).write(value) };
        Ok(())
    }

    /// Raw address of a record's value; valid until the next grow
    pub fn as_ptr(&self, slot: PoolSlot) -> Option<NonNull<T>> {
        self.live_record(slot).and_then(|addr| NonNull::new(self.data(addr)))
    }

    /// In-use records in allocation order
    pub fn iter(&self) -> PoolIter<'_, T> {
        PoolIter {
            pool: self,
            cursor: self.head,
        }
    }

    /// Add `additional` records, moving the backing block if the heap must
    pub fn grow(&mut self, heap: &Heap, holder: Holder, additional: usize) -> KernResult<GrowReport> {
        if additional == 0 || self.backing == 0 {
            return Err(KernError::InvalidArgument);
        }
        let old_len = self.stride * self.total;
        let old = NonNull::new(self.backing as *mut u8).ok_or(KernError::InvalidState)?;
        let new = heap.realloc(holder, old, self.stride * (self.total + additional))?;
        let report = GrowReport {
            old_base: self.backing,
            new_base: new.as_ptr() as usize,
            old_len,
        };

        if report.moved() {
            self.backing = report.new_base;
            let rebase = |addr: usize| if addr == 0 { 0 } else { report.rebase(addr) };
            for index in 0..self.total {
                let link = self.link(self.record(index));
                // SAFETY: index < total, inside the new block
                unsafe {
                    (*link).prev = rebase((*link).prev);
                    (*link).next = rebase((*link).next);
                }
            }
            self.head = rebase(self.head);
            self.tail = rebase(self.tail);
            self.free_head = rebase(self.free_head);
            log::debug!(
                "kpool: moved {:#x} -> {:#x} ({} records)",
                report.old_base,
                report.new_base,
                self.total
            );
        }

        let total = self.total;
        self.thread_free(total, total + additional);
        Ok(report)
    }

    /// Release the backing block; the pool is empty and unusable afterwards
    pub fn destroy(&mut self, heap: &Heap, holder: Holder) -> KernResult<()> {
        if let Some(backing) = NonNull::new(self.backing as *mut u8) {
            heap.free(holder, backing)?;
        }
        self.backing = 0;
        self.total = 0;
        self.free = 0;
        self.inuse = 0;
        self.head = 0;
        self.tail = 0;
        self.free_head = 0;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inuse
    }

    pub fn is_empty(&self) -> bool {
        self.inuse == 0
    }

    pub fn free_count(&self) -> usize {
        self.free
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Start address of the backing block (0 once destroyed)
    pub fn base(&self) -> usize {
        self.backing
    }
}

/// Iterator over in-use records
pub struct PoolIter<'a, T: Copy> {
    pool: &'a Pool<T>,
    cursor: usize,
}

impl<T: Copy> Iterator for PoolIter<'_, T> {
    type Item = (PoolSlot, T);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == 0 {
            return None;
        }
        let addr = self.cursor;
        // SAFETY: cursor walks the in-use list of a borrowed pool
        let link = unsafe { *self.pool.link(addr) };
        self.cursor = link.next;
        let slot = PoolSlot {
            index: self.pool.index_of(addr),
            generation: link.generation,
        };
        Some((slot, unsafe { self.pool.data(addr).read() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::hosted::{HostedHeapWindow, HostedPhysPages};
    use crate::kern::lock_pool::LockPool;
    use crate::types::{CpuId, PAGE_SIZE};
    use alloc::vec::Vec;

    const H: Holder = Holder::Cpu(CpuId(0));

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Rec {
        a: u64,
        b: u32,
    }

    struct Fixture {
        heap: Heap,
        _window: HostedHeapWindow,
        _pool: LockPool,
        _phys: HostedPhysPages,
    }

    fn fixture() -> Fixture {
        let phys = HostedPhysPages::new();
        let pool = LockPool::new();
        pool.bootstrap(&phys, H).unwrap();
        let window = HostedHeapWindow::reserve(8 * PAGE_SIZE).unwrap();
        let gate = pool.alloc_gate(&phys, H).unwrap();
        let heap = Heap::new(window.window(), 16, 2 * PAGE_SIZE, gate, H).unwrap();
        Fixture {
            heap,
            _window: window,
            _pool: pool,
            _phys: phys,
        }
    }

    #[test]
    fn test_alloc_free_counts() {
        let f = fixture();
        let mut pool: Pool<Rec> = Pool::create(&f.heap, H, 4).unwrap();
        assert_eq!(pool.total(), 4);

        let s1 = pool.alloc(&f.heap, H, Rec { a: 1, b: 1 }).unwrap();
        let s2 = pool.alloc(&f.heap, H, Rec { a: 2, b: 2 }).unwrap();
        assert_eq!(pool.len() + pool.free_count(), pool.total());
        assert_eq!(pool.get(s2), Some(Rec { a: 2, b: 2 }));

        assert_eq!(pool.free(s1).unwrap(), Rec { a: 1, b: 1 });
        assert_eq!(pool.get(s1), None);
        assert_eq!(pool.free(s1), Err(KernError::InvalidArgument));
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.len() + pool.free_count(), pool.total());

        // Reused record gets a new generation
        let s3 = pool.alloc(&f.heap, H, Rec { a: 3, b: 3 }).unwrap();
        assert_eq!(s3.index, s1.index);
        assert_ne!(s3.generation, s1.generation);
        pool.destroy(&f.heap, H).unwrap();
    }

    #[test]
    fn test_iter_in_allocation_order() {
        let f = fixture();
        let mut pool: Pool<u32> = Pool::create(&f.heap, H, 2).unwrap();
        let slots: Vec<PoolSlot> = (0..5)
            .map(|v| pool.alloc(&f.heap, H, v).unwrap())
            .collect();
        pool.free(slots[2]).unwrap();
        let values: Vec<u32> = pool.iter().map(|(_, v)| v).collect();
        assert_eq!(values, [0u32, 1, 3, 4]);
        assert!(pool.total() >= 5);
        pool.set(slots[0], 9).unwrap();
        assert_eq!(pool.iter().next().map(|(_, v)| v), Some(9));
    }

    #[test]
    fn test_grow_rebases_links_and_pointers() {
        let f = fixture();
        let mut pool: Pool<Rec> = Pool::create(&f.heap, H, 2).unwrap();
        let a = pool.alloc(&f.heap, H, Rec { a: 10, b: 1 }).unwrap();
        let b = pool.alloc(&f.heap, H, Rec { a: 20, b: 2 }).unwrap();
        let raw_b = pool.as_ptr(b).unwrap().as_ptr() as usize;

        // Pin the space after the backing block so growth must move it
        let pin = f.heap.alloc(H, 16).unwrap();
        let report = pool.grow(&f.heap, H, 6).unwrap();
        assert!(report.moved());
        assert_eq!(pool.total(), 8);

        assert_eq!(pool.get(a), Some(Rec { a: 10, b: 1 }));
        assert_eq!(pool.get(b), Some(Rec { a: 20, b: 2 }));
        assert_eq!(report.rebase(raw_b), pool.as_ptr(b).unwrap().as_ptr() as usize);

        // Lists still hang together after the move
        let c = pool.alloc(&f.heap, H, Rec { a: 30, b: 3 }).unwrap();
        pool.free(a).unwrap();
        let order: Vec<u64> = pool.iter().map(|(_, r)| r.a).collect();
        assert_eq!(order, [20u64, 30]);
        assert_eq!(pool.get(c).map(|r| r.a), Some(30));
        f.heap.free(H, pin).unwrap();
    }

    #[test]
    fn test_destroy_returns_memory() {
        let f = fixture();
        let before = f.heap.stats(H).unwrap();
        let mut pool: Pool<u64> = Pool::create(&f.heap, H, 8).unwrap();
        pool.alloc(&f.heap, H, 1).unwrap();
        pool.destroy(&f.heap, H).unwrap();
        assert_eq!(pool.base(), 0);
        assert_eq!(pool.alloc(&f.heap, H, 2), Err(KernError::InvalidState));
        assert_eq!(f.heap.stats(H).unwrap().free_bytes, before.free_bytes);
    }
}
