//! Virtual Memory
//!
//! Per-process VMA trees and the portable half of page-fault handling. The
//! [`VmManager`] creates, resizes, shares and destroys VMAs, tracks how many
//! VMAs reference each physical frame (copy-on-write sharing), and decides
//! what a fault means. It never edits page tables: it asks the
//! [`PageTableService`] to drop mappings and flush TLBs, and hands a
//! [`FaultDecision`] back for architecture code to act on.
//!
//! ## Lock order
//!
//! process (address space) -> VMA -> frame table -> heap

pub mod copyio;
pub mod fault;
pub mod vma;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{KernError, KernResult};
use crate::hal::{PageFlags, PageTableService, PhysPageService};
use crate::kern::kheap::Heap;
use crate::kern::kpool::Pool;
use crate::kern::lock::{GateCell, Holder};
use crate::types::{is_page_aligned, PhysAddr, VirtAddr, PAGE_SIZE};

pub use fault::{FaultDecision, FaultStats};
pub use vma::{AccessFlags, AddressSpace, Mapping, Vma, VmaFlags, VmaId, VmaInfo, VmaNode};

use vma::{PageEntry, VmaInner};

/// Frame allocation flags for pages of a VMA
fn page_flags(flags: VmaFlags) -> PageFlags {
    if flags.contains(VmaFlags::NOCACHE) {
        PageFlags::ZERO | PageFlags::NO_CACHE | PageFlags::NO_BUFFER
    } else {
        PageFlags::ZERO
    }
}

fn validate_region(base: VirtAddr, size: usize) -> KernResult<()> {
    if size == 0 {
        return Err(KernError::InvalidArgument);
    }
    if !base.is_page_aligned() || !is_page_aligned(size) {
        return Err(KernError::Misaligned);
    }
    base.0.checked_add(size).ok_or(KernError::InvalidArgument)?;
    Ok(())
}

/// VMA layer service
pub struct VmManager {
    heap: Arc<Heap>,
    phys: Arc<dyn PhysPageService>,
    page_tables: Arc<dyn PageTableService>,
    /// Frame -> number of VMA pages referencing it
    frames: GateCell<BTreeMap<PhysAddr, u32>>,
    next_id: AtomicU64,
    mapping_pool_initial: usize,
    stats: FaultStats,
}

impl VmManager {
    pub fn new(
        heap: Arc<Heap>,
        phys: Arc<dyn PhysPageService>,
        page_tables: Arc<dyn PageTableService>,
        mapping_pool_initial: usize,
    ) -> Self {
        Self {
            heap,
            phys,
            page_tables,
            frames: GateCell::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            mapping_pool_initial: mapping_pool_initial.max(1),
            stats: FaultStats::new(),
        }
    }

    pub fn stats(&self) -> &FaultStats {
        &self.stats
    }

    // ------------------------------------------------------------------------
    // Frame references
    // ------------------------------------------------------------------------

    fn frame_ref(&self, holder: Holder, frame: PhysAddr) -> KernResult<()> {
        *self.frames.write(holder)?.entry(frame).or_insert(0) += 1;
        Ok(())
    }

    /// Drop one reference; the last one returns the frame
    fn frame_unref(&self, holder: Holder, frame: PhysAddr) -> KernResult<()> {
        let last = {
            let mut frames = self.frames.write(holder)?;
            match frames.get_mut(&frame) {
                Some(refs) if *refs > 1 => {
                    *refs -= 1;
                    false
                }
                Some(_) => {
                    frames.remove(&frame);
                    true
                }
                None => {
                    log::warn!("vm: unref of untracked frame {}", frame);
                    false
                }
            }
        };
        if last {
            self.phys.free_phys_page(frame);
        }
        Ok(())
    }

    /// Number of VMA pages referencing `frame`
    pub fn frame_refs(&self, holder: Holder, frame: PhysAddr) -> KernResult<u32> {
        Ok(self.frames.read(holder)?.get(&frame).copied().unwrap_or(0))
    }

    fn alloc_frame(&self, holder: Holder, flags: VmaFlags) -> KernResult<PhysAddr> {
        let frame = self.phys.alloc_phys_page(page_flags(flags))?;
        self.frame_ref(holder, frame)?;
        Ok(frame)
    }

    // ------------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------------

    fn new_vma(
        &self,
        holder: Holder,
        flags: VmaFlags,
        size: usize,
        cookie: u64,
        pages: BTreeMap<usize, PageEntry>,
    ) -> KernResult<Arc<Vma>> {
        let mappings = Pool::create(&self.heap, holder, self.mapping_pool_initial)?;
        let id = VmaId(self.next_id.fetch_add(1, Ordering::Relaxed));
        Ok(Arc::new(Vma::new(
            id,
            cookie,
            VmaInner {
                flags,
                size,
                pages,
                mappings,
            },
        )))
    }

    /// Record a mapping for `space` in `vma` and insert the tree node
    fn link(
        &self,
        space: &mut AddressSpace,
        holder: Holder,
        vma: Arc<Vma>,
        base: VirtAddr,
    ) -> KernResult<()> {
        let slot = vma.inner.write(holder)?.mappings.alloc(
            &self.heap,
            holder,
            Mapping {
                pid: space.pid(),
                base,
            },
        )?;
        space.tree.insert(
            base.0,
            VmaNode {
                vma,
                base,
                mapping: slot,
            },
        );
        Ok(())
    }

    /// Fail with `AlreadyExists` if `[base, base + size)` touches a VMA
    fn check_free(&self, space: &AddressSpace, holder: Holder, base: usize, size: usize) -> KernResult<()> {
        let end = base + size;
        if let Some((&other, node)) = space.tree.range(..end).next_back() {
            if other + node.vma.size(holder)? > base {
                return Err(KernError::AlreadyExists);
            }
        }
        Ok(())
    }

    fn info(&self, holder: Holder, node: &VmaNode) -> KernResult<VmaInfo> {
        let inner = node.vma.inner.read(holder)?;
        Ok(VmaInfo {
            id: node.vma.id(),
            base: node.base,
            size: inner.size,
            flags: inner.flags,
            cookie: node.vma.cookie(),
        })
    }

    // ------------------------------------------------------------------------
    // Tree operations
    // ------------------------------------------------------------------------

    /// Create a VMA at `[base, base + size)` in `space`
    pub fn add_vma(
        &self,
        space: &mut AddressSpace,
        holder: Holder,
        base: VirtAddr,
        size: usize,
        flags: VmaFlags,
        cookie: u64,
    ) -> KernResult<VmaInfo> {
        validate_region(base, size)?;
        if flags.contains(VmaFlags::HASPHYS) {
            return Err(KernError::InvalidArgument);
        }
        self.check_free(space, holder, base.0, size)?;

        let vma = self.new_vma(holder, flags, size, cookie, BTreeMap::new())?;
        let id = vma.id();
        self.link(space, holder, vma, base)?;
        log::debug!(
            "vm: {} add vma {} at {} size {:#x} {:?}",
            space.pid(),
            id.0,
            base,
            size,
            flags
        );
        Ok(VmaInfo {
            id,
            base,
            size,
            flags,
            cookie,
        })
    }

    /// Create a VMA over the physical range starting at `phys`
    ///
    /// Every page is resident from the start and never faults.
    #[allow(clippy::too_many_arguments)]
    pub fn add_phys_vma(
        &self,
        space: &mut AddressSpace,
        holder: Holder,
        base: VirtAddr,
        size: usize,
        flags: VmaFlags,
        cookie: u64,
        phys: PhysAddr,
    ) -> KernResult<VmaInfo> {
        validate_region(base, size)?;
        if !phys.is_page_aligned() {
            return Err(KernError::Misaligned);
        }
        self.check_free(space, holder, base.0, size)?;

        let flags = flags | VmaFlags::HASPHYS;
        let pages = (0..size / PAGE_SIZE)
            .map(|idx| {
                (
                    idx,
                    PageEntry {
                        phys: phys.offset(idx * PAGE_SIZE),
                        cow: false,
                        owned: false,
                    },
                )
            })
            .collect();
        let vma = self.new_vma(holder, flags, size, cookie, pages)?;
        let id = vma.id();
        self.link(space, holder, vma, base)?;
        Ok(VmaInfo {
            id,
            base,
            size,
            flags,
            cookie,
        })
    }

    /// VMA covering all of `[addr, addr + size)`
    pub fn find_vma(
        &self,
        space: &AddressSpace,
        holder: Holder,
        addr: VirtAddr,
        size: usize,
    ) -> KernResult<Option<VmaInfo>> {
        let Some(node) = space.node_containing(holder, addr)? else {
            return Ok(None);
        };
        let info = self.info(holder, node)?;
        let last = addr.0.saturating_add(size.max(1));
        if last <= info.end().0 {
            Ok(Some(info))
        } else {
            Ok(None)
        }
    }

    /// Grow or shrink the VMA based at `base` by `delta` bytes
    ///
    /// Shrinking unmaps the cut pages in every mapping process, flushes their
    /// TLBs and releases the frames. Growing is refused for fixed VMAs, for
    /// VMAs mapped into more than one process, and into a neighbour.
    pub fn resize_vma(
        &self,
        space: &AddressSpace,
        holder: Holder,
        base: VirtAddr,
        delta: isize,
    ) -> KernResult<usize> {
        if delta.unsigned_abs() % PAGE_SIZE != 0 {
            return Err(KernError::Misaligned);
        }
        let node = space.tree.get(&base.0).ok_or(KernError::NoSuchVma)?;
        let mut guard = node.vma.inner.write(holder)?;
        let inner = &mut *guard;

        if inner.flags.contains(VmaFlags::FIXED) {
            return Err(KernError::InvalidState);
        }
        let old = inner.size;
        let new = if delta >= 0 {
            old.checked_add(delta.unsigned_abs())
                .ok_or(KernError::InvalidArgument)?
        } else {
            old.checked_sub(delta.unsigned_abs())
                .filter(|&n| n > 0)
                .ok_or(KernError::InvalidArgument)?
        };

        if new > old {
            if inner.mappings.len() > 1 {
                return Err(KernError::InvalidState);
            }
            base.0.checked_add(new).ok_or(KernError::InvalidArgument)?;
            if let Some((&next, _)) = space.tree.range(base.0 + 1..).next() {
                if next < base.0 + new {
                    return Err(KernError::AlreadyExists);
                }
            }
        } else if new < old {
            let removed = inner.pages.split_off(&(new / PAGE_SIZE));
            for (_, mapping) in inner.mappings.iter() {
                for &idx in removed.keys() {
                    self.page_tables
                        .unmap_page(mapping.pid, mapping.base.offset(idx * PAGE_SIZE));
                }
                self.page_tables
                    .flush_tlb(mapping.pid, mapping.base.offset(new), old - new);
            }
            for entry in removed.values().filter(|e| e.owned) {
                self.frame_unref(holder, entry.phys)?;
            }
        }

        inner.size = new;
        log::debug!("vm: resize vma {} at {} {:#x} -> {:#x}", node.vma.id().0, base, old, new);
        Ok(new)
    }

    /// Remove this process's mapping of the VMA at `base`
    ///
    /// Returns true when that was the last mapping and the VMA (with its
    /// frames) was destroyed.
    pub fn unlink_vma(&self, space: &mut AddressSpace, holder: Holder, base: VirtAddr) -> KernResult<bool> {
        let node = space.tree.get(&base.0).ok_or(KernError::NoSuchVma)?;
        let (vma, mapping) = (node.vma.clone(), node.mapping);
        let pid = space.pid();
        let mut guard = vma.inner.write(holder)?;
        let inner = &mut *guard;

        // The node goes only once its mapping record is gone
        inner.mappings.free(mapping)?;
        space.tree.remove(&base.0);
        for &idx in inner.pages.keys() {
            self.page_tables.unmap_page(pid, base.offset(idx * PAGE_SIZE));
        }
        self.page_tables.flush_tlb(pid, base, inner.size);

        if !inner.mappings.is_empty() {
            return Ok(false);
        }

        let pages = core::mem::take(&mut inner.pages);
        for entry in pages.values().filter(|e| e.owned) {
            self.frame_unref(holder, entry.phys)?;
        }
        inner.mappings.destroy(&self.heap, holder)?;
        drop(guard);
        vma.inner.gate().destroy();
        log::debug!("vm: destroyed vma {}", vma.id().0);
        Ok(true)
    }

    /// Unlink every VMA of a dying process
    pub fn unlink_all(&self, space: &mut AddressSpace, holder: Holder) -> KernResult<()> {
        for base in space.bases() {
            self.unlink_vma(space, holder, base)?;
        }
        Ok(())
    }

    /// Populate `child` from `parent` for fork
    ///
    /// Shared VMAs gain a mapping for the child. Private VMAs are copied;
    /// their resident frames become copy-on-write in both processes.
    pub fn duplicate_vmas(
        &self,
        child: &mut AddressSpace,
        parent: &AddressSpace,
        holder: Holder,
    ) -> KernResult<()> {
        if !child.is_empty() {
            return Err(KernError::InvalidState);
        }

        for (&b, node) in parent.tree.iter() {
            let base = VirtAddr(b);
            let mut guard = node.vma.inner.write(holder)?;
            let inner = &mut *guard;

            if inner.flags.contains(VmaFlags::SHARED) {
                let slot = inner.mappings.alloc(
                    &self.heap,
                    holder,
                    Mapping {
                        pid: child.pid(),
                        base,
                    },
                )?;
                child.tree.insert(
                    b,
                    VmaNode {
                        vma: node.vma.clone(),
                        base,
                        mapping: slot,
                    },
                );
                continue;
            }

            let writable = inner.flags.contains(VmaFlags::WRITABLE);
            let mut pages = BTreeMap::new();
            for (&idx, entry) in inner.pages.iter_mut() {
                if entry.owned {
                    self.frame_ref(holder, entry.phys)?;
                    if writable && !entry.cow {
                        self.page_tables
                            .write_protect(parent.pid(), base.offset(idx * PAGE_SIZE));
                    }
                    entry.cow = true;
                }
                pages.insert(idx, *entry);
            }
            let (flags, size) = (inner.flags, inner.size);
            drop(guard);

            let copy = self.new_vma(holder, flags, size, node.vma.cookie(), pages)?;
            self.link(child, holder, copy, base)?;
        }

        log::debug!(
            "vm: duplicated {} vmas {} -> {}",
            parent.len(),
            parent.pid(),
            child.pid()
        );
        Ok(())
    }

    /// Snapshot of every VMA in `space`
    pub fn list(&self, space: &AddressSpace, holder: Holder) -> KernResult<Vec<VmaInfo>> {
        space
            .tree
            .values()
            .map(|node| self.info(holder, node))
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::hal::hosted::{HostedHeapWindow, HostedPhysPages, RecordingPageTables};
    use crate::kern::lock_pool::LockPool;
    use crate::types::CpuId;

    pub const H: Holder = Holder::Cpu(CpuId(0));

    pub struct VmFixture {
        pub vm: VmManager,
        pub phys: Arc<HostedPhysPages>,
        pub tables: Arc<RecordingPageTables>,
        _pool: LockPool,
        _window: HostedHeapWindow,
    }

    impl VmFixture {
        pub fn phys_ptr(&self, frame: PhysAddr) -> *mut u8 {
            self.phys.phys_to_virt(frame)
        }
    }

    pub fn fixture() -> VmFixture {
        let phys = Arc::new(HostedPhysPages::new());
        let tables = Arc::new(RecordingPageTables::new());
        let pool = LockPool::new();
        pool.bootstrap(phys.as_ref(), H).unwrap();
        let window = HostedHeapWindow::reserve(16 * PAGE_SIZE).unwrap();
        let gate = pool.alloc_gate(phys.as_ref(), H).unwrap();
        let heap = Arc::new(Heap::new(window.window(), 32, 4 * PAGE_SIZE, gate, H).unwrap());
        let vm = VmManager::new(heap, phys.clone(), tables.clone(), 2);
        VmFixture {
            vm,
            phys,
            tables,
            _pool: pool,
            _window: window,
        }
    }
}
