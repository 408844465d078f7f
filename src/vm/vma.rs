//! Virtual Memory Areas
//!
//! A [`Vma`] is a contiguous run of pages with uniform protection and
//! backing. It may be mapped into several processes; each mapping is a
//! record in the VMA's mapping pool. A process sees its VMAs through its
//! [`AddressSpace`], a balanced tree ordered by base address.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::error::KernResult;
use crate::kern::kpool::{Pool, PoolSlot};
use crate::kern::lock::{GateCell, Holder};
use crate::types::{PhysAddr, ProcessId, VirtAddr, PAGE_SIZE};

bitflags! {
    /// VMA protection and backing flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VmaFlags: u32 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        const NOCACHE = 1 << 2;
        /// Size and placement cannot change
        const FIXED = 1 << 3;
        /// Fork adds a mapping instead of copying
        const SHARED = 1 << 4;
        /// Anonymous memory, zero-filled on first touch
        const MEMORY = 1 << 5;
        /// Backed by a fixed physical range, populated at creation
        const HASPHYS = 1 << 6;
    }
}

bitflags! {
    /// Access that caused a fault or that a copy needs
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

impl VmaFlags {
    /// Does this protection allow `access`
    pub fn permits(self, access: AccessFlags) -> bool {
        (!access.contains(AccessFlags::READ) || self.contains(VmaFlags::READABLE))
            && (!access.contains(AccessFlags::WRITE) || self.contains(VmaFlags::WRITABLE))
    }
}

/// VMA identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmaId(pub u64);

/// One process's view of a VMA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub pid: ProcessId,
    pub base: VirtAddr,
}

/// Resident page of a VMA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PageEntry {
    pub phys: PhysAddr,
    /// Shared with another VMA until the next write
    pub cow: bool,
    /// Counted in the frame table; false for HASPHYS ranges
    pub owned: bool,
}

pub(crate) struct VmaInner {
    pub flags: VmaFlags,
    pub size: usize,
    /// Page index -> frame
    pub pages: BTreeMap<usize, PageEntry>,
    pub mappings: Pool<Mapping>,
}

/// A virtual memory area
pub struct Vma {
    id: VmaId,
    cookie: u64,
    pub(crate) inner: GateCell<VmaInner>,
}

impl Vma {
    pub(crate) fn new(id: VmaId, cookie: u64, inner: VmaInner) -> Self {
        Self {
            id,
            cookie,
            inner: GateCell::new(inner),
        }
    }

    pub fn id(&self) -> VmaId {
        self.id
    }

    /// Opaque token handed to an external memory manager
    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    pub fn flags(&self, holder: Holder) -> KernResult<VmaFlags> {
        Ok(self.inner.read(holder)?.flags)
    }

    pub fn size(&self, holder: Holder) -> KernResult<usize> {
        Ok(self.inner.read(holder)?.size)
    }

    pub fn mappings(&self, holder: Holder) -> KernResult<Vec<Mapping>> {
        Ok(self.inner.read(holder)?.mappings.iter().map(|(_, m)| m).collect())
    }

    pub fn resident_pages(&self, holder: Holder) -> KernResult<usize> {
        Ok(self.inner.read(holder)?.pages.len())
    }

    /// Frame behind page `index`, if resident
    pub fn frame(&self, holder: Holder, index: usize) -> KernResult<Option<PhysAddr>> {
        Ok(self.inner.read(holder)?.pages.get(&index).map(|p| p.phys))
    }
}

impl core::fmt::Debug for Vma {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vma")
            .field("id", &self.id)
            .field("cookie", &self.cookie)
            .finish_non_exhaustive()
    }
}

/// Snapshot of a VMA as seen from one process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmaInfo {
    pub id: VmaId,
    pub base: VirtAddr,
    pub size: usize,
    pub flags: VmaFlags,
    pub cookie: u64,
}

impl VmaInfo {
    pub fn end(&self) -> VirtAddr {
        self.base.offset(self.size)
    }

    pub fn pages(&self) -> usize {
        self.size / PAGE_SIZE
    }
}

// ============================================================================
// Address Space
// ============================================================================

/// Tree node linking a VMA into one process
pub struct VmaNode {
    pub(crate) vma: Arc<Vma>,
    pub(crate) base: VirtAddr,
    /// This process's record in the VMA's mapping pool
    pub(crate) mapping: PoolSlot,
}

impl VmaNode {
    pub fn vma(&self) -> &Arc<Vma> {
        &self.vma
    }

    pub fn base(&self) -> VirtAddr {
        self.base
    }
}

/// Per-process VMA tree, ordered by base address
pub struct AddressSpace {
    pid: ProcessId,
    pub(crate) tree: BTreeMap<usize, VmaNode>,
}

impl AddressSpace {
    pub fn new(pid: ProcessId) -> Self {
        Self {
            pid,
            tree: BTreeMap::new(),
        }
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Base addresses in ascending order
    pub fn bases(&self) -> Vec<VirtAddr> {
        self.tree.keys().map(|&b| VirtAddr(b)).collect()
    }

    pub fn node(&self, base: VirtAddr) -> Option<&VmaNode> {
        self.tree.get(&base.0)
    }

    /// Node whose area contains `addr`
    pub fn node_containing(&self, holder: Holder, addr: VirtAddr) -> KernResult<Option<&VmaNode>> {
        if let Some((&base, node)) = self.tree.range(..=addr.0).next_back() {
            if addr.0 < base + node.vma.size(holder)? {
                return Ok(Some(node));
            }
        }
        Ok(None)
    }
}

impl core::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("pid", &self.pid)
            .field("vmas", &self.tree.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permits() {
        let rw = VmaFlags::READABLE | VmaFlags::WRITABLE;
        assert!(rw.permits(AccessFlags::READ | AccessFlags::WRITE));
        assert!(VmaFlags::READABLE.permits(AccessFlags::READ));
        assert!(!VmaFlags::READABLE.permits(AccessFlags::WRITE));
        assert!(!VmaFlags::MEMORY.permits(AccessFlags::READ));
    }

    #[test]
    fn test_empty_space() {
        let space = AddressSpace::new(ProcessId(4));
        assert!(space.is_empty());
        assert_eq!(space.pid(), ProcessId(4));
        assert!(space.bases().is_empty());
    }
}
