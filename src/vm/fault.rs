//! Page Fault Resolution
//!
//! Based on Mach4 vm/vm_fault.c
//!
//! The portable half of a page fault: decide whether an access is legal and
//! what it means. Frame-level work (zero fill, copy-on-write copy) is done
//! here through the direct map while the VMA gate is held; the returned
//! [`FaultDecision`] only tells the architecture code which page-table edit
//! to make.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::KernResult;
use crate::kern::lock::Holder;
use crate::types::{PhysAddr, VirtAddr, PAGE_SIZE};

use super::vma::{AccessFlags, AddressSpace, PageEntry, VmaFlags};
use super::VmManager;

/// What the architecture fault handler must do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDecision {
    /// `dest` now holds a copy of the shared `source`; map it writable
    CloneCopyOnWritePage {
        virt: VirtAddr,
        source: PhysAddr,
        dest: PhysAddr,
    },
    /// Last copy-on-write reference; re-enable writes on the same frame
    MakeWriteable { virt: VirtAddr, phys: PhysAddr },
    /// Fresh zero-filled frame for a private area
    MapNewPage { virt: VirtAddr, phys: PhysAddr },
    /// Frame of a shared area, the same for every mapping process
    MapNewSharedPage { virt: VirtAddr, phys: PhysAddr },
    /// Page already resident in a private area
    MapExistingPage {
        virt: VirtAddr,
        phys: PhysAddr,
        writable: bool,
    },
    /// Not memory-backed; the external manager owning `cookie` must supply
    /// the page at `offset` into the area
    DelegateToExternalManager { cookie: u64, offset: usize },
    /// Unmapped address or protection violation
    BadAccess,
}

impl FaultDecision {
    /// Frame to install, if the decision maps one
    pub fn frame(&self) -> Option<PhysAddr> {
        match *self {
            FaultDecision::CloneCopyOnWritePage { dest, .. } => Some(dest),
            FaultDecision::MakeWriteable { phys, .. }
            | FaultDecision::MapNewPage { phys, .. }
            | FaultDecision::MapNewSharedPage { phys, .. }
            | FaultDecision::MapExistingPage { phys, .. } => Some(phys),
            FaultDecision::DelegateToExternalManager { .. } | FaultDecision::BadAccess => None,
        }
    }

    pub fn is_bad(&self) -> bool {
        matches!(self, FaultDecision::BadAccess)
    }
}

/// Fault statistics counters
pub struct FaultStats {
    /// Total faults
    pub total: AtomicU64,
    /// Copy-on-write copies
    pub cow: AtomicU64,
    /// Zero-fill faults
    pub zero_fill: AtomicU64,
    /// Handed to an external manager
    pub delegated: AtomicU64,
    /// Bad accesses
    pub failures: AtomicU64,
}

impl FaultStats {
    pub const fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            cow: AtomicU64::new(0),
            zero_fill: AtomicU64::new(0),
            delegated: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for FaultStats {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for FaultStats {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FaultStats")
            .field("total", &self.total.load(Ordering::Relaxed))
            .field("cow", &self.cow.load(Ordering::Relaxed))
            .field("zero_fill", &self.zero_fill.load(Ordering::Relaxed))
            .field("delegated", &self.delegated.load(Ordering::Relaxed))
            .field("failures", &self.failures.load(Ordering::Relaxed))
            .finish()
    }
}

impl VmManager {
    /// Resolve a fault at `addr` in `space`
    pub fn fault(
        &self,
        space: &AddressSpace,
        holder: Holder,
        addr: VirtAddr,
        access: AccessFlags,
    ) -> KernResult<FaultDecision> {
        let stats = self.stats();
        FaultStats::incr(&stats.total);

        let Some(node) = space.node_containing(holder, addr)? else {
            FaultStats::incr(&stats.failures);
            log::debug!("vm: {} fault at unmapped {}", space.pid(), addr);
            return Ok(FaultDecision::BadAccess);
        };

        let mut inner = node.vma.inner.write(holder)?;
        let flags = inner.flags;
        if !flags.permits(access) {
            FaultStats::incr(&stats.failures);
            log::debug!("vm: {} {:?} denied at {} ({:?})", space.pid(), access, addr, flags);
            return Ok(FaultDecision::BadAccess);
        }

        let virt = addr.page_base();
        let index = (virt.0 - node.base.0) / PAGE_SIZE;
        let shared = flags.contains(VmaFlags::SHARED);
        let writable = flags.contains(VmaFlags::WRITABLE);

        let Some(entry) = inner.pages.get(&index).copied() else {
            if !flags.contains(VmaFlags::MEMORY) {
                FaultStats::incr(&stats.delegated);
                return Ok(FaultDecision::DelegateToExternalManager {
                    cookie: node.vma.cookie(),
                    offset: index * PAGE_SIZE,
                });
            }
            let phys = self.alloc_frame(holder, flags)?;
            inner.pages.insert(
                index,
                PageEntry {
                    phys,
                    cow: false,
                    owned: true,
                },
            );
            FaultStats::incr(&stats.zero_fill);
            return Ok(if shared {
                FaultDecision::MapNewSharedPage { virt, phys }
            } else {
                FaultDecision::MapNewPage { virt, phys }
            });
        };

        if !entry.owned {
            return Ok(FaultDecision::MapExistingPage {
                virt,
                phys: entry.phys,
                writable,
            });
        }
        if shared {
            return Ok(FaultDecision::MapNewSharedPage {
                virt,
                phys: entry.phys,
            });
        }
        if !entry.cow {
            return Ok(FaultDecision::MapExistingPage {
                virt,
                phys: entry.phys,
                writable,
            });
        }
        if !access.contains(AccessFlags::WRITE) {
            return Ok(FaultDecision::MapExistingPage {
                virt,
                phys: entry.phys,
                writable: false,
            });
        }

        // Write to a copy-on-write frame
        if self.frame_refs(holder, entry.phys)? <= 1 {
            if let Some(page) = inner.pages.get_mut(&index) {
                page.cow = false;
            }
            return Ok(FaultDecision::MakeWriteable {
                virt,
                phys: entry.phys,
            });
        }

        let dest = self.alloc_frame(holder, flags)?;
        let from = self.phys.phys_to_virt(entry.phys);
        let to = self.phys.phys_to_virt(dest);
        // SAFETY: both frames are distinct, resident and PAGE_SIZE bytes
        // through the direct map
        unsafe { core::ptr::copy_nonoverlapping(from, to, PAGE_SIZE) };
        inner.pages.insert(
            index,
            PageEntry {
                phys: dest,
                cow: false,
                owned: true,
            },
        );
        self.frame_unref(holder, entry.phys)?;
        FaultStats::incr(&stats.cow);
        log::trace!("vm: {} cow {} {} -> {}", space.pid(), virt, entry.phys, dest);

        Ok(FaultDecision::CloneCopyOnWritePage {
            virt,
            source: entry.phys,
            dest,
        })
    }
}
