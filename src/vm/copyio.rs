//! Copyin/Copyout
//!
//! Based on Mach4 kern/kern_subr.c
//!
//! Moves bytes between a process's address space and kernel buffers without
//! trusting the process's page tables. Every page is resolved through the
//! VMA tree (faulting in missing pages, breaking copy-on-write for writes)
//! and accessed through the physical direct map. Work is done page by page,
//! so partial mappings are caught before any byte moves.

use crate::error::{KernError, KernResult};
use crate::kern::lock::Holder;
use crate::types::{VirtAddr, PAGE_SIZE};

use super::vma::{AccessFlags, AddressSpace};
use super::VmManager;

impl VmManager {
    /// Fail with `BadAddress` unless `[addr, addr + len)` lies in VMAs that
    /// permit `access`
    pub fn check_range(
        &self,
        space: &AddressSpace,
        holder: Holder,
        addr: VirtAddr,
        len: usize,
        access: AccessFlags,
    ) -> KernResult<()> {
        if len == 0 {
            return Ok(());
        }
        let end = addr.0.checked_add(len).ok_or(KernError::BadAddress)?;
        let mut cursor = addr.0;
        while cursor < end {
            let node = space
                .node_containing(holder, VirtAddr(cursor))?
                .ok_or(KernError::BadAddress)?;
            let (flags, size) = {
                let inner = node.vma().inner.read(holder)?;
                (inner.flags, inner.size)
            };
            if !flags.permits(access) {
                return Err(KernError::BadAddress);
            }
            cursor = node.base().0 + size;
        }
        Ok(())
    }

    /// Resolve the page holding `addr` and return a kernel pointer to it
    fn resolve(
        &self,
        space: &AddressSpace,
        holder: Holder,
        addr: VirtAddr,
        access: AccessFlags,
    ) -> KernResult<*mut u8> {
        let frame = self
            .fault(space, holder, addr, access)?
            .frame()
            .ok_or(KernError::BadAddress)?;
        Ok(self.phys.phys_to_virt(frame).wrapping_add(addr.0 % PAGE_SIZE))
    }

    /// Copy `dst.len()` bytes from `src` in `space` into a kernel buffer
    pub fn copy_in(
        &self,
        space: &AddressSpace,
        holder: Holder,
        src: VirtAddr,
        dst: &mut [u8],
    ) -> KernResult<()> {
        self.check_range(space, holder, src, dst.len(), AccessFlags::READ)?;
        let mut done = 0;
        while done < dst.len() {
            let at = src.offset(done);
            let chunk = (PAGE_SIZE - at.0 % PAGE_SIZE).min(dst.len() - done);
            let from = self.resolve(space, holder, at, AccessFlags::READ)?;
            // SAFETY: `from` addresses `chunk` bytes inside one resident
            // frame; `dst` is a distinct kernel buffer
            unsafe { core::ptr::copy_nonoverlapping(from, dst[done..].as_mut_ptr(), chunk) };
            done += chunk;
        }
        Ok(())
    }

    /// Copy a kernel buffer to `dst` in `space`
    pub fn copy_out(
        &self,
        space: &AddressSpace,
        holder: Holder,
        dst: VirtAddr,
        src: &[u8],
    ) -> KernResult<()> {
        self.check_range(space, holder, dst, src.len(), AccessFlags::WRITE)?;
        let mut done = 0;
        while done < src.len() {
            let at = dst.offset(done);
            let chunk = (PAGE_SIZE - at.0 % PAGE_SIZE).min(src.len() - done);
            let to = self.resolve(space, holder, at, AccessFlags::WRITE)?;
            // SAFETY: as in copy_in, with the roles swapped
            unsafe { core::ptr::copy_nonoverlapping(src[done..].as_ptr(), to, chunk) };
            done += chunk;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProcessId;
    use crate::vm::testutil::{fixture, H};
    use crate::vm::VmaFlags;
    use alloc::vec;

    const RW: VmaFlags = VmaFlags::READABLE
        .union(VmaFlags::WRITABLE)
        .union(VmaFlags::MEMORY);

    #[test]
    fn test_round_trip_across_pages() {
        let f = fixture();
        let mut space = AddressSpace::new(ProcessId(1));
        let base = VirtAddr(0x10000);
        f.vm.add_vma(&mut space, H, base, 2 * PAGE_SIZE, RW, 0).unwrap();
        f.vm.add_vma(&mut space, H, base.offset(2 * PAGE_SIZE), PAGE_SIZE, RW, 0)
            .unwrap();

        let data: alloc::vec::Vec<u8> = (0..2 * PAGE_SIZE).map(|i| (i % 251) as u8).collect();
        let at = base.offset(PAGE_SIZE / 2);
        f.vm.copy_out(&space, H, at, &data).unwrap();

        let mut back = vec![0u8; data.len()];
        f.vm.copy_in(&space, H, at, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_rejects_holes_and_protection() {
        let f = fixture();
        let mut space = AddressSpace::new(ProcessId(1));
        let base = VirtAddr(0x10000);
        f.vm.add_vma(&mut space, H, base, PAGE_SIZE, RW, 0).unwrap();
        f.vm.add_vma(
            &mut space,
            H,
            base.offset(2 * PAGE_SIZE),
            PAGE_SIZE,
            VmaFlags::READABLE | VmaFlags::MEMORY,
            0,
        )
        .unwrap();

        // Runs into the hole after the first area
        let mut buf = [0u8; 64];
        assert_eq!(
            f.vm.copy_in(&space, H, base.offset(PAGE_SIZE - 32), &mut buf),
            Err(KernError::BadAddress)
        );
        assert_eq!(
            f.vm.copy_out(&space, H, base.offset(2 * PAGE_SIZE), &buf),
            Err(KernError::BadAddress)
        );
        assert!(f.vm.copy_in(&space, H, base.offset(2 * PAGE_SIZE), &mut buf).is_ok());
        assert_eq!(buf, [0u8; 64]);
    }

    #[test]
    fn test_copy_out_breaks_cow() {
        let f = fixture();
        let mut parent = AddressSpace::new(ProcessId(1));
        let mut child = AddressSpace::new(ProcessId(2));
        let base = VirtAddr(0x10000);
        f.vm.add_vma(&mut parent, H, base, PAGE_SIZE, RW, 0).unwrap();
        f.vm.copy_out(&parent, H, base, b"parent").unwrap();
        f.vm.duplicate_vmas(&mut child, &parent, H).unwrap();

        f.vm.copy_out(&child, H, base, b"child!").unwrap();

        let mut seen = [0u8; 6];
        f.vm.copy_in(&parent, H, base, &mut seen).unwrap();
        assert_eq!(&seen, b"parent");
        f.vm.copy_in(&child, H, base, &mut seen).unwrap();
        assert_eq!(&seen, b"child!");
    }
}
