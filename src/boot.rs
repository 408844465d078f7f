//! Boot handoff
//!
//! Bootloader formats (ATAG, multiboot) are parsed by architecture code into
//! a [`BootEnvironment`]; the core only sees this normalized descriptor.

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{KernError, KernResult};
use crate::types::{is_page_aligned, VirtAddr, PAGE_SIZE};

/// Memory region types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MemoryKind {
    /// Usable RAM
    Usable = 1,
    /// Reserved by firmware
    Reserved = 2,
    /// ACPI reclaimable
    AcpiReclaimable = 3,
    /// Defective RAM
    BadMemory = 5,
    /// Kernel image and boot modules
    Kernel = 6,
}

/// One entry of the firmware memory map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: usize,
    pub length: usize,
    pub kind: MemoryKind,
}

impl MemoryRegion {
    pub const fn end(&self) -> usize {
        self.base + self.length
    }

    pub const fn contains(&self, base: usize, len: usize) -> bool {
        base >= self.base && base + len <= self.end()
    }
}

/// Initial ramdisk or boot module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootModule {
    pub start: usize,
    pub end: usize,
    pub name: String,
}

/// Virtual window reserved for the kernel heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapWindow {
    pub base: VirtAddr,
    pub len: usize,
}

/// Normalized boot descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootEnvironment {
    pub memory_map: Vec<MemoryRegion>,
    pub modules: Vec<BootModule>,
    pub page_size: usize,
    /// Raw loader flags, passed through untouched
    pub flags: u32,
    pub heap_window: HeapWindow,
}

impl BootEnvironment {
    /// Sanity-check the descriptor before anything is built on it
    pub fn validate(&self) -> KernResult<()> {
        if self.page_size != PAGE_SIZE {
            return Err(KernError::InvalidArgument);
        }

        let mut regions: Vec<&MemoryRegion> = self.memory_map.iter().collect();
        regions.sort_by_key(|r| r.base);
        for pair in regions.windows(2) {
            if pair[0].end() > pair[1].base {
                return Err(KernError::AlreadyExists);
            }
        }

        for module in &self.modules {
            if module.start > module.end {
                return Err(KernError::InvalidArgument);
            }
        }

        let window = self.heap_window;
        if window.len == 0 {
            return Err(KernError::InvalidArgument);
        }
        if !window.base.is_page_aligned() || !is_page_aligned(window.len) {
            return Err(KernError::Misaligned);
        }
        let backed = self
            .memory_map
            .iter()
            .any(|r| r.kind == MemoryKind::Usable && r.contains(window.base.0, window.len));
        if !backed {
            return Err(KernError::BadAddress);
        }
        Ok(())
    }

    /// Total usable RAM in the map
    pub fn usable_bytes(&self) -> usize {
        self.memory_map
            .iter()
            .filter(|r| r.kind == MemoryKind::Usable)
            .map(|r| r.length)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn env() -> BootEnvironment {
        BootEnvironment {
            memory_map: vec![
                MemoryRegion {
                    base: 0,
                    length: 0x10_0000,
                    kind: MemoryKind::Reserved,
                },
                MemoryRegion {
                    base: 0x10_0000,
                    length: 0x100_0000,
                    kind: MemoryKind::Usable,
                },
            ],
            modules: vec![BootModule {
                start: 0x20_0000,
                end: 0x28_0000,
                name: String::from("initrd"),
            }],
            page_size: PAGE_SIZE,
            flags: 0,
            heap_window: HeapWindow {
                base: VirtAddr(0x40_0000),
                len: 0x10_0000,
            },
        }
    }

    #[test]
    fn test_valid_environment() {
        let env = env();
        assert!(env.validate().is_ok());
        assert_eq!(env.usable_bytes(), 0x100_0000);
    }

    #[test]
    fn test_overlapping_regions() {
        let mut env = env();
        env.memory_map[0].length = 0x20_0000;
        assert_eq!(env.validate(), Err(KernError::AlreadyExists));
    }

    #[test]
    fn test_heap_window_checks() {
        let mut env = env();
        env.heap_window.base = VirtAddr(0x40_0010);
        assert_eq!(env.validate(), Err(KernError::Misaligned));

        let mut env2 = self::env();
        env2.heap_window.base = VirtAddr(0x10_0000_0000);
        assert_eq!(env2.validate(), Err(KernError::BadAddress));

        let mut env3 = self::env();
        env3.page_size = 8192;
        assert_eq!(env3.validate(), Err(KernError::InvalidArgument));
    }
}
