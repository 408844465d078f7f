//! Common types used across the kernel core
//!
//! Identifiers, address newtypes and page arithmetic shared by every
//! subsystem. Kept free of dependencies to avoid circular imports.

use core::fmt;

/// Size of a page frame in bytes
pub const PAGE_SIZE: usize = 4096;

/// log2(PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;

// ============================================================================
// Identifiers
// ============================================================================

/// Thread identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ThreadId(pub u64);

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ProcessId(pub u64);

/// Logical CPU number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CpuId(pub u32);

impl CpuId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid {}", self.0)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {}", self.0)
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu {}", self.0)
    }
}

// ============================================================================
// Addresses
// ============================================================================

/// Physical address as handed out by the physical page service
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PhysAddr(pub usize);

/// Virtual address inside some address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VirtAddr(pub usize);

impl PhysAddr {
    pub const fn as_usize(self) -> usize {
        self.0
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }

    pub const fn offset(self, bytes: usize) -> Self {
        PhysAddr(self.0 + bytes)
    }
}

impl VirtAddr {
    pub const fn as_usize(self) -> usize {
        self.0
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }

    /// Round down to the containing page
    pub const fn page_base(self) -> Self {
        VirtAddr(self.0 & !(PAGE_SIZE - 1))
    }

    pub const fn offset(self, bytes: usize) -> Self {
        VirtAddr(self.0 + bytes)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{:#x}", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{:#x}", self.0)
    }
}

/// Round `value` up to a multiple of `align` (a power of two)
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Round `value` down to a multiple of `align` (a power of two)
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

pub const fn is_page_aligned(value: usize) -> bool {
    value & (PAGE_SIZE - 1) == 0
}

/// Number of pages needed to cover `bytes`
pub const fn pages_for(bytes: usize) -> usize {
    align_up(bytes, PAGE_SIZE) >> PAGE_SHIFT
}

// ============================================================================
// Process Identity
// ============================================================================

/// Privileged identity assigned to a system process, used for signal routing
/// and role-addressed messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    /// System executive: receives thread and process death notifications
    Executive,
    /// External memory manager for non memory-backed VMAs
    Pager,
    /// Any other named service
    Service(u16),
}

/// Privilege layer of a process. Lower is more privileged; this is
/// independent of the hardware privilege rings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Layer(pub u8);

impl Layer {
    pub const EXECUTIVE: Layer = Layer(0);
    pub const DRIVER: Layer = Layer(1);
    pub const SERVER: Layer = Layer(2);
    pub const USER: Layer = Layer(3);
}

impl Default for Layer {
    fn default() -> Self {
        Layer::USER
    }
}
