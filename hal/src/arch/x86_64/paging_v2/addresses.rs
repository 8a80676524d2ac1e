//! # Address Types
//!
//! Type-safe physical and virtual addresses. Physical addresses here name
//! translation roots, so they are always page-aligned; virtual addresses are
//! the targets of page invalidation.

use core::fmt;

use super::{PAGE_MASK, PAGE_SIZE, PHYS_ADDR_MASK};

// =============================================================================
// Physical Address
// =============================================================================

/// A page-aligned physical address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    /// Create a physical address
    ///
    /// Bits outside the page-frame field are masked off.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr & PHYS_ADDR_MASK)
    }

    /// Get the raw address value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalAddress({:#x})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// =============================================================================
// Virtual Address
// =============================================================================

/// A virtual (linear) address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    /// Create a virtual address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw address value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check if the address is 4 KiB aligned
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    /// Align down to the containing 4 KiB page
    #[inline]
    pub const fn page_base(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// The next 4 KiB page, saturating at the top of the address space
    #[inline]
    pub const fn next_page(self) -> Self {
        Self(self.page_base().0.saturating_add(PAGE_SIZE))
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualAddress({:#018x})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(addr: u64) -> Self {
        Self::new(addr)
    }
}

// =============================================================================
// Tests
// =============================================================================
