//! # Paging Support
//!
//! Address types and the TLB-side encodings of x86_64 paging.
//!
//! - [`addresses`]: Physical/Virtual address types
//! - [`tlb`]: PCID, ASID numeric domain, CR3 composition, INVPCID descriptors

pub mod addresses;
pub mod tlb;

/// Base page size (4 KiB)
pub const PAGE_SIZE: u64 = 4096;

/// Page offset mask
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// Physical address mask (52-bit physical address space, page-table format)
pub const PHYS_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;
