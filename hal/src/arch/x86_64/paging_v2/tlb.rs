//! # TLB Encodings
//!
//! PCIDs, the ASID numeric domain, CR3 composition and INVPCID descriptors.
//!
//! ## ASID vs PCID
//!
//! The flush protocol hands out small zero-based *ASIDs* (slot indices in a
//! per-CPU ring). The hardware sees a *PCID*, which is always `asid + 1`:
//!
//! ```text
//!   ASID (software)   0    1    2   ...   MAX_ASID_AVAILABLE
//!                     │    │    │              │
//!   PCID (hardware)   1    2    3   ...   MAX_ASID_AVAILABLE + 1
//!
//!   PCID 0 is left to PCID-unaware code (early boot, firmware calls).
//! ```
//!
//! If such code saves CR3, loads a PCID-0 value and restores, no ASID in
//! use by the protocol is corrupted. A PCID-tagged CR3 loaded while
//! CR4.PCIDE is off also faults deterministically instead of silently
//! working.

use core::fmt;

use super::addresses::{PhysicalAddress, VirtualAddress};
use crate::arch::x86_64::core::control_regs::Cr4;
use crate::arch::x86_64::core::features::TlbFeatures;

// =============================================================================
// ASID Numeric Domain
// =============================================================================

/// Width of the PCID field in CR3
pub const CR3_HW_ASID_BITS: u32 = 12;

/// Bits consumed by page-table isolation for user/kernel switches
pub const PTI_CONSUMED_ASID_BITS: u32 = if cfg!(feature = "pti") { 1 } else { 0 };

/// Bits available to the flush protocol
pub const CR3_AVAIL_ASID_BITS: u32 = CR3_HW_ASID_BITS - PTI_CONSUMED_ASID_BITS;

/// Largest usable ASID
///
/// ASIDs are zero-based (one value lost) and PCID 0 is reserved for
/// PCID-unaware callers (a second value lost).
pub const MAX_ASID_AVAILABLE: u16 = ((1u32 << CR3_AVAIL_ASID_BITS) - 2) as u16;

/// CR3 bit 63: keep the cached entries of the loaded PCID
pub const CR3_NOFLUSH: u64 = 1 << 63;

/// CR3 bits 0-11: the PCID field
pub const CR3_PCID_MASK: u64 = 0xFFF;

// =============================================================================
// PCID (Process Context Identifier)
// =============================================================================

/// Process Context Identifier
///
/// 12-bit tag attached to TLB entries. [`Pcid::RESERVED`] (0) is what
/// untagged CR3 values carry.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Pcid(u16);

impl Pcid {
    /// Maximum PCID value (12-bit)
    pub const MAX: u16 = 0xFFF;

    /// PCID used by PCID-unaware code and by untagged CR3 loads
    pub const RESERVED: Pcid = Pcid(0);

    /// Create a new PCID
    ///
    /// # Panics
    ///
    /// Panics if the value is > 4095.
    #[inline]
    pub const fn new(value: u16) -> Self {
        assert!(value <= Self::MAX);
        Self(value)
    }

    /// Get the PCID value
    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Check if this is the reserved PCID
    #[inline]
    pub const fn is_reserved(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Pcid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pcid({})", self.0)
    }
}

impl fmt::Display for Pcid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The PCID a protocol ASID is loaded under
#[inline]
pub const fn kern_pcid(asid: u16) -> Pcid {
    debug_assert!(asid <= MAX_ASID_AVAILABLE);
    Pcid(asid + 1)
}

// =============================================================================
// CR3 Composition
// =============================================================================

/// Compose a CR3 value
///
/// With `pcid_enabled` the root is tagged with `kern_pcid(asid)`; otherwise
/// `asid` must be 0 and no tag is written.
#[inline]
pub const fn build_cr3(root: PhysicalAddress, asid: u16, pcid_enabled: bool) -> u64 {
    if pcid_enabled {
        root.as_u64() | kern_pcid(asid).as_u16() as u64
    } else {
        debug_assert!(asid == 0);
        root.as_u64()
    }
}

/// Compose a CR3 value that keeps the target PCID's cached entries
///
/// Only valid when PCIDs are enabled.
#[inline]
pub const fn build_cr3_noflush(root: PhysicalAddress, asid: u16) -> u64 {
    debug_assert!(asid <= MAX_ASID_AVAILABLE);
    root.as_u64() | kern_pcid(asid).as_u16() as u64 | CR3_NOFLUSH
}

/// Compose a CR3 value from an already-derived PCID
#[inline]
pub const fn cr3_for_pcid(root: PhysicalAddress, pcid: Pcid, no_flush: bool) -> u64 {
    let value = root.as_u64() | pcid.as_u16() as u64;
    if no_flush {
        debug_assert!(!pcid.is_reserved());
        value | CR3_NOFLUSH
    } else {
        value
    }
}

// =============================================================================
// INVPCID Types
// =============================================================================

/// INVPCID operation types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum InvpcidType {
    /// Invalidate single address for specific PCID
    IndividualAddress = 0,

    /// Invalidate all entries for specific PCID
    SingleContext = 1,

    /// Invalidate all entries for all PCIDs including globals
    AllContextsIncludingGlobals = 2,

    /// Invalidate all entries for all PCIDs except globals
    AllContextsExceptGlobals = 3,
}

/// INVPCID descriptor
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct InvpcidDescriptor {
    pcid: u64,
    address: u64,
}

impl InvpcidDescriptor {
    /// Descriptor for one address of one PCID
    #[inline]
    pub const fn new(pcid: Pcid, address: VirtualAddress) -> Self {
        Self {
            pcid: pcid.0 as u64,
            address: address.as_u64(),
        }
    }

    /// Descriptor for a single-context invalidation
    #[inline]
    pub const fn single_context(pcid: Pcid) -> Self {
        Self {
            pcid: pcid.0 as u64,
            address: 0,
        }
    }

    /// Descriptor for the all-context forms
    #[inline]
    pub const fn global() -> Self {
        Self { pcid: 0, address: 0 }
    }
}

// =============================================================================
// Global Flush
// =============================================================================

/// How to drop every cached translation of a CPU, global entries included
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalFlush {
    /// INVPCID all-contexts-including-globals
    Invpcid,
    /// Clear CR4.PGE and set it again, with interrupts disabled
    TogglePge,
    /// Reload CR3; only total while there are no global entries
    ReloadCr3,
}

impl GlobalFlush {
    /// Pick the primitive for a CPU with `features` running with `cr4`
    #[inline]
    pub const fn select(features: TlbFeatures, cr4: Cr4) -> Self {
        if features.contains(TlbFeatures::INVPCID) {
            GlobalFlush::Invpcid
        } else if cr4.global_pages_enabled() {
            GlobalFlush::TogglePge
        } else {
            GlobalFlush::ReloadCr3
        }
    }
}

// =============================================================================
// Compile-time Assertions
// =============================================================================

static_assertions::assert_eq_size!(InvpcidDescriptor, [u64; 2]);
static_assertions::const_assert!(Pcid::MAX as u64 == CR3_PCID_MASK);
static_assertions::const_assert!(MAX_ASID_AVAILABLE as u32 + 1 <= Pcid::MAX as u32);

// =============================================================================
// Tests
// =============================================================================
