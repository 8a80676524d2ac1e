//! # TLB Feature Detection
//!
//! The CPUID bits that decide how the TLB code may invalidate:
//!
//! | Feature  | CPUID            | Used for                               |
//! |----------|------------------|----------------------------------------|
//! | PCID     | 01H:ECX[17]      | Tagged contexts, NOFLUSH CR3 loads     |
//! | INVPCID  | 07H.0:EBX[10]    | Per-context and global invalidation    |
//! | PGE      | 01H:EDX[13]      | Global kernel entries                  |
//! | INVLPG   | (i486 and later) | Page-granular invalidation             |
//!
//! The boot CPU records what it found once; secondary CPUs read it back so
//! every CPU runs with the same mode.

use spin::Once;

bitflags::bitflags! {
    /// TLB-relevant CPU capabilities
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TlbFeatures: u32 {
        /// Process-context identifiers
        const PCID = 1 << 0;
        /// INVPCID instruction
        const INVPCID = 1 << 1;
        /// Global pages
        const PGE = 1 << 2;
        /// Single-page invalidation
        const INVLPG = 1 << 3;
    }
}

impl TlbFeatures {
    /// Whether contexts can be kept tagged across switches
    ///
    /// PCID without PGE is never used: a per-context flush would then miss
    /// kernel translations cached under other PCIDs. INVPCID is required so
    /// contexts that are not active can still be invalidated.
    #[inline]
    pub const fn tagged(self) -> bool {
        self.contains(TlbFeatures::PCID.union(TlbFeatures::INVPCID).union(TlbFeatures::PGE))
    }

    /// Whether single pages can be invalidated
    #[inline]
    pub const fn page_granular(self) -> bool {
        self.contains(TlbFeatures::INVLPG)
    }

    /// Detect the capabilities of the executing CPU
    #[cfg(target_arch = "x86_64")]
    pub fn detect() -> Self {
        use core::arch::x86_64::{__cpuid, __cpuid_count};

        // SAFETY: CPUID is unconditionally available in long mode.
        let leaf1 = unsafe { __cpuid(1) };
        // SAFETY: as above.
        let max_leaf = unsafe { __cpuid(0) }.eax;
        let leaf7_ebx = if max_leaf >= 7 {
            // SAFETY: leaf 7 exists, as reported by leaf 0.
            unsafe { __cpuid_count(7, 0) }.ebx
        } else {
            0
        };

        let mut features = TlbFeatures::INVLPG;
        if leaf1.ecx & (1 << 17) != 0 {
            features |= TlbFeatures::PCID;
        }
        if leaf1.edx & (1 << 13) != 0 {
            features |= TlbFeatures::PGE;
        }
        if leaf7_ebx & (1 << 10) != 0 {
            features |= TlbFeatures::INVPCID;
        }
        features
    }
}

// =============================================================================
// Boot Record
// =============================================================================

static BOOT_FEATURES: Once<TlbFeatures> = Once::new();

/// Record the boot CPU's features
///
/// Only the first call has an effect; the recorded value is returned.
pub fn record_boot_features(features: TlbFeatures) -> TlbFeatures {
    let recorded = *BOOT_FEATURES.call_once(|| {
        log::info!(
            "TLB: boot features {:?} ({})",
            features,
            if features.tagged() { "tagged" } else { "untagged" }
        );
        features
    });
    if recorded != features {
        log::warn!(
            "TLB: boot features already recorded as {:?}, ignoring {:?}",
            recorded,
            features
        );
    }
    recorded
}

/// Features recorded by the boot CPU, if any
pub fn boot_features() -> Option<TlbFeatures> {
    BOOT_FEATURES.get().copied()
}

// =============================================================================
// Tests
// =============================================================================
