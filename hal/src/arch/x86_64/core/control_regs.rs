//! # Control Registers
//!
//! CR4 flag definitions. Reading and writing the register itself goes
//! through [`crate::mmu::ControlRegisters`], because every CR4 update in the
//! kernel is a read-modify-write of a per-CPU shadow rather than of the
//! hardware register.

bitflags::bitflags! {
    /// CR4 - Control Register 4
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Cr4: u64 {
        /// Virtual-8086 mode extensions
        const VME = 1 << 0;
        /// Protected-mode virtual interrupts
        const PVI = 1 << 1;
        /// Time stamp disable (RDTSC restricted to ring 0)
        const TSD = 1 << 2;
        /// Debugging extensions
        const DE = 1 << 3;
        /// Page size extensions
        const PSE = 1 << 4;
        /// Physical address extension
        const PAE = 1 << 5;
        /// Machine check enable
        const MCE = 1 << 6;
        /// Page global enable
        const PGE = 1 << 7;
        /// Performance-monitoring counter enable
        const PCE = 1 << 8;
        /// FXSAVE/FXRSTOR support
        const OSFXSR = 1 << 9;
        /// Unmasked SIMD floating-point exceptions
        const OSXMMEXCPT = 1 << 10;
        /// User-mode instruction prevention
        const UMIP = 1 << 11;
        /// 57-bit linear addresses (5-level paging)
        const LA57 = 1 << 12;
        /// VMX enable
        const VMXE = 1 << 13;
        /// SMX enable
        const SMXE = 1 << 14;
        /// RDFSBASE/WRFSBASE family enable
        const FSGSBASE = 1 << 16;
        /// Process-context identifiers enable
        const PCIDE = 1 << 17;
        /// XSAVE and processor extended states enable
        const OSXSAVE = 1 << 18;
        /// Supervisor-mode execution prevention
        const SMEP = 1 << 20;
        /// Supervisor-mode access prevention
        const SMAP = 1 << 21;
        /// Protection keys for user pages
        const PKE = 1 << 22;
    }
}

impl Cr4 {
    /// Whether global pages are enabled
    #[inline]
    pub const fn global_pages_enabled(self) -> bool {
        self.contains(Cr4::PGE)
    }

    /// Whether PCIDs are enabled
    #[inline]
    pub const fn pcid_enabled(self) -> bool {
        self.contains(Cr4::PCIDE)
    }
}

// =============================================================================
// Tests
// =============================================================================
