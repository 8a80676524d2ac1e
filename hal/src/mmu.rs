//! # MMU Hardware Interface
//!
//! The privileged operations the TLB protocol is built on. The protocol code
//! is generic over these traits; [`crate::arch::x86_64::native::NativeMmu`]
//! implements them with real instructions on bare metal, and host tests
//! substitute a simulation.

use crate::arch::x86_64::core::control_regs::Cr4;
use crate::arch::x86_64::paging_v2::addresses::{PhysicalAddress, VirtualAddress};
use crate::arch::x86_64::paging_v2::tlb::Pcid;

/// Translation-cache primitives of one CPU
pub trait TlbHardware {
    /// Load the active translation root
    ///
    /// `pcid` is the hardware identifier (already `asid + 1` when tagging is
    /// in use, [`Pcid::RESERVED`] otherwise). With `no_flush` set the CPU
    /// keeps the entries it already caches for `pcid`; `no_flush` is only
    /// meaningful on tagged hardware.
    fn write_active_context(&mut self, root: PhysicalAddress, pcid: Pcid, no_flush: bool);

    /// Invalidate one page in the active context
    fn invalidate_page(&mut self, addr: VirtualAddress);

    /// Invalidate every non-global entry tagged with `pcid`
    ///
    /// Only valid on hardware with tagged contexts.
    fn invalidate_context(&mut self, pcid: Pcid);

    /// Invalidate every entry of every context, global entries included
    fn invalidate_everything(&mut self);
}

/// Saved interrupt state returned by [`ControlRegisters::local_irq_save`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "interrupt state must be restored"]
pub struct IrqFlags {
    were_enabled: bool,
}

impl IrqFlags {
    /// Wrap a saved state
    #[inline]
    pub const fn new(were_enabled: bool) -> Self {
        Self { were_enabled }
    }

    /// Whether interrupts were enabled before the save
    #[inline]
    pub const fn were_enabled(self) -> bool {
        self.were_enabled
    }
}

/// Control-register and local interrupt access of one CPU
pub trait ControlRegisters {
    /// Read CR4 from hardware
    fn read_cr4(&self) -> Cr4;

    /// Write CR4 to hardware
    fn write_cr4(&mut self, value: Cr4);

    /// Disable local interrupts, returning the previous state
    fn local_irq_save(&mut self) -> IrqFlags;

    /// Restore a state returned by [`Self::local_irq_save`]
    fn local_irq_restore(&mut self, flags: IrqFlags);

    /// Whether local interrupts are currently disabled
    fn irqs_disabled(&self) -> bool;
}
