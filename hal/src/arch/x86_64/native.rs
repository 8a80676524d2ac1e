//! # Native MMU Access
//!
//! [`NativeMmu`] implements the [`crate::mmu`] traits with the real
//! privileged instructions. Only built for bare-metal x86_64.

use core::arch::asm;

use super::core::control_regs::Cr4;
use super::core::features::TlbFeatures;
use super::paging_v2::addresses::{PhysicalAddress, VirtualAddress};
use super::paging_v2::tlb::{cr3_for_pcid, GlobalFlush, InvpcidDescriptor, InvpcidType, Pcid};
use crate::mmu::{ControlRegisters, IrqFlags, TlbHardware};

/// RFLAGS.IF
const RFLAGS_IF: u64 = 1 << 9;

/// The executing CPU's MMU
#[derive(Debug, Clone, Copy)]
pub struct NativeMmu {
    features: TlbFeatures,
}

impl NativeMmu {
    /// Wrap the executing CPU
    ///
    /// # Safety
    ///
    /// Must run at CPL 0, and `features` must describe the executing CPU.
    pub const unsafe fn new(features: TlbFeatures) -> Self {
        Self { features }
    }

    /// The features this handle was created with
    pub const fn features(&self) -> TlbFeatures {
        self.features
    }

    #[inline]
    fn invpcid(&self, kind: InvpcidType, descriptor: &InvpcidDescriptor) {
        debug_assert!(self.features.contains(TlbFeatures::INVPCID));
        // SAFETY: INVPCID support was checked at construction; the
        // descriptor is a valid 16-byte in-memory operand.
        unsafe {
            asm!(
                "invpcid {0}, [{1}]",
                in(reg) kind as u64,
                in(reg) descriptor as *const InvpcidDescriptor,
                options(nostack, preserves_flags),
            );
        }
    }

    #[inline]
    fn read_cr3(&self) -> u64 {
        let value: u64;
        // SAFETY: reading CR3 has no side effects at CPL 0.
        unsafe {
            asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags));
        }
        value
    }

    #[inline]
    fn write_cr3(&mut self, value: u64) {
        // SAFETY: callers only load roots owned by a live address space.
        unsafe {
            asm!("mov cr3, {}", in(reg) value, options(nostack, preserves_flags));
        }
    }

    #[inline]
    fn read_rflags(&self) -> u64 {
        let rflags: u64;
        // SAFETY: pushfq/pop only touches the stack slot it allocates.
        unsafe {
            asm!("pushfq", "pop {}", out(reg) rflags, options(nomem, preserves_flags));
        }
        rflags
    }
}

impl TlbHardware for NativeMmu {
    fn write_active_context(&mut self, root: PhysicalAddress, pcid: Pcid, no_flush: bool) {
        debug_assert!(self.features.tagged() || (pcid.is_reserved() && !no_flush));
        self.write_cr3(cr3_for_pcid(root, pcid, no_flush));
    }

    fn invalidate_page(&mut self, addr: VirtualAddress) {
        // SAFETY: INVLPG only drops cached translations.
        unsafe {
            asm!("invlpg [{}]", in(reg) addr.as_u64(), options(nostack, preserves_flags));
        }
    }

    fn invalidate_context(&mut self, pcid: Pcid) {
        self.invpcid(InvpcidType::SingleContext, &InvpcidDescriptor::single_context(pcid));
    }

    fn invalidate_everything(&mut self) {
        let cr4 = self.read_cr4();
        match GlobalFlush::select(self.features, cr4) {
            GlobalFlush::Invpcid => {
                self.invpcid(
                    InvpcidType::AllContextsIncludingGlobals,
                    &InvpcidDescriptor::global(),
                );
            },
            GlobalFlush::TogglePge => {
                // CR4 ends up unchanged, so the per-CPU shadow stays valid.
                let flags = self.local_irq_save();
                self.write_cr4(cr4 - Cr4::PGE);
                self.write_cr4(cr4);
                self.local_irq_restore(flags);
            },
            GlobalFlush::ReloadCr3 => {
                let cr3 = self.read_cr3();
                self.write_cr3(cr3);
            },
        }
    }
}

impl ControlRegisters for NativeMmu {
    fn read_cr4(&self) -> Cr4 {
        let value: u64;
        // SAFETY: reading CR4 has no side effects at CPL 0.
        unsafe {
            asm!("mov {}, cr4", out(reg) value, options(nomem, nostack, preserves_flags));
        }
        Cr4::from_bits_retain(value)
    }

    fn write_cr4(&mut self, value: Cr4) {
        // SAFETY: the caller keeps the per-CPU shadow in sync and only
        // toggles bits the CPU supports.
        unsafe {
            asm!("mov cr4, {}", in(reg) value.bits(), options(nostack, preserves_flags));
        }
    }

    fn local_irq_save(&mut self) -> IrqFlags {
        let flags = IrqFlags::new(self.read_rflags() & RFLAGS_IF != 0);
        // SAFETY: masking interrupts is always permitted at CPL 0.
        unsafe {
            asm!("cli", options(nomem, nostack));
        }
        flags
    }

    fn local_irq_restore(&mut self, flags: IrqFlags) {
        if flags.were_enabled() {
            // SAFETY: restores the state observed by the matching save.
            unsafe {
                asm!("sti", options(nomem, nostack));
            }
        }
    }

    fn irqs_disabled(&self) -> bool {
        self.read_rflags() & RFLAGS_IF == 0
    }
}
