//! # CR4 Shadow
//!
//! Per-CPU cache of the last value written to CR4. Feature queries read the
//! shadow, never the register, and every update is a read-modify-write of
//! the shadow done with interrupts disabled, so an interrupt handler that
//! also touches CR4 can never interleave with it.

use core::sync::atomic::{AtomicU64, Ordering};

use helix_hal::{ControlRegisters, Cr4};

/// CR4 bits every CPU must come up with
///
/// Updated by the boot CPU through [`Cr4Shadow::set_bits_and_update_boot`];
/// read by secondary CPU bring-up.
static MMU_CR4_FEATURES: AtomicU64 = AtomicU64::new(0);

/// CR4 features recorded for secondary CPU bring-up
pub fn mmu_cr4_features() -> Cr4 {
    Cr4::from_bits_retain(MMU_CR4_FEATURES.load(Ordering::Acquire))
}

/// Shadow of one CPU's CR4
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cr4Shadow {
    value: Cr4,
}

impl Cr4Shadow {
    /// Initialize from the hardware register
    pub fn init<H: ControlRegisters>(hw: &H) -> Self {
        Self { value: hw.read_cr4() }
    }

    /// Read the shadow
    #[inline]
    pub fn read(&self) -> Cr4 {
        self.value
    }

    /// Set bits in this CPU's CR4
    pub fn set_bits<H: ControlRegisters>(&mut self, mask: Cr4, hw: &mut H) {
        let flags = hw.local_irq_save();
        let cr4 = self.value;
        if cr4 | mask != cr4 {
            self.write(cr4 | mask, hw);
        }
        hw.local_irq_restore(flags);
    }

    /// Clear bits in this CPU's CR4
    pub fn clear_bits<H: ControlRegisters>(&mut self, mask: Cr4, hw: &mut H) {
        let flags = hw.local_irq_save();
        let cr4 = self.value;
        if cr4 - mask != cr4 {
            self.write(cr4 - mask, hw);
        }
        hw.local_irq_restore(flags);
    }

    /// Flip bits; interrupts must already be disabled
    pub fn toggle_bits_irqsoff<H: ControlRegisters>(&mut self, mask: Cr4, hw: &mut H) {
        let cr4 = self.value;
        self.write(cr4 ^ mask, hw);
    }

    /// Set bits here and in the record secondary CPUs boot with
    ///
    /// Boot CPU only.
    pub fn set_bits_and_update_boot<H: ControlRegisters>(&mut self, mask: Cr4, hw: &mut H) {
        MMU_CR4_FEATURES.fetch_or(mask.bits(), Ordering::AcqRel);
        self.set_bits(mask, hw);
    }

    fn write<H: ControlRegisters>(&mut self, value: Cr4, hw: &mut H) {
        debug_assert!(hw.irqs_disabled(), "CR4 written with interrupts enabled");
        self.value = value;
        hw.write_cr4(value);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{HwOp, SimHardware};

    #[test]
    fn test_init_reads_hardware() {
        let hw = SimHardware::with_cr4(Cr4::PAE | Cr4::PGE);
        let shadow = Cr4Shadow::init(&hw);
        assert_eq!(shadow.read(), Cr4::PAE | Cr4::PGE);
    }

    #[test]
    fn test_set_clear_write_through() {
        let mut hw = SimHardware::with_cr4(Cr4::PAE);
        hw.local_irq_enable();
        let mut shadow = Cr4Shadow::init(&hw);

        shadow.set_bits(Cr4::PGE, &mut hw);
        assert_eq!(hw.cr4(), Cr4::PAE | Cr4::PGE);
        assert_eq!(shadow.read(), hw.cr4());

        shadow.clear_bits(Cr4::PAE, &mut hw);
        assert_eq!(hw.cr4(), Cr4::PGE);
        assert_eq!(hw.cr4_writes(), 2);
        assert!(!hw.irqs_disabled());
    }

    #[test]
    fn test_redundant_updates_skip_hardware() {
        let mut hw = SimHardware::with_cr4(Cr4::PAE | Cr4::PGE);
        let mut shadow = Cr4Shadow::init(&hw);
        shadow.set_bits(Cr4::PGE, &mut hw);
        shadow.clear_bits(Cr4::SMAP, &mut hw);
        assert_eq!(hw.cr4_writes(), 0);
    }

    #[test]
    fn test_queries_use_shadow_not_hardware() {
        let mut hw = SimHardware::with_cr4(Cr4::PAE);
        let shadow = Cr4Shadow::init(&hw);
        // Out-of-band change that bypasses the shadow.
        hw.poke_cr4(Cr4::PAE | Cr4::PCIDE);
        assert!(!shadow.read().pcid_enabled());
    }

    #[test]
    fn test_toggle_twice_restores() {
        let mut hw = SimHardware::with_cr4(Cr4::PGE);
        let mut shadow = Cr4Shadow::init(&hw);
        let flags = hw.local_irq_save();
        shadow.toggle_bits_irqsoff(Cr4::PGE, &mut hw);
        shadow.toggle_bits_irqsoff(Cr4::PGE, &mut hw);
        hw.local_irq_restore(flags);
        assert_eq!(shadow.read(), Cr4::PGE);
        let writes: Vec<_> = hw
            .ops()
            .iter()
            .filter_map(|op| match op {
                HwOp::WriteCr4(v) => Some(*v),
                _ => None,
            })
            .collect();
        assert_eq!(writes, vec![Cr4::empty(), Cr4::PGE]);
    }

    #[test]
    fn test_update_boot_record() {
        let mut hw = SimHardware::with_cr4(Cr4::empty());
        let mut shadow = Cr4Shadow::init(&hw);
        shadow.set_bits_and_update_boot(Cr4::OSXSAVE, &mut hw);
        assert!(mmu_cr4_features().contains(Cr4::OSXSAVE));
        assert!(shadow.read().contains(Cr4::OSXSAVE));
    }
}
