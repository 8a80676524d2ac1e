//! # Per-CPU TLB State
//!
//! Everything one CPU knows about its own translation cache: which address
//! space is loaded and under which ASID, whether it is only being kept
//! lazily, its CR4 shadow and its context ring.
//!
//! A [`PerCpuTlbState`] only comes into existence through
//! [`initialize_percpu_state`], so every operation that takes one runs on an
//! initialized CPU. It is owned by its CPU; other CPUs reach it only through
//! broadcast requests that the owner evaluates itself.
//!
//! Switches run with interrupts disabled: a flush request must never see
//! the new root in CR3 while the loaded address space still names the old
//! one.
//!
//! ## Switch Sequence
//!
//! ```text
//!   prev.affinity_remove(me)        (unless prev is init)
//!   next.affinity_insert(me)        (unless next is init)   ─┐ SeqCst
//!   next_gen = next.generation      ◀───────────────────────┘
//!   grant = ring.acquire_slot(next, next_gen)
//!   write_active_context(next.root, pcid(grant.asid), no_flush = !grant.need_flush)
//! ```

use helix_hal::arch::x86_64::core::features::boot_features;
use helix_hal::arch::x86_64::paging_v2::tlb::kern_pcid;
use helix_hal::{ControlRegisters, CpuId, Cr4, Pcid, TlbFeatures, TlbHardware};

use crate::asid::AsidAllocator;
use crate::cr4::{mmu_cr4_features, Cr4Shadow};
use crate::ledger::AddressSpace;

/// Result of [`PerCpuTlbState::switch_to`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchOutcome {
    /// The address space was already active; nothing was written
    AlreadyLoaded,
    /// Loaded under an ASID whose cached entries are still current
    Reused {
        /// Slot used
        asid: u16,
    },
    /// Loaded with the ASID's cached entries discarded
    Flushed {
        /// Slot used
        asid: u16,
    },
}

/// TLB state of one CPU
#[derive(Debug)]
#[repr(C, align(64))]
pub struct PerCpuTlbState<'a> {
    cpu: CpuId,
    features: TlbFeatures,
    loaded_mm: &'a AddressSpace,
    loaded_asid: u16,
    is_lazy: bool,
    asids: AsidAllocator,
    cr4: Cr4Shadow,
    init_mm: &'a AddressSpace,
}

/// Bring up the TLB state of the executing CPU
///
/// Initializes the CR4 shadow from hardware, enables PCIDs when `features`
/// allows tagged contexts, and loads `init_mm` under ASID 0 with a flush.
/// The ring starts out empty.
pub fn initialize_percpu_state<'a, H>(
    cpu: CpuId,
    features: TlbFeatures,
    init_mm: &'a AddressSpace,
    hw: &mut H,
) -> PerCpuTlbState<'a>
where
    H: TlbHardware + ControlRegisters,
{
    debug_assert!(init_mm.is_init());

    let mut cr4 = Cr4Shadow::init(hw);
    if features.contains(TlbFeatures::PGE) {
        cr4.set_bits(Cr4::PGE, hw);
    }
    if features.tagged() {
        // PCIDE may only be set while the loaded PCID is 0, i.e. before the
        // first tagged root below.
        cr4.set_bits(Cr4::PCIDE, hw);
    }

    let state = PerCpuTlbState {
        cpu,
        features,
        loaded_mm: init_mm,
        loaded_asid: 0,
        is_lazy: false,
        asids: AsidAllocator::new(),
        cr4,
        init_mm,
    };
    hw.write_active_context(init_mm.root(), state.hw_pcid(0), false);

    log::info!(
        "TLB: {} online, {} mode, cr4={:?}",
        cpu,
        if features.tagged() { "tagged" } else { "untagged" },
        state.cr4.read()
    );
    state
}

/// Bring up a secondary CPU with the boot CPU's recorded configuration
///
/// Uses the features recorded by `helix_hal`'s boot record and applies the
/// CR4 bits the boot CPU published. Without a boot record the CPU runs
/// untagged with whole-TLB flushes only.
pub fn initialize_secondary_percpu_state<'a, H>(
    cpu: CpuId,
    init_mm: &'a AddressSpace,
    hw: &mut H,
) -> PerCpuTlbState<'a>
where
    H: TlbHardware + ControlRegisters,
{
    let features = boot_features().unwrap_or_else(|| {
        log::warn!("TLB: {} brought up before boot features were recorded", cpu);
        TlbFeatures::empty()
    });
    let mut state = initialize_percpu_state(cpu, features, init_mm, hw);
    state.cr4.set_bits(mmu_cr4_features(), hw);
    state
}

impl<'a> PerCpuTlbState<'a> {
    /// The CPU this state belongs to
    #[inline]
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    /// TLB capabilities this CPU runs with
    #[inline]
    pub fn features(&self) -> TlbFeatures {
        self.features
    }

    /// Whether contexts stay tagged across switches
    #[inline]
    pub fn tagged(&self) -> bool {
        self.features.tagged()
    }

    /// Address space currently loaded
    #[inline]
    pub fn loaded_mm(&self) -> &'a AddressSpace {
        self.loaded_mm
    }

    /// Ring slot of the loaded address space
    #[inline]
    pub fn loaded_asid(&self) -> u16 {
        self.loaded_asid
    }

    /// Whether the loaded address space is only kept lazily
    #[inline]
    pub fn is_lazy(&self) -> bool {
        self.is_lazy
    }

    /// The kernel's init address space
    #[inline]
    pub fn init_mm(&self) -> &'a AddressSpace {
        self.init_mm
    }

    /// The context ring
    #[inline]
    pub fn asids(&self) -> &AsidAllocator {
        &self.asids
    }

    /// CR4 shadow
    #[inline]
    pub fn cr4(&self) -> &Cr4Shadow {
        &self.cr4
    }

    /// CR4 shadow, for updates
    #[inline]
    pub fn cr4_mut(&mut self) -> &mut Cr4Shadow {
        &mut self.cr4
    }

    /// Whether `mm` is the loaded address space
    #[inline]
    pub fn is_loaded(&self, mm: &AddressSpace) -> bool {
        self.loaded_mm.identity() == mm.identity()
    }

    /// Hardware identifier for `asid` in this CPU's mode
    #[inline]
    pub fn hw_pcid(&self, asid: u16) -> Pcid {
        if self.tagged() {
            kern_pcid(asid)
        } else {
            debug_assert!(asid == 0);
            Pcid::RESERVED
        }
    }

    /// Make `next` the active address space
    ///
    /// Interrupts must be disabled.
    pub fn switch_to<H>(&mut self, next: &'a AddressSpace, hw: &mut H) -> SwitchOutcome
    where
        H: TlbHardware + ControlRegisters,
    {
        debug_assert!(hw.irqs_disabled(), "address space switched with interrupts enabled");
        if self.is_loaded(next) {
            if !self.is_lazy {
                return SwitchOutcome::AlreadyLoaded;
            }
            return self.leave_lazy(hw);
        }

        let prev = self.loaded_mm;
        if !prev.is_init() {
            prev.affinity_remove(self.cpu);
        }
        if !next.is_init() {
            next.affinity_insert(self.cpu);
        }
        let next_gen = next.generation_after_join();

        let grant = self.asids.acquire_slot(next, next_gen, self.tagged());
        self.load(next, grant.asid, !grant.need_flush, hw);
        if grant.need_flush {
            self.asids.set_generation(grant.asid, next_gen);
        }

        self.loaded_mm = next;
        self.loaded_asid = grant.asid;
        self.is_lazy = false;

        log::trace!(
            "TLB: {} switch {:?} -> {:?} asid {} gen {}{}",
            self.cpu,
            prev.identity(),
            next.identity(),
            grant.asid,
            next_gen,
            if grant.need_flush { " (flush)" } else { "" }
        );

        if grant.need_flush {
            SwitchOutcome::Flushed { asid: grant.asid }
        } else {
            SwitchOutcome::Reused { asid: grant.asid }
        }
    }

    /// Resume the lazily kept address space for real
    fn leave_lazy<H>(&mut self, hw: &mut H) -> SwitchOutcome
    where
        H: TlbHardware + ControlRegisters,
    {
        debug_assert!(hw.irqs_disabled());
        self.is_lazy = false;
        let mm = self.loaded_mm;
        let asid = self.loaded_asid;
        log::debug!("TLB: {} leaves lazy mode on {:?}", self.cpu, mm.identity());

        // The affinity bit was kept while lazy, so no rejoin is needed
        // before reading the generation.
        debug_assert!(mm.affinity_contains(self.cpu));
        let next_gen = mm.generation_after_join();
        if self.asids.slot(asid).tlb_gen >= next_gen {
            return SwitchOutcome::AlreadyLoaded;
        }

        self.load(mm, asid, false, hw);
        self.asids.set_generation(asid, next_gen);
        SwitchOutcome::Flushed { asid }
    }

    fn load<H: TlbHardware>(&self, mm: &AddressSpace, asid: u16, no_flush: bool, hw: &mut H) {
        hw.write_active_context(mm.root(), self.hw_pcid(asid), no_flush && self.tagged());
    }

    pub(crate) fn asids_mut(&mut self) -> &mut AsidAllocator {
        &mut self.asids
    }

    pub(crate) fn set_lazy(&mut self) {
        debug_assert!(!self.loaded_mm.is_init(), "init address space cannot be lazy");
        self.is_lazy = true;
    }
}

// =============================================================================
// Tests
// =============================================================================
