//! # TLB Shootdown
//!
//! Entry points used by the memory manager after it changes page tables.
//! The initiating CPU publishes the change by bumping the generation, flushes
//! itself if the address space is loaded, and pushes the request to every
//! other CPU in the affinity set. Receivers run the same decision against
//! their own state in [`TlbShootdown::handle_flush_ipi`].
//!
//! Kernel mappings are global and shared by every address space, so changes
//! to them carry no generation: [`TlbShootdown::flush_tlb_kernel_range`]
//! reaches every online CPU, and each one invalidates unconditionally.

use helix_hal::{
    ControlRegisters, CpuMask, Cr4, GlobalFlush, TlbHardware, VirtualAddress, PAGE_SIZE,
};

use crate::engine::{pages_spanned, FlushAction, FlushDecisionEngine, FlushRequest, FLUSH_ALL};
use crate::ledger::AddressSpace;
use crate::percpu::PerCpuTlbState;

/// Delivery of flush requests to other CPUs
///
/// Implementations send an inter-processor interrupt (or queue the request
/// for a paravirtualized backend); each target eventually calls
/// [`TlbShootdown::handle_flush_ipi`] or
/// [`TlbShootdown::handle_kernel_flush_ipi`] with the request.
pub trait Broadcaster<'a> {
    /// Deliver `request` to every CPU in `targets`
    fn broadcast(&mut self, targets: &CpuMask, request: FlushRequest<'a>);

    /// Deliver a kernel mapping change to every CPU in `targets`
    fn broadcast_kernel(&mut self, targets: &CpuMask, request: KernelFlushRequest);
}

/// "The kernel mappings in `[start, end)` changed"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelFlushRequest {
    /// First byte of the range
    pub start: u64,
    /// End of the range (exclusive), or [`FLUSH_ALL`]
    pub end: u64,
}

impl KernelFlushRequest {
    /// Request for `[start, end)`
    pub fn range(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    /// Request for every kernel mapping
    pub const fn all() -> Self {
        Self {
            start: 0,
            end: FLUSH_ALL,
        }
    }

    /// Whether every entry must go
    #[inline]
    pub fn is_full(&self) -> bool {
        self.end == FLUSH_ALL
    }

    /// Pages touched by `[start, end)`
    pub fn page_count(&self) -> u64 {
        pages_spanned(self.start, self.end)
    }
}

/// Flush entry points bound to a decision engine and a broadcaster
#[derive(Debug)]
pub struct TlbShootdown<B> {
    engine: FlushDecisionEngine,
    broadcaster: B,
}

impl<B> TlbShootdown<B> {
    /// Combine an engine with a broadcaster
    pub fn new(engine: FlushDecisionEngine, broadcaster: B) -> Self {
        Self {
            engine,
            broadcaster,
        }
    }

    /// The decision engine
    pub fn engine(&self) -> &FlushDecisionEngine {
        &self.engine
    }

    /// The broadcaster
    pub fn broadcaster(&self) -> &B {
        &self.broadcaster
    }

    /// The broadcaster, mutably
    pub fn broadcaster_mut(&mut self) -> &mut B {
        &mut self.broadcaster
    }
}

impl<'a, B: Broadcaster<'a>> TlbShootdown<B> {
    /// Publish a change to `[start, end)` of `mm` and flush it everywhere
    ///
    /// Must be called after the page tables were updated. `end` may be
    /// [`FLUSH_ALL`]. Returns the request that was published.
    pub fn flush_tlb_mm_range<H: TlbHardware>(
        &mut self,
        state: &mut PerCpuTlbState<'a>,
        mm: &'a AddressSpace,
        start: u64,
        end: u64,
        hw: &mut H,
    ) -> FlushRequest<'a> {
        debug_assert!(!mm.is_init(), "kernel mappings use flush_tlb_kernel_range");

        let new_gen = mm.bump_generation();
        let request = FlushRequest::range(mm, start, end, new_gen);

        if state.is_loaded(mm) {
            let _ = self.engine.flush(state, &request, hw);
        }

        let mut targets = mm.affinity_snapshot();
        targets.clear(state.cpu());
        if !targets.is_empty() {
            log::trace!(
                "TLB: {} shootdown {:?} gen {} -> {} cpus",
                state.cpu(),
                mm.identity(),
                new_gen,
                targets.count()
            );
            self.broadcaster.broadcast(&targets, request);
            tlb_stat!(broadcasts);
        }
        request
    }

    /// Publish a change to the whole of `mm`
    pub fn flush_tlb_mm<H: TlbHardware>(
        &mut self,
        state: &mut PerCpuTlbState<'a>,
        mm: &'a AddressSpace,
        hw: &mut H,
    ) -> FlushRequest<'a> {
        self.flush_tlb_mm_range(state, mm, 0, FLUSH_ALL, hw)
    }

    /// Publish a change to the page containing `addr`
    pub fn flush_tlb_page<H: TlbHardware>(
        &mut self,
        state: &mut PerCpuTlbState<'a>,
        mm: &'a AddressSpace,
        addr: VirtualAddress,
        hw: &mut H,
    ) -> FlushRequest<'a> {
        let start = addr.page_base().as_u64();
        self.flush_tlb_mm_range(state, mm, start, start + PAGE_SIZE, hw)
    }

    /// Flush kernel mappings in `[start, end)` on every CPU in `online`
    ///
    /// Must be called after the kernel page tables were updated. This CPU
    /// flushes first; the rest of `online` gets the request.
    pub fn flush_tlb_kernel_range<H>(
        &mut self,
        state: &mut PerCpuTlbState<'_>,
        online: &CpuMask,
        start: u64,
        end: u64,
        hw: &mut H,
    ) -> KernelFlushRequest
    where
        H: TlbHardware + ControlRegisters,
    {
        let request = KernelFlushRequest::range(start, end);
        self.flush_kernel_local(state, &request, hw);

        let mut targets = *online;
        targets.clear(state.cpu());
        if !targets.is_empty() {
            log::trace!(
                "TLB: {} kernel shootdown {:#x}..{:#x} -> {} cpus",
                state.cpu(),
                start,
                end,
                targets.count()
            );
            self.broadcaster.broadcast_kernel(&targets, request);
            tlb_stat!(broadcasts);
        }
        request
    }

    /// Drop every translation, global entries included, on every CPU in
    /// `online`
    pub fn flush_tlb_all<H>(
        &mut self,
        state: &mut PerCpuTlbState<'_>,
        online: &CpuMask,
        hw: &mut H,
    ) -> KernelFlushRequest
    where
        H: TlbHardware + ControlRegisters,
    {
        self.flush_tlb_kernel_range(state, online, 0, FLUSH_ALL, hw)
    }
}

impl<B> TlbShootdown<B> {
    /// Handle a request broadcast by another CPU
    pub fn handle_flush_ipi<H: TlbHardware>(
        &self,
        state: &mut PerCpuTlbState<'_>,
        request: &FlushRequest<'_>,
        hw: &mut H,
    ) -> FlushAction {
        tlb_stat!(ipis_received);
        self.engine.flush(state, request, hw)
    }

    /// Handle a kernel mapping change broadcast by another CPU
    pub fn handle_kernel_flush_ipi<H>(
        &self,
        state: &mut PerCpuTlbState<'_>,
        request: &KernelFlushRequest,
        hw: &mut H,
    ) where
        H: TlbHardware + ControlRegisters,
    {
        tlb_stat!(ipis_received);
        self.flush_kernel_local(state, request, hw);
    }

    /// Invalidate `request` on this CPU; INVLPG also drops global entries
    fn flush_kernel_local<H>(
        &self,
        state: &mut PerCpuTlbState<'_>,
        request: &KernelFlushRequest,
        hw: &mut H,
    ) where
        H: TlbHardware + ControlRegisters,
    {
        let ceiling = self.engine.config().single_page_flush_ceiling as u64;
        if request.is_full()
            || !state.features().page_granular()
            || request.page_count() > ceiling
        {
            flush_tlb_all_local(state, hw);
            return;
        }

        let end = VirtualAddress::new(request.end);
        let mut page = VirtualAddress::new(request.start).page_base();
        while page < end {
            hw.invalidate_page(page);
            page = page.next_page();
        }
        tlb_stat!(range_flushes);
        tlb_stat!(pages_flushed, request.page_count());
    }
}

/// Flush this CPU's entire TLB, global kernel entries included
///
/// Uses INVPCID when available. Otherwise toggling CR4.PGE drops everything;
/// without global pages a reload of the active root is enough.
pub fn flush_tlb_all_local<H>(state: &mut PerCpuTlbState<'_>, hw: &mut H)
where
    H: TlbHardware + ControlRegisters,
{
    match GlobalFlush::select(state.features(), state.cr4().read()) {
        GlobalFlush::Invpcid => hw.invalidate_everything(),
        GlobalFlush::TogglePge => {
            let flags = hw.local_irq_save();
            state.cr4_mut().toggle_bits_irqsoff(Cr4::PGE, hw);
            state.cr4_mut().toggle_bits_irqsoff(Cr4::PGE, hw);
            hw.local_irq_restore(flags);
        },
        GlobalFlush::ReloadCr3 => {
            let mm = state.loaded_mm();
            hw.write_active_context(mm.root(), state.hw_pcid(state.loaded_asid()), false);
        },
    }
    tlb_stat!(full_flushes);
}

// =============================================================================
// Tests
// =============================================================================
