//! # Deferred Unmap Batch
//!
//! Page reclaim unmaps pages from many address spaces in a row. Instead of
//! one shootdown per unmap, each removal only publishes its generation and
//! records which CPUs may cache the mapping; a single broadcast at the end
//! brings all of them up to date.
//!
//! The broadcast carries an untargeted request, so each receiver catches up
//! whatever it has loaded. A receiver that cached one of the batched address
//! spaces but no longer runs it has left that address space's affinity set
//! and will notice the stale slot when it switches back.

use helix_hal::CpuMask;

use crate::engine::FlushRequest;
use crate::ledger::AddressSpace;
use crate::shootdown::Broadcaster;

/// Pending invalidations of one reclaim pass
#[derive(Debug, Clone, Default)]
pub struct UnmapBatch {
    cpumask: CpuMask,
    removals: usize,
}

impl UnmapBatch {
    /// An empty batch
    pub const fn new() -> Self {
        Self {
            cpumask: CpuMask::new(),
            removals: 0,
        }
    }

    /// Record that a mapping of `mm` was removed from its page tables
    ///
    /// Returns the generation the removal was published at.
    pub fn add_mapping_removal(&mut self, mm: &AddressSpace) -> u64 {
        let gen = mm.bump_generation();
        self.cpumask.union_with(&mm.affinity_snapshot());
        self.removals += 1;
        gen
    }

    /// CPUs the next drain will reach
    pub fn pending_cpus(&self) -> &CpuMask {
        &self.cpumask
    }

    /// Removals folded in since the last drain
    pub fn pending_removals(&self) -> usize {
        self.removals
    }

    /// Whether no removal is pending
    pub fn is_empty(&self) -> bool {
        self.removals == 0
    }

    /// Send one catch-up request to every accumulated CPU and reset
    ///
    /// Returns `false` if there was nothing to send.
    pub fn drain_and_flush<'a, B: Broadcaster<'a>>(&mut self, broadcaster: &mut B) -> bool {
        if self.cpumask.is_empty() {
            self.removals = 0;
            return false;
        }

        log::trace!(
            "TLB: draining {} removals to {} cpus",
            self.removals,
            self.cpumask.count()
        );
        broadcaster.broadcast(&self.cpumask, FlushRequest::catch_up());
        tlb_stat!(batch_drains);
        tlb_stat!(broadcasts);

        self.cpumask.clear_all();
        self.removals = 0;
        true
    }
}

// =============================================================================
// Tests
// =============================================================================
