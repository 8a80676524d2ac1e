//! # Helix TLB Coherence
//!
//! Keeps every CPU's translation cache consistent with the page tables
//! without a global lock. Each address space carries a generation clock;
//! each CPU remembers, per cached context, which generation its entries are
//! known to match. A flush request is just "context C is now at generation
//! G", and every CPU decides for itself what the cheapest correct
//! invalidation is.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                          page-table change                          │
//! │                                  │                                  │
//! │                                  ▼                                  │
//! │   ledger ─── bump_generation ──▶ FlushRequest ──┬──▶ local engine   │
//! │   (gen, cpumask)                                │                   │
//! │                                                 └──▶ Broadcaster    │
//! │                                                        │            │
//! │   batch (many unmaps, one broadcast) ──────────────────┘            │
//! │                                                        ▼            │
//! │   ┌──────────────────────── every target CPU ───────────────────┐   │
//! │   │  percpu: loaded mm, lazy flag, CR4 shadow                   │   │
//! │   │  asid:   6-slot FIFO ring of (ctx, generation)              │   │
//! │   │  engine: Skip / FlushRange / FlushAll / SwitchAndFlush      │   │
//! │   └─────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module      | Contents                                              |
//! |-------------|-------------------------------------------------------|
//! | `ledger`    | [`AddressSpace`] identity, generation and affinity    |
//! | `asid`      | [`AsidAllocator`] per-CPU context ring                |
//! | `percpu`    | [`PerCpuTlbState`], bring-up and `switch_to`          |
//! | `engine`    | [`FlushDecisionEngine`] and [`FlushRequest`]          |
//! | `shootdown` | [`TlbShootdown`] entry points and [`Broadcaster`]     |
//! | `batch`     | [`UnmapBatch`] deferred unmap coalescing              |
//! | `lazy`      | [`LazyModeController`] and [`LazyPolicy`]             |
//! | `cr4`       | [`Cr4Shadow`]                                         |
//! | `config`    | [`TlbConfig`]                                         |
//! | `stats`     | flush counters (`tlb_stats` feature)                  |

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

/// Number of contexts each CPU keeps tagged at once
pub const TLB_NR_DYN_ASIDS: usize = 6;

#[macro_use]
mod macros {
    /// Bump a flush counter when `tlb_stats` is enabled
    macro_rules! tlb_stat {
        ($counter:ident) => {
            tlb_stat!($counter, 1)
        };
        ($counter:ident, $n:expr) => {
            #[cfg(feature = "tlb_stats")]
            $crate::stats::STATS.$counter.fetch_add(
                $n as u64,
                core::sync::atomic::Ordering::Relaxed,
            );
        };
    }
}

pub mod asid;
pub mod batch;
pub mod config;
pub mod cr4;
pub mod engine;
pub mod lazy;
pub mod ledger;
pub mod percpu;
pub mod shootdown;

#[cfg(feature = "tlb_stats")]
pub mod stats;

#[cfg(test)]
pub(crate) mod testing;

pub use asid::{AsidAllocator, SlotGrant, TlbContext};
pub use batch::UnmapBatch;
pub use config::{ConfigError, TlbConfig};
pub use cr4::{mmu_cr4_features, Cr4Shadow};
pub use engine::{FlushAction, FlushDecisionEngine, FlushRequest, FLUSH_ALL};
pub use lazy::{LazyModeController, LazyPolicy, LazyTransition, PcidAwarePolicy};
pub use ledger::{AddressSpace, ContextId};
pub use percpu::{
    initialize_percpu_state, initialize_secondary_percpu_state, PerCpuTlbState, SwitchOutcome,
};
pub use shootdown::{flush_tlb_all_local, Broadcaster, KernelFlushRequest, TlbShootdown};

// =============================================================================
// Tests
// =============================================================================
