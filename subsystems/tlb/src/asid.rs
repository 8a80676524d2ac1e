//! # Per-CPU ASID Ring
//!
//! Each CPU keeps a tiny FIFO ring of the address spaces it recently ran.
//! The ring index *is* the ASID, and the hardware PCID is `asid + 1`.
//!
//! ```text
//!            next_asid
//!                │
//!                ▼
//!   ┌──────┬──────┬──────┬──────┬──────┬──────┐
//!   │ A:7  │ B:3  │ C:0  │ D:12 │ E:1  │ F:4  │   (ctx : cached generation)
//!   └──────┴──────┴──────┴──────┴──────┴──────┘
//!     0      1      2      3      4      5
//! ```
//!
//! A context already in the ring keeps its slot. Anything else overwrites
//! the slot under the cursor; the previous occupant is simply gone from this
//! CPU, and any later question about it finds no slot. Nothing is ever torn
//! down explicitly.
//!
//! On hardware without tagged contexts only slot 0 is used and every load
//! flushes.

use helix_hal::arch::x86_64::paging_v2::tlb::MAX_ASID_AVAILABLE;

use crate::ledger::{AddressSpace, ContextId};
use crate::TLB_NR_DYN_ASIDS;

// =============================================================================
// Ring Slot
// =============================================================================

/// One ring slot: which context the entries under this ASID came from, and
/// the generation they are known to be at least as new as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct TlbContext {
    /// Owning context, or [`ContextId::EMPTY`]
    pub ctx_id: ContextId,
    /// Generation the cached entries are consistent with
    pub tlb_gen: u64,
}

impl TlbContext {
    /// An unused slot
    pub const EMPTY: TlbContext = TlbContext {
        ctx_id: ContextId::EMPTY,
        tlb_gen: 0,
    };
}

static_assertions::assert_eq_size!(TlbContext, [u64; 2]);
static_assertions::const_assert!(TLB_NR_DYN_ASIDS >= 1);
static_assertions::const_assert!(TLB_NR_DYN_ASIDS <= MAX_ASID_AVAILABLE as usize + 1);

// =============================================================================
// Slot Grant
// =============================================================================

/// Result of [`AsidAllocator::acquire_slot`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotGrant {
    /// Slot index (ASID)
    pub asid: u16,
    /// Whether the hardware entries under this ASID must be flushed on load
    pub need_flush: bool,
    /// Context that was evicted to make room, if any
    pub evicted: Option<ContextId>,
}

// =============================================================================
// ASID Allocator
// =============================================================================

/// The ring of cached contexts of one CPU
#[derive(Debug, Clone)]
pub struct AsidAllocator {
    ctxs: [TlbContext; TLB_NR_DYN_ASIDS],
    next_asid: u16,
}

impl AsidAllocator {
    /// An empty ring with the cursor at slot 0
    pub const fn new() -> Self {
        Self {
            ctxs: [TlbContext::EMPTY; TLB_NR_DYN_ASIDS],
            next_asid: 0,
        }
    }

    /// Pick the slot `next` is loaded under
    ///
    /// `next_gen` is `next`'s generation as read by the switching CPU after
    /// joining its affinity set. A newly taken slot records `next`'s
    /// identity and `next_gen`, and always needs a flush.
    pub fn acquire_slot(&mut self, next: &AddressSpace, next_gen: u64, tagged: bool) -> SlotGrant {
        if !tagged {
            let evicted = self.overwrite(0, next.identity(), next_gen);
            return SlotGrant {
                asid: 0,
                need_flush: true,
                evicted,
            };
        }

        if let Some(asid) = self.find(next.identity()) {
            let need_flush = self.ctxs[asid as usize].tlb_gen < next_gen;
            return SlotGrant {
                asid,
                need_flush,
                evicted: None,
            };
        }

        let asid = self.next_asid;
        self.next_asid = (self.next_asid + 1) % TLB_NR_DYN_ASIDS as u16;
        let evicted = self.overwrite(asid, next.identity(), next_gen);
        if let Some(old) = evicted {
            log::debug!("TLB: asid {} recycled, {:?} -> {:?}", asid, old, next.identity());
        }
        SlotGrant {
            asid,
            need_flush: true,
            evicted,
        }
    }

    /// Slot currently holding `ctx_id`
    #[inline]
    pub fn find(&self, ctx_id: ContextId) -> Option<u16> {
        if ctx_id.is_empty() {
            return None;
        }
        self.ctxs
            .iter()
            .position(|slot| slot.ctx_id == ctx_id)
            .map(|asid| asid as u16)
    }

    /// Read a slot
    #[inline]
    pub fn slot(&self, asid: u16) -> &TlbContext {
        &self.ctxs[asid as usize]
    }

    /// Record that the entries under `asid` are now consistent with `tlb_gen`
    #[inline]
    pub fn set_generation(&mut self, asid: u16, tlb_gen: u64) {
        let slot = &mut self.ctxs[asid as usize];
        debug_assert!(!slot.ctx_id.is_empty());
        slot.tlb_gen = tlb_gen;
    }

    /// Slot the next allocation will overwrite
    #[inline]
    pub fn cursor(&self) -> u16 {
        self.next_asid
    }

    /// All slots, in index order
    #[inline]
    pub fn slots(&self) -> &[TlbContext; TLB_NR_DYN_ASIDS] {
        &self.ctxs
    }

    fn overwrite(&mut self, asid: u16, ctx_id: ContextId, tlb_gen: u64) -> Option<ContextId> {
        let slot = &mut self.ctxs[asid as usize];
        let old = slot.ctx_id;
        *slot = TlbContext { ctx_id, tlb_gen };
        (!old.is_empty() && old != ctx_id).then_some(old)
    }
}

impl Default for AsidAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
