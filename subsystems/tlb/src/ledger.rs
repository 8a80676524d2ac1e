//! # Address Space Generation Ledger
//!
//! Every address space carries a generation counter and the set of CPUs
//! that may cache its translations. Together they replace a lock:
//!
//! ```text
//!   flushing CPU                         switching CPU
//!   ────────────                         ─────────────
//!   write page tables                    affinity_insert(me)   (SeqCst RMW)
//!   bump_generation()   (SeqCst RMW)     current_generation()  (SeqCst)
//!   affinity_snapshot() (SeqCst)         compare with ring slot
//!   broadcast to snapshot
//! ```
//!
//! Either the flusher sees the switching CPU's bit and sends it the
//! request, or the switching CPU sees the bumped generation and flushes on
//! its own. Both orderings are sequentially consistent so the two sides
//! cannot each miss the other's store.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use helix_hal::{AtomicCpuMask, CpuId, CpuMask, PhysicalAddress};

// =============================================================================
// Context Identity
// =============================================================================

/// Unique, never-reused identity of an address space
///
/// `0` marks an empty ring slot and never names an address space.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ContextId(u64);

impl ContextId {
    /// Marker stored in unused ring slots
    pub const EMPTY: ContextId = ContextId(0);

    /// The kernel's init address space
    pub const INIT: ContextId = ContextId(1);

    /// Allocate a fresh identity
    pub fn allocate() -> Self {
        ContextId(LAST_CONTEXT_ID.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Get the raw value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check if this is the empty-slot marker
    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// Last identity handed out (dynamic identities start at 2)
static LAST_CONTEXT_ID: AtomicU64 = AtomicU64::new(ContextId::INIT.0);

// =============================================================================
// Address Space
// =============================================================================

/// The TLB-relevant view of an address space
///
/// The page tables themselves live elsewhere; this type only holds the
/// translation root, the identity, the generation clock and the affinity
/// set.
pub struct AddressSpace {
    ctx_id: ContextId,
    root: PhysicalAddress,
    tlb_gen: AtomicU64,
    cpumask: AtomicCpuMask,
}

impl AddressSpace {
    /// Create an address space with a fresh identity at generation 0
    pub fn new(root: PhysicalAddress) -> Self {
        Self {
            ctx_id: ContextId::allocate(),
            root,
            tlb_gen: AtomicU64::new(0),
            cpumask: AtomicCpuMask::new(),
        }
    }

    /// Create the kernel's init address space
    ///
    /// No CPU ever joins its affinity set: flushes of kernel mappings go
    /// through the global flush, never through generation tracking.
    pub const fn init(root: PhysicalAddress) -> Self {
        Self {
            ctx_id: ContextId::INIT,
            root,
            tlb_gen: AtomicU64::new(0),
            cpumask: AtomicCpuMask::new(),
        }
    }

    /// Identity of this address space
    #[inline]
    pub fn identity(&self) -> ContextId {
        self.ctx_id
    }

    /// Physical address of the top-level page table
    #[inline]
    pub fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// Whether this is the init address space
    #[inline]
    pub fn is_init(&self) -> bool {
        self.ctx_id == ContextId::INIT
    }

    /// Advance the generation, returning the new value
    ///
    /// Must be called after the page-table change it represents and before
    /// the affinity set is read to pick flush targets.
    #[inline]
    pub fn bump_generation(&self) -> u64 {
        self.tlb_gen.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Current generation
    #[inline]
    pub fn current_generation(&self) -> u64 {
        self.tlb_gen.load(Ordering::Acquire)
    }

    /// Current generation, ordered after a preceding affinity update
    #[inline]
    pub(crate) fn generation_after_join(&self) -> u64 {
        self.tlb_gen.load(Ordering::SeqCst)
    }

    /// Add `cpu` to the affinity set
    ///
    /// Only `cpu` itself may call this.
    #[inline]
    pub fn affinity_insert(&self, cpu: CpuId) {
        debug_assert!(!self.is_init(), "init address space has no affinity set");
        self.cpumask.insert(cpu, Ordering::SeqCst);
    }

    /// Remove `cpu` from the affinity set
    ///
    /// Only `cpu` itself may call this.
    #[inline]
    pub fn affinity_remove(&self, cpu: CpuId) {
        self.cpumask.remove(cpu, Ordering::SeqCst);
    }

    /// Whether `cpu` is in the affinity set
    #[inline]
    pub fn affinity_contains(&self, cpu: CpuId) -> bool {
        self.cpumask.contains(cpu, Ordering::Acquire)
    }

    /// Copy of the affinity set, ordered after a preceding generation bump
    #[inline]
    pub fn affinity_snapshot(&self) -> CpuMask {
        self.cpumask.snapshot(Ordering::SeqCst)
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("ctx_id", &self.ctx_id)
            .field("root", &self.root)
            .field("tlb_gen", &self.current_generation())
            .field("cpumask", &self.cpumask)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
