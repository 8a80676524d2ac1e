//! # Flush Decision Engine
//!
//! Turns a [`FlushRequest`] into the cheapest invalidation that leaves the
//! local CPU's cached entries consistent with the request, then performs it.
//! Every CPU that receives a request runs the same function against its own
//! [`PerCpuTlbState`]; nothing is shared but the address space's generation.
//!
//! ## Decision
//!
//! ```text
//!   request ──▶ target? ── none, init loaded ─────────────────▶ Skip
//!                 │
//!                 ▼
//!            in the ring? ── no ──────────────────────────────▶ FlushAll { asid: None }
//!                 │
//!                 ▼
//!            cached >= wanted? ── yes ────────────────────────▶ Skip
//!                 │
//!                 ▼
//!            one-step, loaded, tagged, INVLPG, <= ceiling? ── yes ─▶ FlushRange
//!                 │
//!                 ▼
//!            loaded, not lazy, untagged? ── yes ──────────────▶ SwitchAndFlush
//!                 │
//!                 └───────────────────────────────────────────▶ FlushAll { asid }
//! ```
//!
//! A range flush only covers one generation step: if the slot is further
//! behind, the earlier steps' ranges are unknown here, so the whole context
//! is dropped instead. A full flush catches the slot up to whatever the
//! generation was just before the flush.

use helix_hal::{TlbHardware, VirtualAddress, PAGE_SIZE};

use crate::config::{ConfigError, TlbConfig};
use crate::ledger::AddressSpace;
use crate::percpu::PerCpuTlbState;

/// `end` value meaning "the whole address space"
pub const FLUSH_ALL: u64 = u64::MAX;

// =============================================================================
// Flush Request
// =============================================================================

/// "The translations of `mm` in `[start, end)` changed; it is now at
/// `new_generation`"
#[derive(Debug, Clone, Copy)]
pub struct FlushRequest<'a> {
    /// Target address space; `None` asks the receiver to bring whatever it
    /// has loaded up to date
    pub mm: Option<&'a AddressSpace>,
    /// First byte of the range
    pub start: u64,
    /// End of the range (exclusive), or [`FLUSH_ALL`]
    pub end: u64,
    /// Generation published for this change (ignored when `mm` is `None`)
    pub new_generation: u64,
}

impl<'a> FlushRequest<'a> {
    /// Range request for `mm`
    pub fn range(mm: &'a AddressSpace, start: u64, end: u64, new_generation: u64) -> Self {
        debug_assert!(start <= end);
        Self {
            mm: Some(mm),
            start,
            end,
            new_generation,
        }
    }

    /// Whole-address-space request for `mm`
    pub fn full(mm: &'a AddressSpace, new_generation: u64) -> Self {
        Self::range(mm, 0, FLUSH_ALL, new_generation)
    }

    /// Untargeted catch-up request
    pub const fn catch_up() -> Self {
        Self {
            mm: None,
            start: 0,
            end: FLUSH_ALL,
            new_generation: 0,
        }
    }

    /// Whether the request covers the whole address space
    #[inline]
    pub fn is_full(&self) -> bool {
        self.end == FLUSH_ALL
    }

    /// Pages touched by `[start, end)`
    pub fn page_count(&self) -> u64 {
        pages_spanned(self.start, self.end)
    }
}

/// Pages touched by `[start, end)`; `u64::MAX` for [`FLUSH_ALL`]
pub(crate) fn pages_spanned(start: u64, end: u64) -> u64 {
    if end == FLUSH_ALL {
        return u64::MAX;
    }
    let first = start & !(PAGE_SIZE - 1);
    (end - first).div_ceil(PAGE_SIZE)
}

// =============================================================================
// Flush Action
// =============================================================================

/// What one CPU does about one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushAction {
    /// Cached entries are already current
    Skip,
    /// Invalidate each page of `[start, end)` in the active context
    FlushRange {
        /// Slot of the (loaded) target
        asid: u16,
        /// First page
        start: VirtualAddress,
        /// End of the range (exclusive)
        end: VirtualAddress,
    },
    /// Drop every entry of the target context
    ///
    /// `None` when the target has no slot on this CPU: there is nothing
    /// cached to drop.
    FlushAll {
        /// Slot of the target
        asid: Option<u16>,
    },
    /// Reload the active root without preserving cached entries
    SwitchAndFlush {
        /// Slot of the loaded target
        asid: u16,
    },
}

/// Action plus the generation the slot is known to be at once it is done
#[derive(Debug, Clone, Copy)]
struct FlushPlan {
    action: FlushAction,
    reaches: u64,
}

impl FlushPlan {
    const SKIP: FlushPlan = FlushPlan {
        action: FlushAction::Skip,
        reaches: 0,
    };
}

// =============================================================================
// Engine
// =============================================================================

/// Per-CPU flush decision, parameterized by [`TlbConfig`]
#[derive(Debug, Clone, Copy)]
pub struct FlushDecisionEngine {
    config: TlbConfig,
}

impl FlushDecisionEngine {
    /// Build an engine from a validated configuration
    pub fn new(config: TlbConfig) -> Result<Self, ConfigError> {
        if let Err(err) = config.validate() {
            log::warn!("TLB: rejected configuration {:?}: {}", config, err);
            return Err(err);
        }
        Ok(Self { config })
    }

    /// The configuration in use
    pub fn config(&self) -> &TlbConfig {
        &self.config
    }

    /// Decide what `state`'s CPU must do about `request`
    ///
    /// Pure: neither the state nor the hardware is touched.
    pub fn decide(&self, state: &PerCpuTlbState<'_>, request: &FlushRequest<'_>) -> FlushAction {
        self.plan(state, request).action
    }

    /// Decide, then perform the action and record the new generation
    pub fn flush<H: TlbHardware>(
        &self,
        state: &mut PerCpuTlbState<'_>,
        request: &FlushRequest<'_>,
        hw: &mut H,
    ) -> FlushAction {
        let plan = self.plan(state, request);
        self.apply(state, &plan, hw);
        plan.action
    }

    fn plan(&self, state: &PerCpuTlbState<'_>, request: &FlushRequest<'_>) -> FlushPlan {
        debug_assert!(request.start <= request.end);

        let loaded = state.loaded_mm();
        let (mm, explicit) = match request.mm {
            Some(mm) => (mm, true),
            None if loaded.is_init() => return FlushPlan::SKIP,
            None => (loaded, false),
        };

        let Some(asid) = state.asids().find(mm.identity()) else {
            log::trace!("TLB: {} {:?} not cached, nothing to drop", state.cpu(), mm.identity());
            return FlushPlan {
                action: FlushAction::FlushAll { asid: None },
                reaches: 0,
            };
        };

        let cached = state.asids().slot(asid).tlb_gen;
        let true_gen = mm.current_generation();
        debug_assert!(cached <= true_gen, "slot ahead of its address space");
        debug_assert!(!explicit || request.new_generation <= true_gen);

        let wanted = if explicit { request.new_generation } else { true_gen };
        if cached >= wanted {
            log::trace!(
                "TLB: {} skip {:?}, cached {} >= {}",
                state.cpu(),
                mm.identity(),
                cached,
                wanted
            );
            return FlushPlan::SKIP;
        }

        let is_active = state.is_loaded(mm) && state.loaded_asid() == asid;
        let features = state.features();
        let partial = explicit
            && !request.is_full()
            && request.new_generation == cached + 1
            && request.new_generation == true_gen
            && features.tagged()
            && features.page_granular()
            && is_active
            && request.page_count() <= self.config.single_page_flush_ceiling as u64;

        let plan = if partial {
            FlushPlan {
                action: FlushAction::FlushRange {
                    asid,
                    start: VirtualAddress::new(request.start).page_base(),
                    end: VirtualAddress::new(request.end),
                },
                reaches: request.new_generation,
            }
        } else if is_active && !state.is_lazy() && !features.tagged() {
            FlushPlan {
                action: FlushAction::SwitchAndFlush { asid },
                reaches: true_gen,
            }
        } else {
            FlushPlan {
                action: FlushAction::FlushAll { asid: Some(asid) },
                reaches: true_gen,
            }
        };

        log::trace!(
            "TLB: {} {:?} gen {} -> {}: {:?}",
            state.cpu(),
            mm.identity(),
            cached,
            plan.reaches,
            plan.action
        );
        plan
    }

    fn apply<H: TlbHardware>(&self, state: &mut PerCpuTlbState<'_>, plan: &FlushPlan, hw: &mut H) {
        match plan.action {
            FlushAction::Skip => {
                tlb_stat!(skipped);
                return;
            },
            FlushAction::FlushAll { asid: None } => {
                tlb_stat!(skipped);
                return;
            },
            FlushAction::FlushRange { start, end, .. } => {
                let mut page = start;
                while page < end {
                    hw.invalidate_page(page);
                    page = page.next_page();
                }
                tlb_stat!(range_flushes);
                tlb_stat!(pages_flushed, (end.as_u64() - start.as_u64()).div_ceil(PAGE_SIZE));
            },
            FlushAction::FlushAll { asid: Some(asid) } => {
                if state.tagged() {
                    hw.invalidate_context(state.hw_pcid(asid));
                } else {
                    hw.invalidate_everything();
                }
                tlb_stat!(full_flushes);
            },
            FlushAction::SwitchAndFlush { asid } => {
                let mm = state.loaded_mm();
                hw.write_active_context(mm.root(), state.hw_pcid(asid), false);
                tlb_stat!(switch_flushes);
            },
        }

        let asid = match plan.action {
            FlushAction::FlushRange { asid, .. }
            | FlushAction::FlushAll { asid: Some(asid) }
            | FlushAction::SwitchAndFlush { asid } => asid,
            _ => return,
        };
        state.asids_mut().set_generation(asid, plan.reaches);
    }
}

impl Default for FlushDecisionEngine {
    fn default() -> Self {
        Self {
            config: TlbConfig::DEFAULT,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{root, spaces, HwOp, SimHardware, TAGGED, UNTAGGED};
    use crate::{initialize_percpu_state, TLB_NR_DYN_ASIDS};
    use helix_hal::arch::x86_64::paging_v2::tlb::kern_pcid;
    use helix_hal::{CpuId, TlbFeatures};

    fn engine() -> FlushDecisionEngine {
        FlushDecisionEngine::default()
    }

    #[test]
    fn test_page_count() {
        let mm = AddressSpace::new(root(1));
        assert_eq!(FlushRequest::range(&mm, 0x1000, 0x2000, 1).page_count(), 1);
        assert_eq!(FlushRequest::range(&mm, 0x1800, 0x2001, 1).page_count(), 2);
        assert_eq!(FlushRequest::range(&mm, 0x1000, 0x1000, 1).page_count(), 0);
        assert!(FlushRequest::full(&mm, 1).is_full());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = TlbConfig::DEFAULT.with_single_page_flush_ceiling(0);
        assert_eq!(FlushDecisionEngine::new(config).unwrap_err(), ConfigError::ZeroFlushCeiling);
        assert!(FlushDecisionEngine::new(TlbConfig::DEFAULT).is_ok());
    }

    #[test]
    fn test_range_flush_is_exact() {
        let init = AddressSpace::init(root(0));
        let x = AddressSpace::new(root(1));
        let mut hw = SimHardware::new();
        let mut state = initialize_percpu_state(CpuId::BSP, TAGGED, &init, &mut hw);

        x.bump_generation();
        let _ = state.switch_to(&x, &mut hw);
        hw.fill(0x1000, 0x111);
        hw.fill(0x5000, 0x555);
        hw.take_ops();

        let gen = x.bump_generation();
        let request = FlushRequest::range(&x, 0x1000, 0x2000, gen);
        let action = engine().flush(&mut state, &request, &mut hw);

        assert_eq!(
            action,
            FlushAction::FlushRange {
                asid: 0,
                start: VirtualAddress::new(0x1000),
                end: VirtualAddress::new(0x2000),
            }
        );
        assert_eq!(hw.ops(), &[HwOp::InvalidatePage(VirtualAddress::new(0x1000))]);
        assert_eq!(hw.lookup(0x1000), None);
        assert_eq!(hw.lookup(0x5000), Some(0x555));
        assert_eq!(state.asids().slot(0).tlb_gen, 2);
    }

    #[test]
    fn test_repeat_request_skips() {
        let init = AddressSpace::init(root(0));
        let x = AddressSpace::new(root(1));
        let mut hw = SimHardware::new();
        let mut state = initialize_percpu_state(CpuId::BSP, TAGGED, &init, &mut hw);
        let _ = state.switch_to(&x, &mut hw);

        let request = FlushRequest::range(&x, 0x1000, 0x3000, x.bump_generation());
        assert!(matches!(
            engine().flush(&mut state, &request, &mut hw),
            FlushAction::FlushRange { .. }
        ));
        hw.take_ops();
        assert_eq!(engine().flush(&mut state, &request, &mut hw), FlushAction::Skip);
        assert!(hw.ops().is_empty());
    }

    #[test]
    fn test_ceiling_escalates() {
        let init = AddressSpace::init(root(0));
        let x = AddressSpace::new(root(1));
        let mut hw = SimHardware::new();
        let mut state = initialize_percpu_state(CpuId::BSP, TAGGED, &init, &mut hw);
        let _ = state.switch_to(&x, &mut hw);
        let engine = FlushDecisionEngine::new(TlbConfig::DEFAULT.with_single_page_flush_ceiling(2))
            .unwrap();

        let gen = x.bump_generation();
        let fits = FlushRequest::range(&x, 0, 2 * PAGE_SIZE, gen);
        let exceeds = FlushRequest::range(&x, 0, 3 * PAGE_SIZE, gen);
        assert!(matches!(engine.decide(&state, &fits), FlushAction::FlushRange { .. }));
        assert_eq!(engine.decide(&state, &exceeds), FlushAction::FlushAll { asid: Some(0) });
    }

    #[test]
    fn test_generation_gap_escalates() {
        let init = AddressSpace::init(root(0));
        let x = AddressSpace::new(root(1));
        let mut hw = SimHardware::new();
        let mut state = initialize_percpu_state(CpuId::BSP, TAGGED, &init, &mut hw);
        let _ = state.switch_to(&x, &mut hw);

        let first = x.bump_generation();
        let second = x.bump_generation();

        // The older request no longer matches the true generation.
        let stale = FlushRequest::range(&x, 0x1000, 0x2000, first);
        assert_eq!(engine().decide(&state, &stale), FlushAction::FlushAll { asid: Some(0) });

        // The newer one is two steps ahead of the slot.
        let newer = FlushRequest::range(&x, 0x8000, 0x9000, second);
        assert_eq!(
            engine().flush(&mut state, &newer, &mut hw),
            FlushAction::FlushAll { asid: Some(0) }
        );
        assert_eq!(state.asids().slot(0).tlb_gen, 2);
        assert_eq!(engine().decide(&state, &stale), FlushAction::Skip);
    }

    #[test]
    fn test_full_flush_catches_up_to_true_generation() {
        let init = AddressSpace::init(root(0));
        let x = AddressSpace::new(root(1));
        let mut hw = SimHardware::new();
        let mut state = initialize_percpu_state(CpuId::BSP, TAGGED, &init, &mut hw);
        let _ = state.switch_to(&x, &mut hw);

        let first = FlushRequest::full(&x, x.bump_generation());
        let _ = x.bump_generation();
        let _ = x.bump_generation();
        assert_eq!(
            engine().flush(&mut state, &first, &mut hw),
            FlushAction::FlushAll { asid: Some(0) }
        );
        assert_eq!(state.asids().slot(0).tlb_gen, 3);
        assert_eq!(hw.ops().last(), Some(&HwOp::InvalidateContext(kern_pcid(0))));
    }

    #[test]
    fn test_without_invlpg_always_full() {
        let init = AddressSpace::init(root(0));
        let x = AddressSpace::new(root(1));
        let mut hw = SimHardware::new();
        let features = TAGGED - TlbFeatures::INVLPG;
        let mut state = initialize_percpu_state(CpuId::BSP, features, &init, &mut hw);
        let _ = state.switch_to(&x, &mut hw);

        let request = FlushRequest::range(&x, 0x1000, 0x2000, x.bump_generation());
        assert_eq!(engine().decide(&state, &request), FlushAction::FlushAll { asid: Some(0) });
    }

    #[test]
    fn test_cached_but_inactive_context_flushed_by_tag() {
        let init = AddressSpace::init(root(0));
        let mms = spaces(2);
        let mut hw = SimHardware::new();
        let mut state = initialize_percpu_state(CpuId::BSP, TAGGED, &init, &mut hw);
        let _ = state.switch_to(&mms[0], &mut hw);
        hw.fill(0x1000, 0x111);
        let _ = state.switch_to(&mms[1], &mut hw);

        let request = FlushRequest::range(&mms[0], 0x1000, 0x2000, mms[0].bump_generation());
        assert_eq!(
            engine().flush(&mut state, &request, &mut hw),
            FlushAction::FlushAll { asid: Some(0) }
        );
        assert_eq!(hw.cached_under(kern_pcid(0)), 0);
        assert_eq!(state.asids().slot(0).tlb_gen, 1);
    }

    #[test]
    fn test_untagged_loaded_switches_and_flushes() {
        let init = AddressSpace::init(root(0));
        let x = AddressSpace::new(root(1));
        let mut hw = SimHardware::new();
        let mut state = initialize_percpu_state(CpuId::BSP, UNTAGGED, &init, &mut hw);
        let _ = state.switch_to(&x, &mut hw);
        hw.take_ops();

        let request = FlushRequest::range(&x, 0x1000, 0x2000, x.bump_generation());
        assert_eq!(
            engine().flush(&mut state, &request, &mut hw),
            FlushAction::SwitchAndFlush { asid: 0 }
        );
        assert_eq!(
            hw.ops(),
            &[HwOp::WriteActiveContext {
                root: x.root(),
                pcid: helix_hal::Pcid::RESERVED,
                no_flush: false,
            }]
        );
    }

    #[test]
    fn test_evicted_target_needs_no_physical_flush() {
        let init = AddressSpace::init(root(0));
        let mms = spaces(TLB_NR_DYN_ASIDS + 1);
        let mut hw = SimHardware::new();
        let mut state = initialize_percpu_state(CpuId::BSP, TAGGED, &init, &mut hw);
        for mm in &mms {
            let _ = state.switch_to(mm, &mut hw);
        }
        hw.take_ops();

        let request = FlushRequest::full(&mms[0], mms[0].bump_generation());
        assert_eq!(
            engine().flush(&mut state, &request, &mut hw),
            FlushAction::FlushAll { asid: None }
        );
        assert!(hw.ops().is_empty());
    }

    #[test]
    fn test_catch_up_request() {
        let init = AddressSpace::init(root(0));
        let x = AddressSpace::new(root(1));
        let mut hw = SimHardware::new();
        let mut state = initialize_percpu_state(CpuId::BSP, TAGGED, &init, &mut hw);

        // Nothing but init loaded.
        assert_eq!(engine().decide(&state, &FlushRequest::catch_up()), FlushAction::Skip);

        let _ = state.switch_to(&x, &mut hw);
        assert_eq!(engine().decide(&state, &FlushRequest::catch_up()), FlushAction::Skip);

        let _ = x.bump_generation();
        assert_eq!(
            engine().flush(&mut state, &FlushRequest::catch_up(), &mut hw),
            FlushAction::FlushAll { asid: Some(0) }
        );
        assert_eq!(state.asids().slot(0).tlb_gen, 1);
    }
}
