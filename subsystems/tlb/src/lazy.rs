//! # Lazy Mode
//!
//! When a CPU goes idle it may keep the last user address space loaded
//! instead of switching to the init address space. The CPU stays in that
//! address space's affinity set, so it keeps receiving flush requests for
//! it; if it never runs that address space again, the switch away happens
//! on the next real context switch.
//!
//! Whether to defer is a pure performance trade-off. With tagged contexts a
//! switch to init is cheap and spares this CPU from remote flushes, so the
//! default policy only defers on untagged hardware, where the switch back
//! would cost a full flush.

use helix_hal::{ControlRegisters, TlbFeatures, TlbHardware};

use crate::percpu::{PerCpuTlbState, SwitchOutcome};

/// Whether an idling CPU keeps its address space loaded
pub trait LazyPolicy {
    /// `true` to stay lazily in the current address space
    fn should_defer_switch_to_idle(&self, features: TlbFeatures) -> bool;
}

impl<F> LazyPolicy for F
where
    F: Fn(TlbFeatures) -> bool,
{
    fn should_defer_switch_to_idle(&self, features: TlbFeatures) -> bool {
        self(features)
    }
}

/// Defer only when the hardware cannot keep contexts tagged
#[derive(Debug, Clone, Copy, Default)]
pub struct PcidAwarePolicy;

impl LazyPolicy for PcidAwarePolicy {
    fn should_defer_switch_to_idle(&self, features: TlbFeatures) -> bool {
        !features.tagged()
    }
}

/// What [`LazyModeController::enter_lazy`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LazyTransition {
    /// The init address space was already loaded
    AlreadyIdle,
    /// The address space stays loaded, marked lazy
    Deferred,
    /// Switched to the init address space
    Switched(SwitchOutcome),
}

/// Idle-entry handling of one CPU
#[derive(Debug, Clone, Copy, Default)]
pub struct LazyModeController<P = PcidAwarePolicy> {
    policy: P,
}

impl<P: LazyPolicy> LazyModeController<P> {
    /// Controller using `policy`
    pub const fn new(policy: P) -> Self {
        Self { policy }
    }

    /// Ask the policy about `state`'s CPU
    pub fn should_defer_switch_to_idle(&self, state: &PerCpuTlbState<'_>) -> bool {
        self.policy.should_defer_switch_to_idle(state.features())
    }

    /// Called when the CPU is about to idle, with interrupts disabled
    pub fn enter_lazy<'a, H>(&self, state: &mut PerCpuTlbState<'a>, hw: &mut H) -> LazyTransition
    where
        H: TlbHardware + ControlRegisters,
    {
        debug_assert!(hw.irqs_disabled(), "idle entry with interrupts enabled");
        if state.loaded_mm().is_init() {
            return LazyTransition::AlreadyIdle;
        }
        if self.should_defer_switch_to_idle(state) {
            state.set_lazy();
            log::debug!(
                "TLB: {} lazy in {:?}",
                state.cpu(),
                state.loaded_mm().identity()
            );
            return LazyTransition::Deferred;
        }
        let init = state.init_mm();
        LazyTransition::Switched(state.switch_to(init, hw))
    }
}

// =============================================================================
// Tests
// =============================================================================
