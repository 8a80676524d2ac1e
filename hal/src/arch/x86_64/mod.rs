//! # x86_64 Architecture HAL Implementation
//!
//! ## Module Organization
//!
//! - [`core`]: Control registers and CPU feature detection
//!   - [`core::control_regs`]: CR4 flag definitions
//!   - [`core::features`]: PCID / INVPCID / PGE detection
//! - [`paging_v2`]: Address types and TLB encodings
//!   - [`paging_v2::addresses`]: Physical/Virtual address types
//!   - [`paging_v2::tlb`]: PCID, ASID numeric domain, CR3 composition
//! - `native`: [`crate::mmu`] traits backed by real instructions
//!   (bare metal only)

pub mod core;
pub mod paging_v2;

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86_64", target_os = "none"))] {
        pub mod native;
        pub use native::NativeMmu;
    }
}
