//! # Helix Hardware Abstraction Layer
//!
//! The hardware-facing half of the Helix TLB coherence subsystem. Everything
//! here is either a pure encoding (PCID, CR3, CR4 bits, CPU masks) or a thin
//! trait over a privileged instruction, so that the flush protocol in
//! `helix-tlb` never touches hardware directly.
//!
//! ## Layout
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                          helix-hal                            │
//! ├───────────────────────────────────────────────────────────────┤
//! │  mmu        TlbHardware / ControlRegisters traits             │
//! │  cpumask    CpuId, CpuMask, AtomicCpuMask                     │
//! │  arch                                                         │
//! │   └─ x86_64                                                   │
//! │       ├─ core::control_regs   CR4 flags                       │
//! │       ├─ core::features       PCID/INVPCID/PGE detection      │
//! │       ├─ paging_v2::addresses Physical/Virtual addresses      │
//! │       ├─ paging_v2::tlb       PCID, ASID domain, CR3 values   │
//! │       └─ native               NativeMmu (bare metal only)     │
//! └───────────────────────────────────────────────────────────────┘
//! ```

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod arch;
pub mod cpumask;
pub mod mmu;

pub use arch::x86_64::core::control_regs::Cr4;
pub use arch::x86_64::core::features::TlbFeatures;
pub use arch::x86_64::paging_v2::addresses::{PhysicalAddress, VirtualAddress};
pub use arch::x86_64::paging_v2::tlb::{GlobalFlush, Pcid};
pub use arch::x86_64::paging_v2::PAGE_SIZE;
pub use cpumask::{AtomicCpuMask, CpuId, CpuMask, MAX_CPUS};
pub use mmu::{ControlRegisters, IrqFlags, TlbHardware};
