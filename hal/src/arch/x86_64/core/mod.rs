//! # x86_64 Core Module
//!
//! Control registers and the CPU capabilities the TLB code depends on.
//!
//! ## Modules
//!
//! - [`control_regs`]: CR4 flags
//! - [`features`]: TLB-relevant CPUID feature detection and the boot record

pub mod control_regs;
pub mod features;
