//! Simulated machine for host tests
//!
//! [`SimHardware`] records every primitive it is asked to perform and keeps
//! a small model of a tagged TLB: translations are cached per `(pcid, page)`
//! and keep being served, stale or not, until something invalidates them.
//! Global entries live beside the tagged ones and survive CR3 writes.
//!
//! A simulated CPU starts with interrupts disabled, the state of the context
//! switch and flush IPI paths.

use std::collections::HashMap;

use helix_hal::{
    ControlRegisters, CpuId, CpuMask, Cr4, IrqFlags, Pcid, PhysicalAddress, TlbFeatures,
    TlbHardware, VirtualAddress,
};

use crate::ledger::AddressSpace;
use crate::shootdown::{Broadcaster, KernelFlushRequest};
use crate::FlushRequest;

/// PCID, INVPCID, PGE and INVLPG
pub const TAGGED: TlbFeatures = TlbFeatures::all();

/// INVLPG only
pub const UNTAGGED: TlbFeatures = TlbFeatures::INVLPG;

/// Physical root for the `n`th test address space
pub fn root(n: u64) -> PhysicalAddress {
    PhysicalAddress::new(0x0010_0000 + n * 0x1000)
}

/// `n` fresh address spaces
pub fn spaces(n: usize) -> Vec<AddressSpace> {
    (0..n as u64).map(|i| AddressSpace::new(root(i + 1))).collect()
}

/// A recorded hardware primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwOp {
    WriteActiveContext {
        root: PhysicalAddress,
        pcid: Pcid,
        no_flush: bool,
    },
    InvalidatePage(VirtualAddress),
    InvalidateContext(Pcid),
    InvalidateEverything,
    WriteCr4(Cr4),
}

/// One simulated CPU
#[derive(Debug)]
pub struct SimHardware {
    cr4: Cr4,
    irqs_enabled: bool,
    active_root: PhysicalAddress,
    active_pcid: Pcid,
    ops: Vec<HwOp>,
    tlb: HashMap<(Pcid, u64), u64>,
    global: HashMap<u64, u64>,
}

impl SimHardware {
    /// A CPU fresh out of firmware
    pub fn new() -> Self {
        Self::with_cr4(Cr4::PAE)
    }

    /// A CPU whose CR4 holds `cr4`
    pub fn with_cr4(cr4: Cr4) -> Self {
        Self {
            cr4,
            irqs_enabled: false,
            active_root: PhysicalAddress::new(0),
            active_pcid: Pcid::RESERVED,
            ops: Vec::new(),
            tlb: HashMap::new(),
            global: HashMap::new(),
        }
    }

    /// Unmask interrupts, as a caller outside the switch path would run
    pub fn local_irq_enable(&mut self) {
        self.irqs_enabled = true;
    }

    pub fn cr4(&self) -> Cr4 {
        self.cr4
    }

    /// Change CR4 behind the shadow's back
    pub fn poke_cr4(&mut self, cr4: Cr4) {
        self.cr4 = cr4;
    }

    pub fn cr4_writes(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, HwOp::WriteCr4(_)))
            .count()
    }

    pub fn ops(&self) -> &[HwOp] {
        &self.ops
    }

    /// Drain the recorded primitives
    pub fn take_ops(&mut self) -> Vec<HwOp> {
        std::mem::take(&mut self.ops)
    }

    pub fn active_root(&self) -> PhysicalAddress {
        self.active_root
    }

    pub fn active_pcid(&self) -> Pcid {
        self.active_pcid
    }

    /// Page walk result cached for the active context
    pub fn fill(&mut self, page: u64, frame: u64) {
        self.tlb.insert((self.active_pcid, page & !0xFFF), frame);
    }

    /// Kernel page walk result cached as a global entry
    pub fn fill_global(&mut self, page: u64, frame: u64) {
        debug_assert!(self.cr4.global_pages_enabled());
        self.global.insert(page & !0xFFF, frame);
    }

    /// Translation the CPU would use right now, if cached
    pub fn lookup(&self, page: u64) -> Option<u64> {
        let page = page & !0xFFF;
        self.tlb
            .get(&(self.active_pcid, page))
            .or_else(|| self.global.get(&page))
            .copied()
    }

    /// Number of cached entries tagged with `pcid`
    pub fn cached_under(&self, pcid: Pcid) -> usize {
        self.tlb.keys().filter(|(tag, _)| *tag == pcid).count()
    }
}

impl Default for SimHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl TlbHardware for SimHardware {
    fn write_active_context(&mut self, root: PhysicalAddress, pcid: Pcid, no_flush: bool) {
        self.ops.push(HwOp::WriteActiveContext {
            root,
            pcid,
            no_flush,
        });
        if !self.cr4.pcid_enabled() {
            self.tlb.clear();
        } else if !no_flush {
            self.tlb.retain(|(tag, _), _| *tag != pcid);
        }
        self.active_root = root;
        self.active_pcid = pcid;
    }

    fn invalidate_page(&mut self, addr: VirtualAddress) {
        self.ops.push(HwOp::InvalidatePage(addr));
        let page = addr.page_base().as_u64();
        self.tlb.remove(&(self.active_pcid, page));
        self.global.remove(&page);
    }

    fn invalidate_context(&mut self, pcid: Pcid) {
        self.ops.push(HwOp::InvalidateContext(pcid));
        self.tlb.retain(|(tag, _), _| *tag != pcid);
    }

    fn invalidate_everything(&mut self) {
        self.ops.push(HwOp::InvalidateEverything);
        self.tlb.clear();
        self.global.clear();
    }
}

impl ControlRegisters for SimHardware {
    fn read_cr4(&self) -> Cr4 {
        self.cr4
    }

    fn write_cr4(&mut self, value: Cr4) {
        self.ops.push(HwOp::WriteCr4(value));
        if (self.cr4 ^ value).contains(Cr4::PGE) {
            self.tlb.clear();
            self.global.clear();
        }
        self.cr4 = value;
    }

    fn local_irq_save(&mut self) -> IrqFlags {
        let flags = IrqFlags::new(self.irqs_enabled);
        self.irqs_enabled = false;
        flags
    }

    fn local_irq_restore(&mut self, flags: IrqFlags) {
        if flags.were_enabled() {
            self.irqs_enabled = true;
        }
    }

    fn irqs_disabled(&self) -> bool {
        !self.irqs_enabled
    }
}

/// Broadcaster that queues requests for the test to deliver
#[derive(Debug, Default)]
pub struct SimBroadcaster<'a> {
    sent: Vec<(CpuMask, FlushRequest<'a>)>,
    kernel_sent: Vec<(CpuMask, KernelFlushRequest)>,
}

impl<'a> SimBroadcaster<'a> {
    pub fn new() -> Self {
        Self {
            sent: Vec::new(),
            kernel_sent: Vec::new(),
        }
    }

    pub fn kernel_sent(&self) -> &[(CpuMask, KernelFlushRequest)] {
        &self.kernel_sent
    }

    /// Kernel requests queued for `cpu`, oldest first
    pub fn kernel_pending_for(&self, cpu: CpuId) -> Vec<KernelFlushRequest> {
        self.kernel_sent
            .iter()
            .filter(|(targets, _)| targets.contains(cpu))
            .map(|(_, request)| *request)
            .collect()
    }

    pub fn sent(&self) -> &[(CpuMask, FlushRequest<'a>)] {
        &self.sent
    }

    pub fn take(&mut self) -> Vec<(CpuMask, FlushRequest<'a>)> {
        std::mem::take(&mut self.sent)
    }

    /// Requests queued for `cpu`, oldest first
    pub fn pending_for(&self, cpu: CpuId) -> Vec<FlushRequest<'a>> {
        self.sent
            .iter()
            .filter(|(targets, _)| targets.contains(cpu))
            .map(|(_, request)| *request)
            .collect()
    }
}

impl<'a> Broadcaster<'a> for SimBroadcaster<'a> {
    fn broadcast(&mut self, targets: &CpuMask, request: FlushRequest<'a>) {
        self.sent.push((*targets, request));
    }

    fn broadcast_kernel(&mut self, targets: &CpuMask, request: KernelFlushRequest) {
        self.kernel_sent.push((*targets, request));
    }
}
