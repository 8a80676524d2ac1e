//! # TLB Flush Statistics
//!
//! Only built with the `tlb_stats` feature. Counters are relaxed and only
//! meant for profiling; they impose no ordering on the flush protocol.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Global counters
pub static STATS: TlbStats = TlbStats::new();

/// Flush counters
#[derive(Debug)]
pub struct TlbStats {
    /// Requests that needed no invalidation
    pub skipped: AtomicU64,
    /// Page-by-page flushes
    pub range_flushes: AtomicU64,
    /// Pages invalidated by range flushes
    pub pages_flushed: AtomicU64,
    /// Whole-context or whole-TLB flushes
    pub full_flushes: AtomicU64,
    /// Flushes done by reloading the active root
    pub switch_flushes: AtomicU64,
    /// Broadcasts sent
    pub broadcasts: AtomicU64,
    /// Remote requests handled
    pub ipis_received: AtomicU64,
    /// Unmap batches drained
    pub batch_drains: AtomicU64,
}

/// Point-in-time copy of [`TlbStats`]
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TlbStatsSnapshot {
    pub skipped: u64,
    pub range_flushes: u64,
    pub pages_flushed: u64,
    pub full_flushes: u64,
    pub switch_flushes: u64,
    pub broadcasts: u64,
    pub ipis_received: u64,
    pub batch_drains: u64,
}

impl TlbStats {
    /// All counters at zero
    pub const fn new() -> Self {
        Self {
            skipped: AtomicU64::new(0),
            range_flushes: AtomicU64::new(0),
            pages_flushed: AtomicU64::new(0),
            full_flushes: AtomicU64::new(0),
            switch_flushes: AtomicU64::new(0),
            broadcasts: AtomicU64::new(0),
            ipis_received: AtomicU64::new(0),
            batch_drains: AtomicU64::new(0),
        }
    }

    /// Copy the counters
    pub fn snapshot(&self) -> TlbStatsSnapshot {
        TlbStatsSnapshot {
            skipped: self.skipped.load(Ordering::Relaxed),
            range_flushes: self.range_flushes.load(Ordering::Relaxed),
            pages_flushed: self.pages_flushed.load(Ordering::Relaxed),
            full_flushes: self.full_flushes.load(Ordering::Relaxed),
            switch_flushes: self.switch_flushes.load(Ordering::Relaxed),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            ipis_received: self.ipis_received.load(Ordering::Relaxed),
            batch_drains: self.batch_drains.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter
    pub fn reset(&self) {
        for counter in [
            &self.skipped,
            &self.range_flushes,
            &self.pages_flushed,
            &self.full_flushes,
            &self.switch_flushes,
            &self.broadcasts,
            &self.ipis_received,
            &self.batch_drains,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for TlbStats {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TlbStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "TLB Statistics:")?;
        writeln!(f, "  Skipped:         {}", self.skipped)?;
        writeln!(f, "  Range flushes:   {} ({} pages)", self.range_flushes, self.pages_flushed)?;
        writeln!(f, "  Full flushes:    {}", self.full_flushes)?;
        writeln!(f, "  Switch flushes:  {}", self.switch_flushes)?;
        writeln!(f, "  Broadcasts:      {}", self.broadcasts)?;
        writeln!(f, "  IPIs received:   {}", self.ipis_received)?;
        write!(f, "  Batch drains:    {}", self.batch_drains)
    }
}

/// Snapshot of the global counters
pub fn snapshot() -> TlbStatsSnapshot {
    STATS.snapshot()
}

/// Zero the global counters
pub fn reset() {
    STATS.reset();
}
