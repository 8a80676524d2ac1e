//! # CPU Masks
//!
//! Fixed-size CPU bitmaps. [`CpuMask`] is a plain value used for broadcast
//! targets and batch accumulation; [`AtomicCpuMask`] is the shared form an
//! address space carries, where each CPU only ever flips its own bit.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// Constants
// =============================================================================

/// Maximum number of CPUs supported
pub const MAX_CPUS: usize = 256;

const BITS_PER_WORD: usize = 64;
const MASK_WORDS: usize = MAX_CPUS / BITS_PER_WORD;

static_assertions::const_assert!(MAX_CPUS % BITS_PER_WORD == 0);

// =============================================================================
// CPU ID
// =============================================================================

/// Logical CPU index (0-based, dense)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct CpuId(u32);

impl CpuId {
    /// The bootstrap processor
    pub const BSP: CpuId = CpuId(0);

    /// Create a CPU ID
    #[inline]
    pub const fn new(id: u32) -> Self {
        debug_assert!((id as usize) < MAX_CPUS);
        Self(id)
    }

    /// Get the raw index
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Get the index as usize
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    const fn word_and_bit(self) -> (usize, u64) {
        let idx = self.0 as usize;
        (idx / BITS_PER_WORD, 1u64 << (idx % BITS_PER_WORD))
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

// =============================================================================
// CPU Mask (value)
// =============================================================================

/// A set of CPUs
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuMask {
    words: [u64; MASK_WORDS],
}

impl CpuMask {
    /// Create an empty mask
    #[inline]
    pub const fn new() -> Self {
        Self {
            words: [0; MASK_WORDS],
        }
    }

    /// Create a mask holding a single CPU
    #[inline]
    pub fn single(cpu: CpuId) -> Self {
        let mut mask = Self::new();
        mask.set(cpu);
        mask
    }

    /// Add a CPU
    #[inline]
    pub fn set(&mut self, cpu: CpuId) {
        let (word, bit) = cpu.word_and_bit();
        self.words[word] |= bit;
    }

    /// Remove a CPU
    #[inline]
    pub fn clear(&mut self, cpu: CpuId) {
        let (word, bit) = cpu.word_and_bit();
        self.words[word] &= !bit;
    }

    /// Check if a CPU is present
    #[inline]
    pub fn contains(&self, cpu: CpuId) -> bool {
        let (word, bit) = cpu.word_and_bit();
        self.words[word] & bit != 0
    }

    /// Check if no CPU is present
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Number of CPUs present
    #[inline]
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Union another mask into this one
    #[inline]
    pub fn union_with(&mut self, other: &CpuMask) {
        for (dst, src) in self.words.iter_mut().zip(other.words.iter()) {
            *dst |= *src;
        }
    }

    /// Remove every CPU
    #[inline]
    pub fn clear_all(&mut self) {
        self.words = [0; MASK_WORDS];
    }

    /// Iterate over the CPUs in ascending order
    pub fn iter(&self) -> CpuMaskIter<'_> {
        CpuMaskIter {
            mask: self,
            word: 0,
            pending: self.words[0],
        }
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(|c| c.as_u32())).finish()
    }
}

impl FromIterator<CpuId> for CpuMask {
    fn from_iter<I: IntoIterator<Item = CpuId>>(iter: I) -> Self {
        let mut mask = CpuMask::new();
        for cpu in iter {
            mask.set(cpu);
        }
        mask
    }
}

/// Iterator over the CPUs of a [`CpuMask`]
pub struct CpuMaskIter<'a> {
    mask: &'a CpuMask,
    word: usize,
    pending: u64,
}

impl Iterator for CpuMaskIter<'_> {
    type Item = CpuId;

    fn next(&mut self) -> Option<CpuId> {
        loop {
            if self.pending != 0 {
                let bit = self.pending.trailing_zeros() as usize;
                self.pending &= self.pending - 1;
                return Some(CpuId((self.word * BITS_PER_WORD + bit) as u32));
            }
            self.word += 1;
            if self.word >= MASK_WORDS {
                return None;
            }
            self.pending = self.mask.words[self.word];
        }
    }
}

// =============================================================================
// Atomic CPU Mask (shared)
// =============================================================================

/// A CPU set shared between CPUs
///
/// Each CPU sets and clears only its own bit; any CPU may take a snapshot.
pub struct AtomicCpuMask {
    words: [AtomicU64; MASK_WORDS],
}

impl AtomicCpuMask {
    /// Create an empty mask
    pub const fn new() -> Self {
        Self {
            words: [const { AtomicU64::new(0) }; MASK_WORDS],
        }
    }

    /// Set a CPU's bit
    #[inline]
    pub fn insert(&self, cpu: CpuId, order: Ordering) {
        let (word, bit) = cpu.word_and_bit();
        self.words[word].fetch_or(bit, order);
    }

    /// Clear a CPU's bit
    #[inline]
    pub fn remove(&self, cpu: CpuId, order: Ordering) {
        let (word, bit) = cpu.word_and_bit();
        self.words[word].fetch_and(!bit, order);
    }

    /// Test a CPU's bit
    #[inline]
    pub fn contains(&self, cpu: CpuId, order: Ordering) -> bool {
        let (word, bit) = cpu.word_and_bit();
        self.words[word].load(order) & bit != 0
    }

    /// Copy the current contents into a value mask
    ///
    /// Words are loaded one at a time; the snapshot is only atomic per word.
    pub fn snapshot(&self, order: Ordering) -> CpuMask {
        let mut mask = CpuMask::new();
        for (dst, src) in mask.words.iter_mut().zip(self.words.iter()) {
            *dst = src.load(order);
        }
        mask
    }
}

impl Default for AtomicCpuMask {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AtomicCpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.snapshot(Ordering::Relaxed), f)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_clear_contains() {
        let mut mask = CpuMask::new();
        assert!(mask.is_empty());
        mask.set(CpuId::new(3));
        mask.set(CpuId::new(130));
        assert!(mask.contains(CpuId::new(3)));
        assert!(mask.contains(CpuId::new(130)));
        assert!(!mask.contains(CpuId::new(4)));
        assert_eq!(mask.count(), 2);
        mask.clear(CpuId::new(3));
        assert!(!mask.contains(CpuId::new(3)));
        assert_eq!(mask.count(), 1);
    }

    #[test]
    fn test_iter_crosses_words() {
        let mask: CpuMask = [0, 63, 64, 255].into_iter().map(CpuId::new).collect();
        let cpus: Vec<u32> = mask.iter().map(CpuId::as_u32).collect();
        assert_eq!(cpus, vec![0, 63, 64, 255]);
    }

    #[test]
    fn test_union() {
        let mut a = CpuMask::single(CpuId::new(1));
        let b: CpuMask = [2, 70].into_iter().map(CpuId::new).collect();
        a.union_with(&b);
        assert_eq!(a.count(), 3);
        assert!(a.contains(CpuId::new(70)));
    }

    #[test]
    fn test_atomic_snapshot() {
        let shared = AtomicCpuMask::new();
        shared.insert(CpuId::new(5), Ordering::SeqCst);
        shared.insert(CpuId::new(200), Ordering::SeqCst);
        assert!(shared.contains(CpuId::new(5), Ordering::Relaxed));
        shared.remove(CpuId::new(5), Ordering::SeqCst);
        let snap = shared.snapshot(Ordering::SeqCst);
        assert_eq!(snap, CpuMask::single(CpuId::new(200)));
    }
}
