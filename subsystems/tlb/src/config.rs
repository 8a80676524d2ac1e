//! # TLB Configuration
//!
//! Runtime tunables of the flush protocol. A configuration is validated
//! once, when the [`crate::FlushDecisionEngine`] is built from it.

use core::fmt;

/// Largest accepted single-page flush ceiling
///
/// One last-level page table maps 512 pages; past that a per-page loop
/// always costs more than dropping the whole context.
pub const MAX_SINGLE_PAGE_FLUSH_CEILING: usize = 512;

/// Tunables of the flush decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbConfig {
    /// Largest range, in pages, still invalidated page by page
    ///
    /// Larger ranges are escalated to a whole-context flush.
    pub single_page_flush_ceiling: usize,
}

impl TlbConfig {
    /// Default configuration
    pub const DEFAULT: TlbConfig = TlbConfig {
        single_page_flush_ceiling: 33,
    };

    /// Replace the single-page flush ceiling
    pub const fn with_single_page_flush_ceiling(mut self, pages: usize) -> Self {
        self.single_page_flush_ceiling = pages;
        self
    }

    /// Check that every tunable is within range
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.single_page_flush_ceiling {
            0 => Err(ConfigError::ZeroFlushCeiling),
            pages if pages > MAX_SINGLE_PAGE_FLUSH_CEILING => {
                Err(ConfigError::FlushCeilingTooLarge {
                    pages,
                    max: MAX_SINGLE_PAGE_FLUSH_CEILING,
                })
            },
            _ => Ok(()),
        }
    }
}

impl Default for TlbConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Rejected configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// A ceiling of zero pages would make every range flush a full flush
    ZeroFlushCeiling,
    /// The ceiling exceeds [`MAX_SINGLE_PAGE_FLUSH_CEILING`]
    FlushCeilingTooLarge {
        /// Requested ceiling
        pages: usize,
        /// Accepted maximum
        max: usize,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroFlushCeiling => write!(f, "single-page flush ceiling must be at least 1"),
            Self::FlushCeilingTooLarge { pages, max } => {
                write!(f, "single-page flush ceiling {} exceeds maximum {}", pages, max)
            },
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
