//! Tunables for the block cache and the extent allocator

use static_assertions::const_assert;
use xtfs_api::{FsError, Result};

/// Default number of block cache slots
pub const NBUF: usize = 64;

const_assert!(NBUF > 0);

/// Block cache configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufCacheConfig {
    /// Number of block-sized buffers in the pool
    pub nbuf: usize,
}

impl Default for BufCacheConfig {
    fn default() -> Self {
        Self { nbuf: NBUF }
    }
}

impl BufCacheConfig {
    pub fn with_nbuf(nbuf: usize) -> Self {
        Self { nbuf }
    }

    pub fn validate(&self) -> Result<()> {
        if self.nbuf == 0 {
            return Err(FsError::Invalid);
        }
        Ok(())
    }
}

/// Extent allocator configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Total blocks managed, including reserved ones
    pub nblocks: u32,
    /// Blocks `[0, reserved)` hold metadata and are never handed out.
    /// Block 0 is always reserved.
    pub reserved: u32,
}

impl AllocatorConfig {
    pub fn new(nblocks: u32, reserved: u32) -> Self {
        Self { nblocks, reserved }
    }

    pub fn validate(&self) -> Result<()> {
        if self.nblocks == 0 || self.reserved > self.nblocks {
            return Err(FsError::Invalid);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        assert_eq!(BufCacheConfig::default().nbuf, NBUF);
        assert!(BufCacheConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_values() {
        assert_eq!(BufCacheConfig::with_nbuf(0).validate(), Err(FsError::Invalid));
        assert_eq!(AllocatorConfig::new(0, 0).validate(), Err(FsError::Invalid));
        assert_eq!(AllocatorConfig::new(8, 9).validate(), Err(FsError::Invalid));
        assert!(AllocatorConfig::new(8, 8).validate().is_ok());
    }
}
