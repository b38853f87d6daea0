//! Block device drivers
//!
//! The block cache talks to storage through [`BlockDevice`]. Transfers are
//! always whole `BLOCKSIZE` blocks addressed by block number.

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use xtfs_api::{BLOCKSIZE, BlockNum, FsError, Result};

use crate::sync::SpinLock;

/// Block device interface
pub trait BlockDevice: Send + Sync {
    /// Read block `bn` into `buf` (`buf.len() == BLOCKSIZE`)
    fn read_block(&self, bn: BlockNum, buf: &mut [u8]) -> Result<()>;

    /// Write `buf` to block `bn` (`buf.len() == BLOCKSIZE`)
    fn write_block(&self, bn: BlockNum, buf: &[u8]) -> Result<()>;

    /// Get total number of blocks
    fn num_blocks(&self) -> u32;

    /// Flush any cached writes
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// RAM Disk Implementation
// ============================================================================

/// In-memory block device
pub struct RamDisk {
    data: SpinLock<Vec<u8>>,
    nblocks: u32,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl RamDisk {
    /// Create a zero-filled disk of `nblocks` blocks
    pub fn new(nblocks: u32) -> Self {
        Self {
            data: SpinLock::new(vec![0u8; nblocks as usize * BLOCKSIZE]),
            nblocks,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Number of block reads served
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of block writes served
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn range(&self, bn: BlockNum, len: usize) -> Result<core::ops::Range<usize>> {
        if bn >= self.nblocks || len != BLOCKSIZE {
            return Err(FsError::Io);
        }
        let start = bn as usize * BLOCKSIZE;
        Ok(start..start + BLOCKSIZE)
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, bn: BlockNum, buf: &mut [u8]) -> Result<()> {
        let range = self.range(bn, buf.len())?;
        buf.copy_from_slice(&self.data.lock()[range]);
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_block(&self, bn: BlockNum, buf: &[u8]) -> Result<()> {
        let range = self.range(bn, buf.len())?;
        self.data.lock()[range].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn num_blocks(&self) -> u32 {
        self.nblocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ramdisk_roundtrip() {
        let disk = RamDisk::new(4);
        let mut block = vec![0u8; BLOCKSIZE];
        block[0] = 0xaa;
        block[BLOCKSIZE - 1] = 0x55;
        disk.write_block(3, &block).unwrap();

        let mut out = vec![0u8; BLOCKSIZE];
        disk.read_block(3, &mut out).unwrap();
        assert_eq!(out, block);
        assert_eq!(disk.read_count(), 1);
        assert_eq!(disk.write_count(), 1);
    }

    #[test]
    fn test_ramdisk_out_of_range() {
        let disk = RamDisk::new(2);
        let mut buf = vec![0u8; BLOCKSIZE];
        assert_eq!(disk.read_block(2, &mut buf), Err(FsError::Io));
        assert_eq!(disk.write_block(7, &buf), Err(FsError::Io));
        assert_eq!(disk.read_block(0, &mut buf[..512]), Err(FsError::Io));
    }
}
