//! Extent allocator
//!
//! Hands out contiguous runs of free data blocks. The allocator is the only
//! owner of free-space state and does its own locking.

use alloc::vec;
use alloc::vec::Vec;

use xtfs_api::{BlockNum, FsError, Result};

use crate::config::AllocatorConfig;
use crate::sync::SpinLock;

/// Source of contiguous free blocks
pub trait ExtentAllocator: Send + Sync {
    /// First block of a run of `count` free blocks, now marked in use.
    /// Fails with `NoSpace` if no such run exists.
    fn allocate_extent(&self, count: u32) -> Result<BlockNum>;

    /// Return `[first, first + count)` to the free pool
    fn free_extent(&self, first: BlockNum, count: u32) -> Result<()>;
}

struct Bitmap {
    /// One bit per block, set = in use
    words: Vec<u64>,
    /// Where the next search starts
    hint: u32,
    free: u32,
}

impl Bitmap {
    #[inline]
    fn test(&self, bn: u32) -> bool {
        self.words[(bn / 64) as usize] & (1u64 << (bn % 64)) != 0
    }

    #[inline]
    fn set(&mut self, bn: u32) {
        self.words[(bn / 64) as usize] |= 1u64 << (bn % 64);
    }

    #[inline]
    fn clear(&mut self, bn: u32) {
        self.words[(bn / 64) as usize] &= !(1u64 << (bn % 64));
    }

    /// First-fit run of `count` clear bits inside `[start, end)`
    fn find_run(&self, start: u32, end: u32, count: u32) -> Option<u32> {
        let mut run_start = start;
        let mut run_len = 0u32;
        let mut bn = start;
        while bn < end {
            // Skip fully used words quickly
            if run_len == 0 && bn % 64 == 0 && self.words[(bn / 64) as usize] == u64::MAX {
                bn += 64;
                run_start = bn;
                continue;
            }
            if self.test(bn) {
                run_len = 0;
                run_start = bn + 1;
            } else {
                run_len += 1;
                if run_len == count {
                    return Some(run_start);
                }
            }
            bn += 1;
        }
        None
    }
}

/// First-fit allocator over an in-memory free-block bitmap
pub struct BitmapAllocator {
    config: AllocatorConfig,
    bitmap: SpinLock<Bitmap>,
}

impl BitmapAllocator {
    pub fn new(config: AllocatorConfig) -> Result<Self> {
        config.validate()?;
        let reserved = config.reserved.max(1);
        let mut bitmap = Bitmap {
            words: vec![0u64; (config.nblocks as usize).div_ceil(64)],
            hint: reserved,
            free: config.nblocks - reserved.min(config.nblocks),
        };
        for bn in 0..reserved.min(config.nblocks) {
            bitmap.set(bn);
        }
        Ok(Self {
            config: AllocatorConfig { reserved, ..config },
            bitmap: SpinLock::new(bitmap),
        })
    }

    pub fn config(&self) -> AllocatorConfig {
        self.config
    }

    /// Blocks still available
    pub fn free_blocks(&self) -> u32 {
        self.bitmap.lock().free
    }

    /// Is `bn` currently allocated (or reserved)?
    pub fn is_allocated(&self, bn: BlockNum) -> bool {
        bn >= self.config.nblocks || self.bitmap.lock().test(bn)
    }

    /// Mark `[first, first + count)` in use without searching, e.g. for
    /// blocks already referenced by an existing image
    pub fn mark_used(&self, first: BlockNum, count: u32) -> Result<()> {
        let end = self.check_range(first, count)?;
        let mut bitmap = self.bitmap.lock();
        if (first..end).any(|bn| bitmap.test(bn)) {
            return Err(FsError::Invalid);
        }
        for bn in first..end {
            bitmap.set(bn);
        }
        bitmap.free -= count;
        Ok(())
    }

    fn check_range(&self, first: BlockNum, count: u32) -> Result<u32> {
        if count == 0 || first < self.config.reserved {
            return Err(FsError::Invalid);
        }
        match first.checked_add(count) {
            Some(end) if end <= self.config.nblocks => Ok(end),
            _ => Err(FsError::Invalid),
        }
    }
}

impl ExtentAllocator for BitmapAllocator {
    fn allocate_extent(&self, count: u32) -> Result<BlockNum> {
        if count == 0 {
            return Err(FsError::Invalid);
        }
        let mut bitmap = self.bitmap.lock();
        if count > bitmap.free {
            return Err(FsError::NoSpace);
        }

        let lo = self.config.reserved;
        let hi = self.config.nblocks;
        let hint = bitmap.hint.clamp(lo, hi);
        let found = bitmap
            .find_run(hint, hi, count)
            .or_else(|| bitmap.find_run(lo, hint.saturating_add(count).min(hi), count));

        match found {
            Some(first) => {
                for bn in first..first + count {
                    bitmap.set(bn);
                }
                bitmap.free -= count;
                bitmap.hint = first + count;
                log::trace!("extent_alloc: [{}, +{}) allocated", first, count);
                Ok(first)
            }
            None => {
                log::debug!("extent_alloc: no run of {} blocks ({} free)", count, bitmap.free);
                Err(FsError::NoSpace)
            }
        }
    }

    fn free_extent(&self, first: BlockNum, count: u32) -> Result<()> {
        let end = self.check_range(first, count)?;
        let mut bitmap = self.bitmap.lock();
        if !(first..end).all(|bn| bitmap.test(bn)) {
            log::warn!("extent_alloc: freeing unallocated blocks in [{}, {})", first, end);
            return Err(FsError::Invalid);
        }
        for bn in first..end {
            bitmap.clear(bn);
        }
        bitmap.free += count;
        if first < bitmap.hint {
            bitmap.hint = first;
        }
        Ok(())
    }
}
