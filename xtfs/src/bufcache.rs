//! Block cache
//!
//! A fixed pool of block-sized buffers keyed by block number. [`BufCache::load`]
//! hands out [`BcRef`] handles; a handle pins its buffer, so the buffer's
//! bytes stay put and the slot is never evicted while any handle exists.
//! Dropping the last handle makes the slot eligible for reuse but does not
//! evict it.
//!
//! Each buffer carries a reader/writer lock. Readers take it shared for the
//! duration of a read; `lock_buffer` takes it exclusively, marks the buffer
//! dirty, and publishes the writes when the guard is dropped.
//!
//! Lock order: the cache map lock may be held while taking the data lock of
//! an unreferenced slot. A loader holding the data lock of its own (pinned)
//! slot may take the map lock. Pinned slots are never chosen as victims, so
//! the two orders never meet on the same slot.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;
use hashbrown::HashMap;
use spin::{Once, RwLock, RwLockReadGuard, RwLockWriteGuard};
use xtfs_api::{BLOCKSIZE, BlockNum, FsError, Result};

use crate::config::BufCacheConfig;
use crate::drivers::BlockDevice;
use crate::sync::SpinLock;

bitflags! {
    /// Buffer state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufFlags: u8 {
        /// Contents match (or are newer than) the disk block
        const VALID = 1 << 0;
        /// Contents must be written back before reuse
        const DIRTY = 1 << 1;
    }
}

/// One buffer of the pool
struct BcSlot {
    /// Block held by this slot; 0 when free
    bn: AtomicU32,
    /// Live handles. Only incremented from zero under the map lock.
    refs: AtomicU32,
    flags: AtomicU8,
    data: RwLock<Box<[u8]>>,
}

impl BcSlot {
    fn new() -> Self {
        Self {
            bn: AtomicU32::new(0),
            refs: AtomicU32::new(0),
            flags: AtomicU8::new(0),
            data: RwLock::new(vec![0u8; BLOCKSIZE].into_boxed_slice()),
        }
    }

    fn flags(&self) -> BufFlags {
        BufFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    fn set_flags(&self, flags: BufFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    fn clear_flags(&self, flags: BufFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }
}

struct CacheState {
    /// Resident blocks: block number -> slot index
    map: HashMap<BlockNum, usize>,
    /// Clock hand for victim selection
    hand: usize,
}

enum Victim {
    Clean(usize),
    Dirty(usize),
    None,
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub writebacks: u64,
}

/// Block cache
pub struct BufCache {
    dev: Box<dyn BlockDevice>,
    slots: Box<[BcSlot]>,
    state: SpinLock<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    writebacks: AtomicU64,
}

static BUFCACHE: Once<BufCache> = Once::new();

impl BufCache {
    /// Create a cache of `config.nbuf` buffers in front of `dev`
    pub fn new(dev: Box<dyn BlockDevice>, config: BufCacheConfig) -> Result<Self> {
        config.validate()?;
        let slots: Vec<BcSlot> = (0..config.nbuf).map(|_| BcSlot::new()).collect();
        Ok(Self {
            dev,
            slots: slots.into_boxed_slice(),
            state: SpinLock::new(CacheState {
                map: HashMap::with_capacity(config.nbuf),
                hand: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            writebacks: AtomicU64::new(0),
        })
    }

    /// Install the process-wide cache. Only the first call creates it; later
    /// calls drop `dev` and return the existing instance.
    pub fn init_global(dev: Box<dyn BlockDevice>, config: BufCacheConfig) -> Result<&'static BufCache> {
        config.validate()?;
        if let Some(cache) = BUFCACHE.get() {
            log::warn!("bufcache: already initialized");
            return Ok(cache);
        }
        let cache = Self::new(dev, config)?;
        log::info!("bufcache: {} buffers of {} bytes", config.nbuf, BLOCKSIZE);
        Ok(BUFCACHE.call_once(|| cache))
    }

    /// The process-wide cache, if initialized
    pub fn get() -> Option<&'static BufCache> {
        BUFCACHE.get()
    }

    pub fn device(&self) -> &dyn BlockDevice {
        &*self.dev
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Get a handle to block `bn`, reading it from disk if not resident.
    ///
    /// Returns `Ok(None)` (the empty handle) for block 0, `NoMemory` if every
    /// buffer is pinned, `Io` if the device read fails.
    pub fn load(&self, bn: BlockNum) -> Result<Option<BcRef<'_>>> {
        if bn == 0 {
            return Ok(None);
        }

        loop {
            let mut state = self.state.lock();

            if let Some(&idx) = state.map.get(&bn) {
                let slot = &self.slots[idx];
                slot.refs.fetch_add(1, Ordering::AcqRel);
                drop(state);
                self.hits.fetch_add(1, Ordering::Relaxed);

                let bref = BcRef { cache: self, idx };
                // Wait out an in-flight read by the slot's loader
                drop(slot.data.read());
                if !slot.flags().contains(BufFlags::VALID) {
                    return Err(FsError::Io);
                }
                return Ok(Some(bref));
            }

            match self.pick_victim(&mut state) {
                Victim::Clean(idx) => {
                    let slot = &self.slots[idx];
                    let old = slot.bn.load(Ordering::Acquire);
                    if old != 0 {
                        state.map.remove(&old);
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                        log::trace!("bufcache: evict block {} from slot {}", old, idx);
                    }
                    slot.bn.store(bn, Ordering::Release);
                    slot.flags.store(0, Ordering::Release);
                    slot.refs.store(1, Ordering::Release);
                    state.map.insert(bn, idx);
                    // Unreferenced, so nobody else holds its data lock
                    let mut data = slot.data.write();
                    drop(state);

                    self.misses.fetch_add(1, Ordering::Relaxed);
                    log::trace!("bufcache: miss block {} -> slot {}", bn, idx);
                    return match self.dev.read_block(bn, &mut data[..]) {
                        Ok(()) => {
                            slot.set_flags(BufFlags::VALID);
                            drop(data);
                            Ok(Some(BcRef { cache: self, idx }))
                        }
                        Err(err) => {
                            let mut state = self.state.lock();
                            if state.map.get(&bn) == Some(&idx) {
                                state.map.remove(&bn);
                            }
                            slot.bn.store(0, Ordering::Release);
                            drop(state);
                            drop(data);
                            slot.refs.fetch_sub(1, Ordering::AcqRel);
                            log::warn!("bufcache: read of block {} failed: {}", bn, err);
                            Err(err)
                        }
                    };
                }
                Victim::Dirty(idx) => {
                    let slot = &self.slots[idx];
                    slot.refs.fetch_add(1, Ordering::AcqRel);
                    drop(state);
                    let result = self.write_back(idx);
                    slot.refs.fetch_sub(1, Ordering::AcqRel);
                    result?;
                }
                Victim::None => {
                    log::debug!("bufcache: all {} buffers pinned", self.slots.len());
                    return Err(FsError::NoMemory);
                }
            }
        }
    }

    /// Clock scan for an unreferenced slot. Clean slots win; a dirty one is
    /// returned only if no clean slot is free.
    fn pick_victim(&self, state: &mut CacheState) -> Victim {
        let n = self.slots.len();
        let mut dirty = None;
        for step in 0..n {
            let idx = (state.hand + step) % n;
            let slot = &self.slots[idx];
            if slot.refs.load(Ordering::Acquire) != 0 {
                continue;
            }
            if slot.flags().contains(BufFlags::DIRTY) {
                dirty.get_or_insert(idx);
                continue;
            }
            state.hand = (idx + 1) % n;
            return Victim::Clean(idx);
        }
        match dirty {
            Some(idx) => Victim::Dirty(idx),
            None => Victim::None,
        }
    }

    /// Write slot `idx` to disk if dirty. Caller holds a reference.
    fn write_back(&self, idx: usize) -> Result<()> {
        let slot = &self.slots[idx];
        // Shared lock: no writer can dirty the buffer while we copy it out
        let data = slot.data.read();
        if !slot.flags().contains(BufFlags::DIRTY) {
            return Ok(());
        }
        let bn = slot.bn.load(Ordering::Acquire);
        slot.clear_flags(BufFlags::DIRTY);
        if let Err(err) = self.dev.write_block(bn, &data) {
            slot.set_flags(BufFlags::DIRTY);
            log::warn!("bufcache: write-back of block {} failed: {}", bn, err);
            return Err(err);
        }
        self.writebacks.fetch_add(1, Ordering::Relaxed);
        log::trace!("bufcache: wrote back block {}", bn);
        Ok(())
    }

    /// Write every dirty buffer back to disk, then flush the device
    pub fn sync(&self) -> Result<()> {
        for idx in 0..self.slots.len() {
            let slot = &self.slots[idx];
            {
                let _state = self.state.lock();
                if slot.bn.load(Ordering::Acquire) == 0 || !slot.flags().contains(BufFlags::DIRTY) {
                    continue;
                }
                slot.refs.fetch_add(1, Ordering::AcqRel);
            }
            let result = self.write_back(idx);
            slot.refs.fetch_sub(1, Ordering::AcqRel);
            result?;
        }
        self.dev.flush()
    }

    /// Is block `bn` resident?
    pub fn contains(&self, bn: BlockNum) -> bool {
        self.state.lock().map.contains_key(&bn)
    }

    /// Live handles on block `bn`, or `None` if not resident
    pub fn refcount(&self, bn: BlockNum) -> Option<u32> {
        let state = self.state.lock();
        state
            .map
            .get(&bn)
            .map(|&idx| self.slots[idx].refs.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            writebacks: self.writebacks.load(Ordering::Relaxed),
        }
    }
}

/// Counted reference to a cached block
///
/// Move-only in spirit: `clone` takes another reference, `drop` releases one.
/// Use `Option<BcRef>` where a handle may be empty.
pub struct BcRef<'c> {
    cache: &'c BufCache,
    idx: usize,
}

impl<'c> BcRef<'c> {
    fn slot(&self) -> &'c BcSlot {
        &self.cache.slots[self.idx]
    }

    /// Block number held by this buffer
    pub fn blocknum(&self) -> BlockNum {
        self.slot().bn.load(Ordering::Acquire)
    }

    /// Shared access to the buffer's bytes
    pub fn read(&self) -> BufReadGuard<'_> {
        BufReadGuard {
            guard: self.slot().data.read(),
        }
    }

    /// Exclusive write access. The buffer is marked dirty; dropping the
    /// guard (or calling [`BufWriteGuard::unlock`]) releases the lock.
    pub fn lock_buffer(&self) -> BufWriteGuard<'_> {
        let guard = self.slot().data.write();
        self.slot().set_flags(BufFlags::DIRTY);
        BufWriteGuard { guard }
    }

    pub fn flags(&self) -> BufFlags {
        self.slot().flags()
    }

    pub fn is_dirty(&self) -> bool {
        self.flags().contains(BufFlags::DIRTY)
    }

    /// The cache this handle belongs to
    pub fn cache(&self) -> &'c BufCache {
        self.cache
    }
}

impl Clone for BcRef<'_> {
    fn clone(&self) -> Self {
        // Already pinned by `self`, so no victim scan can race with this
        self.slot().refs.fetch_add(1, Ordering::AcqRel);
        Self {
            cache: self.cache,
            idx: self.idx,
        }
    }
}

impl Drop for BcRef<'_> {
    fn drop(&mut self) {
        let prev = self.slot().refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "bufcache: reference count underflow");
    }
}

impl PartialEq for BcRef<'_> {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self.cache, other.cache) && self.idx == other.idx
    }
}

impl Eq for BcRef<'_> {}

impl fmt::Debug for BcRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BcRef")
            .field("slot", &self.idx)
            .field("blocknum", &self.blocknum())
            .field("flags", &self.flags())
            .finish()
    }
}

/// Shared view of a buffer
pub struct BufReadGuard<'a> {
    guard: RwLockReadGuard<'a, Box<[u8]>>,
}

impl Deref for BufReadGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard[..]
    }
}

/// Exclusive view of a buffer; the write lock is held until drop
pub struct BufWriteGuard<'a> {
    guard: RwLockWriteGuard<'a, Box<[u8]>>,
}

impl BufWriteGuard<'_> {
    /// Release the write lock
    pub fn unlock(self) {
        drop(self);
    }
}

impl Deref for BufWriteGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard[..]
    }
}

impl DerefMut for BufWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.guard[..]
    }
}
