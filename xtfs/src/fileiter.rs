//! File iterator
//!
//! [`FileIter`] maps a byte offset in a file to the extent that covers it.
//! The extent table is `NDIRECT` slots in the inode followed by at most one
//! indirect block of `NINDIRECT` packed descriptors; a slot with `count == 0`
//! ends the table.
//!
//! The iterator keeps its position as a slot location plus a copy of the
//! descriptor found there. While the active slot lives in the indirect block
//! the iterator pins that block; for direct slots it holds nothing beyond the
//! caller's inode reference.
//!
//! Writers hold the inode's write lock ([`InodeRef::lock`]) across the whole
//! structural change and hand it to [`FileIter::insert`]. While that lock is
//! held, reposition with [`FileIter::find_locked`] and
//! [`FileIter::next_locked`]; the plain variants take the inode's read lock.

use core::fmt;
use core::ops::{AddAssign, SubAssign};

use xtfs_api::*;

use crate::bufcache::BcRef;
use crate::extent_alloc::ExtentAllocator;
use crate::inode::{InodeFields, InodeRef, InodeViewMut};

/// Where the active descriptor is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Direct(usize),
    Indirect(usize),
}

/// Coarse iterator position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterState {
    /// Inside an extent stored in the inode
    InsideDirect,
    /// Inside an extent stored in the indirect block
    InsideIndirect,
    /// At or beyond end-of-file
    PastEnd,
}

/// Where the direct part of a walk stopped
struct DirectWalk {
    eoff: u64,
    eidx: usize,
    hit: Option<Extent>,
    indirect: BlockNum,
}

#[inline]
fn indirect_slot(block: &[u8], i: usize) -> Extent {
    let off = i * EXTENT_SIZE;
    Extent::decode(&block[off..off + EXTENT_SIZE])
}

/// Offset iterator over a file's extents
pub struct FileIter<'a, 'c> {
    ino: &'a InodeRef<'c>,
    /// Current file offset
    off: u64,
    /// File offset where the active extent starts
    eoff: u64,
    /// Index of the active extent, direct slots first
    eidx: usize,
    /// Active descriptor; `None` once the walk ran off the table
    eptr: Option<Slot>,
    /// Descriptor stored at `eptr` when it was last resolved
    ext: Extent,
    /// Pinned indirect block, held iff `eptr` is an indirect slot
    indirect: Option<BcRef<'c>>,
}

impl<'a, 'c> FileIter<'a, 'c> {
    /// Iterator over `ino` positioned at `off`
    pub fn new(ino: &'a InodeRef<'c>, off: u64) -> Self {
        let mut it = Self {
            ino,
            off: 0,
            eoff: 0,
            eidx: 0,
            eptr: None,
            ext: Extent::EMPTY,
            indirect: None,
        };
        it.find(off);
        it
    }

    pub fn inode(&self) -> &'a InodeRef<'c> {
        self.ino
    }

    /// Current file offset
    #[inline]
    pub fn offset(&self) -> u64 {
        self.off
    }

    /// Index of the active extent
    #[inline]
    pub fn extent_index(&self) -> usize {
        self.eidx
    }

    /// File offset at which the active extent starts
    #[inline]
    pub fn extent_offset(&self) -> u64 {
        self.eoff
    }

    /// The active descriptor as of the last repositioning, or `None` past
    /// the end of the table
    pub fn extent(&self) -> Option<Extent> {
        self.eptr.map(|_| self.ext)
    }

    /// True iff the offset lies inside some extent (present or hole)
    pub fn active(&self) -> bool {
        self.extent().is_some_and(|ext| !ext.is_end())
    }

    /// True iff no block is stored for the offset
    pub fn empty(&self) -> bool {
        self.blocknum() == 0
    }

    /// Block holding the current offset, 0 if `empty()`. A descriptor whose
    /// run would wrap past the largest block number stores nothing there.
    pub fn blocknum(&self) -> BlockNum {
        match self.extent() {
            Some(ext) if ext.first != 0 => {
                let rel = (self.off - self.eoff) >> BLOCKSHIFT;
                BlockNum::try_from(rel)
                    .ok()
                    .and_then(|rel| ext.first.checked_add(rel))
                    .unwrap_or(0)
            }
            _ => 0,
        }
    }

    /// Offset within the current block
    #[inline]
    pub fn block_relative_offset(&self) -> usize {
        block_offset(self.off)
    }

    /// Cache handle for `blocknum()`; `None` if `empty()`
    pub fn load(&self) -> Result<Option<BcRef<'c>>> {
        self.ino.cache().load(self.blocknum())
    }

    pub fn state(&self) -> IterState {
        match self.eptr {
            Some(Slot::Direct(_)) if self.active() => IterState::InsideDirect,
            Some(Slot::Indirect(_)) if self.active() => IterState::InsideIndirect,
            _ => IterState::PastEnd,
        }
    }

    /// True iff the active extent already covers `t`
    fn covers(&self, t: u64) -> bool {
        self.active() && t >= self.eoff && t < self.eoff + self.ext.span()
    }

    /// Move to offset `t`
    pub fn find(&mut self, t: u64) -> &mut Self {
        if !self.covers(t) {
            let walk = self.walk_direct(&self.ino.view(), t);
            self.finish_walk(walk, t);
        }
        self.off = t;
        self
    }

    /// Move to offset `t` while the caller holds the inode's write lock
    pub fn find_locked(&mut self, inode: &InodeViewMut<'_>, t: u64) -> &mut Self {
        debug_assert!(inode.inode() == self.ino, "fileiter: lock of another inode");
        if !self.covers(t) {
            let walk = self.walk_direct(inode, t);
            self.finish_walk(walk, t);
        }
        self.off = t;
        self
    }

    /// Walk the direct slots towards `t`
    fn walk_direct<F: InodeFields>(&self, inode: &F, t: u64) -> DirectWalk {
        // Extents before the active one cannot cover `t` if `t` lies beyond it
        let (mut eoff, mut eidx) = match self.eptr {
            Some(_) if t >= self.eoff => (self.eoff, self.eidx),
            _ => (0, 0),
        };

        let mut hit = None;
        while eidx < NDIRECT {
            let ext = inode.direct(eidx);
            if ext.is_end() || t < eoff + ext.span() {
                hit = Some(ext);
                break;
            }
            eoff += ext.span();
            eidx += 1;
        }
        DirectWalk {
            eoff,
            eidx,
            hit,
            indirect: inode.indirect(),
        }
    }

    /// Complete a walk through the indirect block and adopt its result
    fn finish_walk(&mut self, walk: DirectWalk, t: u64) {
        let DirectWalk {
            mut eoff,
            mut eidx,
            hit,
            indirect,
        } = walk;
        let found = match hit {
            Some(ext) => Some((Slot::Direct(eidx), ext)),
            None => self.walk_indirect(indirect, t, &mut eoff, &mut eidx),
        };
        if !matches!(found, Some((Slot::Indirect(_), _))) {
            self.indirect = None;
        }

        self.eoff = eoff;
        self.eidx = eidx;
        self.eptr = found.map(|(slot, _)| slot);
        self.ext = found.map_or(Extent::EMPTY, |(_, ext)| ext);
    }

    /// Continue a walk through indirect block `bn`
    fn walk_indirect(
        &mut self,
        bn: BlockNum,
        t: u64,
        eoff: &mut u64,
        eidx: &mut usize,
    ) -> Option<(Slot, Extent)> {
        if bn == 0 {
            return None;
        }
        if self.indirect.as_ref().map(BcRef::blocknum) != Some(bn) {
            self.indirect = None;
            match self.ino.cache().load(bn) {
                Ok(buf) => self.indirect = buf,
                Err(err) => {
                    log::warn!(
                        "fileiter: inode {}:{} indirect block {} unavailable: {}",
                        self.ino.blocknum(),
                        self.ino.index(),
                        bn,
                        err
                    );
                    return None;
                }
            }
        }

        let buf = self.indirect.as_ref()?;
        let data = buf.read();
        while *eidx < MAXEXTENTS {
            let i = *eidx - NDIRECT;
            let ext = indirect_slot(&data, i);
            if ext.is_end() || t < *eoff + ext.span() {
                return Some((Slot::Indirect(i), ext));
            }
            *eoff += ext.span();
            *eidx += 1;
        }
        None
    }

    /// Move forward by `delta` bytes
    pub fn advance(&mut self, delta: u64) -> &mut Self {
        self.find(self.off.saturating_add(delta))
    }

    /// Move backward by `delta` bytes; stops at offset 0
    pub fn retreat(&mut self, delta: u64) -> &mut Self {
        debug_assert!(delta <= self.off, "fileiter: retreat before start of file");
        self.find(self.off.saturating_sub(delta))
    }

    /// First byte of the following extent, if the iterator is active
    fn next_offset(&self) -> Option<u64> {
        self.active().then(|| self.eoff + self.ext.span())
    }

    /// Move to the first byte of the following extent. From the last
    /// extent this leaves the iterator inactive; an inactive iterator
    /// stays where it is.
    pub fn next(&mut self) -> &mut Self {
        match self.next_offset() {
            Some(t) => self.find(t),
            None => self,
        }
    }

    /// [`next`](Self::next) while the caller holds the inode's write lock
    pub fn next_locked(&mut self, inode: &InodeViewMut<'_>) -> &mut Self {
        match self.next_offset() {
            Some(t) => self.find_locked(inode, t),
            None => self,
        }
    }

    /// Append extent `(first, count)` at end-of-file.
    ///
    /// `inode` is the caller's write lock on this iterator's inode; the
    /// end-of-file check and the table update both happen under it. The
    /// iterator must sit at end-of-file on a block boundary. On success it
    /// is positioned inside the new extent, at the same offset. An indirect
    /// block is allocated from `alloc` when the direct slots are exhausted.
    pub fn insert<A>(
        &mut self,
        inode: &mut InodeViewMut<'_>,
        alloc: &A,
        first: BlockNum,
        count: u32,
    ) -> Result<()>
    where
        A: ExtentAllocator + ?Sized,
    {
        if inode.inode() != self.ino {
            log::debug!(
                "fileiter: insert on inode {}:{} under the lock of {:?}",
                self.ino.blocknum(),
                self.ino.index(),
                inode.inode()
            );
            return Err(FsError::Invalid);
        }
        if count == 0 || block_offset(self.off) != 0 {
            log::debug!("fileiter: insert rejected at offset {} (count {})", self.off, count);
            return Err(FsError::Invalid);
        }

        // An end-of-table resolution may predate the last writer; redo it
        self.find_locked(inode, self.off);
        if self.eptr.is_none() && (NDIRECT..MAXEXTENTS).contains(&self.eidx) {
            // The walk swallows indirect load errors; surface them here
            let bn = inode.indirect();
            if bn != 0 {
                self.indirect = Some(self.ino.cache().load(bn)?.ok_or(FsError::Io)?);
                self.find_locked(inode, self.off);
            }
        }

        if self.active() || self.off != self.eoff {
            log::debug!(
                "fileiter: insert at offset {} is not end-of-file ({})",
                self.off,
                self.eoff
            );
            return Err(FsError::Invalid);
        }

        let slot = match self.eptr {
            Some(slot) => slot,
            None if self.eidx == NDIRECT => self.install_indirect(inode, alloc)?,
            None => {
                debug_assert_eq!(self.eidx, MAXEXTENTS);
                log::debug!(
                    "fileiter: inode {}:{} extent table full",
                    self.ino.blocknum(),
                    self.ino.index()
                );
                return Err(FsError::FileTooBig);
            }
        };

        let ext = Extent::new(first, count);
        match slot {
            Slot::Direct(i) => inode.set_direct(i, ext),
            Slot::Indirect(i) => {
                let buf = self.indirect.as_ref().ok_or(FsError::Invalid)?;
                let off = i * EXTENT_SIZE;
                ext.encode(&mut buf.lock_buffer()[off..off + EXTENT_SIZE]);
            }
        }
        self.eptr = Some(slot);
        self.ext = ext;
        log::trace!(
            "fileiter: inode {}:{} extent {} = [{}, +{}) at offset {}",
            self.ino.blocknum(),
            self.ino.index(),
            self.eidx,
            first,
            count,
            self.eoff
        );
        Ok(())
    }

    /// Allocate, zero and install a fresh indirect block; returns its
    /// first slot. Installation in the inode is the commit point.
    fn install_indirect<A>(&mut self, inode: &mut InodeViewMut<'_>, alloc: &A) -> Result<Slot>
    where
        A: ExtentAllocator + ?Sized,
    {
        if inode.indirect() != 0 {
            log::warn!(
                "fileiter: inode {}:{} already has indirect block {}",
                self.ino.blocknum(),
                self.ino.index(),
                inode.indirect()
            );
            return Err(FsError::Invalid);
        }

        let bn = alloc.allocate_extent(1)?;
        let loaded = self
            .ino
            .cache()
            .load(bn)
            .and_then(|buf| buf.ok_or(FsError::Invalid));
        let buf = match loaded {
            Ok(buf) => buf,
            Err(err) => {
                if let Err(free_err) = alloc.free_extent(bn, 1) {
                    log::warn!("fileiter: leaked indirect block {}: {}", bn, free_err);
                }
                return Err(err);
            }
        };
        buf.lock_buffer().fill(0);
        inode.set_indirect(bn);
        log::debug!(
            "fileiter: inode {}:{} indirect extent block {}",
            self.ino.blocknum(),
            self.ino.index(),
            bn
        );

        self.indirect = Some(buf);
        Ok(Slot::Indirect(0))
    }
}

impl AddAssign<i64> for FileIter<'_, '_> {
    fn add_assign(&mut self, delta: i64) {
        if delta >= 0 {
            self.advance(delta as u64);
        } else {
            self.retreat(delta.unsigned_abs());
        }
    }
}

impl SubAssign<i64> for FileIter<'_, '_> {
    fn sub_assign(&mut self, delta: i64) {
        if delta >= 0 {
            self.retreat(delta as u64);
        } else {
            self.advance(delta.unsigned_abs());
        }
    }
}

impl fmt::Debug for FileIter<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileIter")
            .field("inode", self.ino)
            .field("off", &self.off)
            .field("eoff", &self.eoff)
            .field("eidx", &self.eidx)
            .field("extent", &self.extent())
            .field("indirect", &self.indirect.as_ref().map(BcRef::blocknum))
            .finish()
    }
}
