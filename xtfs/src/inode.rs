//! Inode view
//!
//! An inode is a 64-byte record inside an inode block. [`InodeRef`] pins
//! that block in the cache and names the record; [`InodeView`] and
//! [`InodeViewMut`] project typed fields out of the bytes while the buffer
//! is read-locked or write-locked respectively.
//!
//! Structural changes to an inode (its extent table) happen only through
//! `InodeViewMut`, i.e. under the inode buffer's write lock. That lock also
//! serves as the inode's writer lock: a writer takes it once with
//! [`InodeRef::lock`] and keeps it across the whole change.

use core::fmt;

use xtfs_api::*;

use crate::bufcache::{BcRef, BufCache, BufReadGuard, BufWriteGuard};

/// Caller-held reference to an on-disk inode
pub struct InodeRef<'c> {
    buf: BcRef<'c>,
    index: usize,
}

impl<'c> InodeRef<'c> {
    /// Inode `index` within the block held by `buf`
    pub fn new(buf: BcRef<'c>, index: usize) -> Result<Self> {
        if index >= INODES_PER_BLOCK {
            return Err(FsError::Invalid);
        }
        Ok(Self { buf, index })
    }

    /// Load inode block `bn` and reference inode `index` within it
    pub fn load(cache: &'c BufCache, bn: BlockNum, index: usize) -> Result<Self> {
        let buf = cache.load(bn)?.ok_or(FsError::Invalid)?;
        Self::new(buf, index)
    }

    /// Block holding this inode
    pub fn blocknum(&self) -> BlockNum {
        self.buf.blocknum()
    }

    /// Slot of this inode within its block
    pub fn index(&self) -> usize {
        self.index
    }

    /// The pinned inode block
    pub fn buffer(&self) -> &BcRef<'c> {
        &self.buf
    }

    pub fn cache(&self) -> &'c BufCache {
        self.buf.cache()
    }

    fn offset(&self) -> usize {
        self.index * INODE_SIZE
    }

    /// Read-only projection
    pub fn view(&self) -> InodeView<'_> {
        InodeView {
            guard: self.buf.read(),
            off: self.offset(),
        }
    }

    /// Writable projection; holds the inode buffer's write lock until
    /// dropped. Not reentrant: a thread holding it must not call `view` or
    /// `lock` on the same inode block.
    pub fn lock(&self) -> InodeViewMut<'_> {
        InodeViewMut {
            ino: self,
            guard: self.buf.lock_buffer(),
        }
    }
}

impl PartialEq for InodeRef<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.buf == other.buf && self.index == other.index
    }
}

impl Eq for InodeRef<'_> {}

impl fmt::Debug for InodeRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InodeRef")
            .field("block", &self.blocknum())
            .field("index", &self.index)
            .finish()
    }
}

/// Typed field access shared by both projections
pub trait InodeFields {
    /// The inode's `INODE_SIZE` bytes
    fn raw(&self) -> &[u8];

    /// File size in bytes
    fn size(&self) -> u32 {
        read_u32(self.raw(), INODE_SIZE_OFF)
    }

    fn file_type(&self) -> FileType {
        FileType::from(read_u32(self.raw(), INODE_TYPE_OFF))
    }

    fn nlink(&self) -> u32 {
        read_u32(self.raw(), INODE_NLINK_OFF)
    }

    /// Direct extent `i` (`i < NDIRECT`)
    fn direct(&self, i: usize) -> Extent {
        debug_assert!(i < NDIRECT);
        let off = INODE_DIRECT_OFF + i * EXTENT_SIZE;
        Extent::decode(&self.raw()[off..off + EXTENT_SIZE])
    }

    /// Indirect-extent block number, 0 if none
    fn indirect(&self) -> BlockNum {
        read_u32(self.raw(), INODE_INDIRECT_OFF)
    }
}

/// Read-locked inode
pub struct InodeView<'a> {
    guard: BufReadGuard<'a>,
    off: usize,
}

impl InodeFields for InodeView<'_> {
    fn raw(&self) -> &[u8] {
        &self.guard[self.off..self.off + INODE_SIZE]
    }
}

/// Write-locked inode
pub struct InodeViewMut<'a> {
    ino: &'a InodeRef<'a>,
    guard: BufWriteGuard<'a>,
}

impl InodeFields for InodeViewMut<'_> {
    fn raw(&self) -> &[u8] {
        let off = self.ino.offset();
        &self.guard[off..off + INODE_SIZE]
    }
}

impl<'a> InodeViewMut<'a> {
    /// The inode this lock covers
    pub fn inode(&self) -> &'a InodeRef<'a> {
        self.ino
    }

    fn raw_mut(&mut self) -> &mut [u8] {
        let off = self.ino.offset();
        &mut self.guard[off..off + INODE_SIZE]
    }

    pub fn set_size(&mut self, size: u32) {
        write_u32(self.raw_mut(), INODE_SIZE_OFF, size);
    }

    pub fn set_file_type(&mut self, ftype: FileType) {
        write_u32(self.raw_mut(), INODE_TYPE_OFF, ftype as u32);
    }

    pub fn set_nlink(&mut self, nlink: u32) {
        write_u32(self.raw_mut(), INODE_NLINK_OFF, nlink);
    }

    pub fn set_direct(&mut self, i: usize, ext: Extent) {
        debug_assert!(i < NDIRECT);
        let off = INODE_DIRECT_OFF + i * EXTENT_SIZE;
        ext.encode(&mut self.raw_mut()[off..off + EXTENT_SIZE]);
    }

    pub fn set_indirect(&mut self, bn: BlockNum) {
        write_u32(self.raw_mut(), INODE_INDIRECT_OFF, bn);
    }

    /// Zero the whole record
    pub fn clear(&mut self) {
        self.raw_mut().fill(0);
    }

    /// Release the write lock
    pub fn unlock(self) {
        drop(self);
    }
}
