//! On-disk layout of XTFS
//!
//! All multi-byte fields are little-endian. A block number of 0 never names
//! real storage: in an extent it marks a hole, in the inode's indirect slot it
//! means "no indirect block".

use static_assertions::const_assert;
use static_assertions::const_assert_eq;

/// Disk block number
pub type BlockNum = u32;

/// Block size in bytes
pub const BLOCKSIZE: usize = 4096;

/// log2(BLOCKSIZE)
pub const BLOCKSHIFT: u32 = 12;

/// Size of one encoded extent descriptor
pub const EXTENT_SIZE: usize = 8;

/// Extent descriptors stored inline in the inode
pub const NDIRECT: usize = 5;

/// Extent descriptors in the indirect-extent block
pub const NINDIRECT: usize = BLOCKSIZE / EXTENT_SIZE;

/// Longest possible extent table
pub const MAXEXTENTS: usize = NDIRECT + NINDIRECT;

/// Size of an on-disk inode
pub const INODE_SIZE: usize = 64;

/// Inodes per block
pub const INODES_PER_BLOCK: usize = BLOCKSIZE / INODE_SIZE;

// Inode field offsets
pub const INODE_SIZE_OFF: usize = 0;
pub const INODE_TYPE_OFF: usize = 4;
pub const INODE_NLINK_OFF: usize = 8;
pub const INODE_DIRECT_OFF: usize = 16;
pub const INODE_INDIRECT_OFF: usize = INODE_DIRECT_OFF + NDIRECT * EXTENT_SIZE;

const_assert_eq!(1usize << BLOCKSHIFT, BLOCKSIZE);
const_assert!(BLOCKSIZE.is_power_of_two());
const_assert!(INODE_INDIRECT_OFF + 4 <= INODE_SIZE);
const_assert_eq!(BLOCKSIZE % INODE_SIZE, 0);
const_assert_eq!(NINDIRECT * EXTENT_SIZE, BLOCKSIZE);

/// Extent descriptor: `count` consecutive blocks starting at `first`
///
/// `count == 0` marks an unused slot and terminates the table.
/// `first == 0` with `count > 0` is a hole.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Extent {
    pub first: BlockNum,
    pub count: u32,
}

impl Extent {
    /// The end-of-table sentinel
    pub const EMPTY: Extent = Extent { first: 0, count: 0 };

    pub const fn new(first: BlockNum, count: u32) -> Self {
        Self { first, count }
    }

    /// A hole of `count` blocks
    pub const fn hole(count: u32) -> Self {
        Self { first: 0, count }
    }

    /// True for an unused slot (end of table)
    #[inline]
    pub const fn is_end(&self) -> bool {
        self.count == 0
    }

    /// True if the extent is present but has no backing blocks
    #[inline]
    pub const fn is_hole(&self) -> bool {
        self.first == 0 && self.count != 0
    }

    /// Number of file bytes covered by this extent
    #[inline]
    pub const fn span(&self) -> u64 {
        (self.count as u64) << BLOCKSHIFT
    }

    /// Decode from the first `EXTENT_SIZE` bytes of `buf`
    pub fn decode(buf: &[u8]) -> Self {
        Self {
            first: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            count: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }

    /// Encode into the first `EXTENT_SIZE` bytes of `buf`
    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.first.to_le_bytes());
        buf[4..8].copy_from_slice(&self.count.to_le_bytes());
    }
}

/// Inode file type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum FileType {
    #[default]
    Free = 0,
    Regular = 1,
    Directory = 2,
}

impl From<u32> for FileType {
    fn from(v: u32) -> Self {
        match v {
            1 => Self::Regular,
            2 => Self::Directory,
            _ => Self::Free,
        }
    }
}

/// Read a little-endian u32 at `off`
#[inline]
pub fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// Write a little-endian u32 at `off`
#[inline]
pub fn write_u32(buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

/// Byte offset of the block containing file offset `off`
#[inline]
pub const fn block_round_down(off: u64) -> u64 {
    off & !((BLOCKSIZE as u64) - 1)
}

/// Offset of `off` within its block
#[inline]
pub const fn block_offset(off: u64) -> usize {
    (off & ((BLOCKSIZE as u64) - 1)) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extent_codec() {
        let mut buf = [0u8; EXTENT_SIZE];
        Extent::new(0x0102_0304, 7).encode(&mut buf);
        assert_eq!(buf, [4, 3, 2, 1, 7, 0, 0, 0]);
        assert_eq!(Extent::decode(&buf), Extent::new(0x0102_0304, 7));
    }

    #[test]
    fn test_extent_kinds() {
        assert!(Extent::EMPTY.is_end());
        assert!(!Extent::EMPTY.is_hole());
        assert!(Extent::hole(3).is_hole());
        assert!(!Extent::new(10, 1).is_hole());
        assert_eq!(Extent::hole(3).span(), 3 * BLOCKSIZE as u64);
    }

    #[test]
    fn test_inode_layout() {
        assert_eq!(INODE_INDIRECT_OFF, 56);
        assert_eq!(INODES_PER_BLOCK, 64);
        assert_eq!(NINDIRECT, 512);
    }

    #[test]
    fn test_block_math() {
        assert_eq!(block_round_down(4097), 4096);
        assert_eq!(block_offset(4097), 1);
        assert_eq!(block_offset(8192), 0);
    }
}
