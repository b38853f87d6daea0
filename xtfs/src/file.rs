//! Byte-level file access on top of [`FileIter`]

use xtfs_api::*;

use crate::extent_alloc::ExtentAllocator;
use crate::fileiter::FileIter;
use crate::inode::{InodeFields, InodeRef, InodeViewMut};

const B: u64 = BLOCKSIZE as u64;

#[inline]
fn block_round_up(off: u64) -> u64 {
    block_round_down(off + B - 1)
}

/// Read from `ino` at `off` into `buf`. Returns the number of bytes read,
/// which is short only at end of file. Holes read as zeros.
pub fn read_at(ino: &InodeRef<'_>, off: u64, buf: &mut [u8]) -> Result<usize> {
    let size = ino.view().size() as u64;
    if off >= size {
        return Ok(0);
    }
    let n = (size - off).min(buf.len() as u64) as usize;

    let mut it = FileIter::new(ino, off);
    let mut done = 0;
    while done < n {
        it.find(off + done as u64);
        let brel = it.block_relative_offset();
        let chunk = (BLOCKSIZE - brel).min(n - done);
        let dst = &mut buf[done..done + chunk];
        match it.load()? {
            Some(block) => dst.copy_from_slice(&block.read()[brel..brel + chunk]),
            None => dst.fill(0),
        }
        done += chunk;
    }
    Ok(n)
}

/// Write `data` to `ino` at `off`, growing the file as needed.
///
/// Existing blocks are overwritten in place; the range below the current
/// end of the extent table must not contain holes. New blocks come from
/// `alloc` one at a time. A gap between the old end of file and `off` reads
/// back as zeros. The inode's write lock is held for the whole request, so
/// concurrent writers to one inode are serialized.
pub fn write_at<A>(alloc: &A, ino: &InodeRef<'_>, off: u64, data: &[u8]) -> Result<usize>
where
    A: ExtentAllocator + ?Sized,
{
    if data.is_empty() {
        return Ok(0);
    }
    let end = off
        .checked_add(data.len() as u64)
        .filter(|&end| end <= u32::MAX as u64)
        .ok_or(FsError::FileTooBig)?;

    let mut it = FileIter::new(ino, off);
    let mut inode = ino.lock();
    let size = inode.size() as u64;

    it.find_locked(&inode, off);
    while it.active() && it.offset() < end {
        if it.empty() {
            log::debug!("file: write at {} crosses a hole at {}", off, it.offset());
            return Err(FsError::Invalid);
        }
        it.next_locked(&inode);
    }

    if off > size {
        zero_tail(&mut it, &inode, size, off)?;
    }
    grow(&mut it, &mut inode, alloc, off, end)?;

    let mut done = 0;
    while done < data.len() {
        it.find_locked(&inode, off + done as u64);
        let brel = it.block_relative_offset();
        let chunk = (BLOCKSIZE - brel).min(data.len() - done);
        let block = it.load()?.ok_or(FsError::Invalid)?;
        block.lock_buffer()[brel..brel + chunk].copy_from_slice(&data[done..done + chunk]);
        done += chunk;
    }

    if end > size {
        inode.set_size(end as u32);
    }
    Ok(data.len())
}

/// Clear stale bytes past the old size in the last block of the file
fn zero_tail(it: &mut FileIter<'_, '_>, inode: &InodeViewMut<'_>, size: u64, off: u64) -> Result<()> {
    if block_offset(size) == 0 {
        return Ok(());
    }
    it.find_locked(inode, size);
    if let Some(block) = it.load()? {
        let stop = if block_round_down(off) == block_round_down(size) {
            block_offset(off)
        } else {
            BLOCKSIZE
        };
        block.lock_buffer()[block_offset(size)..stop].fill(0);
    }
    Ok(())
}

/// Extend the extent table to cover `[0, end)`
fn grow<A>(
    it: &mut FileIter<'_, '_>,
    inode: &mut InodeViewMut<'_>,
    alloc: &A,
    off: u64,
    end: u64,
) -> Result<()>
where
    A: ExtentAllocator + ?Sized,
{
    it.find_locked(inode, u64::MAX);
    let mut tend = it.extent_offset();

    let gap_end = block_round_down(off);
    if tend < gap_end {
        it.find_locked(inode, tend);
        it.insert(inode, alloc, 0, ((gap_end - tend) >> BLOCKSHIFT) as u32)?;
        tend = gap_end;
    }

    while tend < block_round_up(end) {
        let bn = alloc.allocate_extent(1)?;
        if let Err(err) = append_block(it, inode, alloc, bn, tend) {
            if let Err(free_err) = alloc.free_extent(bn, 1) {
                log::warn!("file: leaked block {}: {}", bn, free_err);
            }
            return Err(err);
        }
        tend += B;
    }
    Ok(())
}

fn append_block<A>(
    it: &mut FileIter<'_, '_>,
    inode: &mut InodeViewMut<'_>,
    alloc: &A,
    bn: BlockNum,
    at: u64,
) -> Result<()>
where
    A: ExtentAllocator + ?Sized,
{
    let block = it.inode().cache().load(bn)?.ok_or(FsError::Invalid)?;
    block.lock_buffer().fill(0);
    it.find_locked(inode, at);
    it.insert(inode, alloc, bn, 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bufcache::BufCache;
    use crate::config::{AllocatorConfig, BufCacheConfig};
    use crate::drivers::RamDisk;
    use crate::extent_alloc::BitmapAllocator;
    use alloc::boxed::Box;
    use alloc::vec;

    fn setup() -> (BufCache, BitmapAllocator) {
        let bc = BufCache::new(Box::new(RamDisk::new(128)), BufCacheConfig::with_nbuf(16)).unwrap();
        let alloc = BitmapAllocator::new(AllocatorConfig::new(128, 8)).unwrap();
        (bc, alloc)
    }

    #[test]
    fn test_write_then_read_across_blocks() {
        let (bc, alloc) = setup();
        let ino = InodeRef::load(&bc, 1, 0).unwrap();
        let data: alloc::vec::Vec<u8> = (0..10000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(write_at(&alloc, &ino, 0, &data).unwrap(), data.len());
        assert_eq!(ino.view().size(), 10000);
        assert_eq!(alloc.free_blocks(), 120 - 3);

        let mut out = vec![0u8; 12000];
        assert_eq!(read_at(&ino, 0, &mut out).unwrap(), 10000);
        assert_eq!(&out[..10000], &data[..]);

        // Overwrite in place without allocating
        write_at(&alloc, &ino, 4090, &[0xee; 10]).unwrap();
        assert_eq!(alloc.free_blocks(), 117);
        read_at(&ino, 4090, &mut out[..10]).unwrap();
        assert_eq!(&out[..10], &[0xee; 10]);
    }

    #[test]
    fn test_write_past_end_leaves_zeroed_gap() {
        let (bc, alloc) = setup();
        let ino = InodeRef::load(&bc, 1, 0).unwrap();
        write_at(&alloc, &ino, 0, b"head").unwrap();
        write_at(&alloc, &ino, 3 * B + 10, b"tail").unwrap();
        assert_eq!(ino.view().size() as u64, 3 * B + 14);
        // One data block, one hole of two blocks, one data block
        assert!(ino.view().direct(1).is_hole());
        assert_eq!(ino.view().direct(1).count, 2);

        let mut out = vec![0xffu8; 3 * BLOCKSIZE + 14];
        assert_eq!(read_at(&ino, 0, &mut out).unwrap(), out.len());
        assert_eq!(&out[..4], b"head");
        assert!(out[4..3 * BLOCKSIZE + 10].iter().all(|&b| b == 0));
        assert_eq!(&out[3 * BLOCKSIZE + 10..], b"tail");
    }

    #[test]
    fn test_write_into_hole_rejected() {
        let (bc, alloc) = setup();
        let ino = InodeRef::load(&bc, 1, 0).unwrap();
        write_at(&alloc, &ino, 2 * B, b"x").unwrap();
        assert_eq!(write_at(&alloc, &ino, 100, b"y"), Err(FsError::Invalid));
        assert_eq!(ino.view().size() as u64, 2 * B + 1);
    }

    #[test]
    fn test_read_past_end_and_size_limit() {
        let (bc, alloc) = setup();
        let ino = InodeRef::load(&bc, 1, 0).unwrap();
        let mut out = [0u8; 8];
        assert_eq!(read_at(&ino, 0, &mut out).unwrap(), 0);
        assert_eq!(write_at(&alloc, &ino, u32::MAX as u64, b"z"), Err(FsError::FileTooBig));
        assert_eq!(write_at(&alloc, &ino, 0, &[]).unwrap(), 0);
    }

    #[cfg(feature = "std")]
    #[test]
    fn test_concurrent_appends_keep_every_byte() {
        let (bc, alloc) = setup();
        let ino = InodeRef::load(&bc, 1, 0).unwrap();
        const WRITERS: u8 = 4;
        const ROUNDS: usize = 6;

        std::thread::scope(|s| {
            for t in 0..WRITERS {
                let (ino, alloc) = (&ino, &alloc);
                s.spawn(move || {
                    for _ in 0..ROUNDS {
                        // Lands past the end or over a block another writer appended
                        let size = ino.view().size() as u64;
                        write_at(alloc, ino, size, &[t + 1; BLOCKSIZE]).unwrap();
                    }
                });
            }
        });

        let size = ino.view().size() as usize;
        assert_eq!(size % BLOCKSIZE, 0);
        let mut out = vec![0u8; size];
        assert_eq!(read_at(&ino, 0, &mut out).unwrap(), size);
        for block in out.chunks(BLOCKSIZE) {
            assert!((1..=WRITERS).contains(&block[0]));
            assert!(block.iter().all(|&b| b == block[0]));
        }
        // Data blocks plus the indirect extent block
        assert_eq!(alloc.free_blocks() as usize, 120 - size / BLOCKSIZE - 1);
    }
}
