//! API crate tests

use xtfs_api::error::{errno, result_to_raw};
use xtfs_api::*;

#[test]
fn test_error_display() {
    assert_eq!(FsError::Io.to_string(), "Input/output error");
    assert_eq!(FsError::FileTooBig.to_string(), "File too large");
    assert_eq!(FsError::NoSpace.errno(), errno::ENOSPC);
}

#[test]
fn test_inode_fields_fit() {
    // The indirect block number is the last field before the reserved tail.
    assert!(INODE_DIRECT_OFF >= INODE_NLINK_OFF + 4);
    assert_eq!(INODE_INDIRECT_OFF - INODE_DIRECT_OFF, NDIRECT * EXTENT_SIZE);
    assert!(INODE_INDIRECT_OFF + 4 <= INODE_SIZE);
}

#[test]
fn test_table_of_extents_roundtrip_in_block() {
    let mut block = vec![0u8; BLOCKSIZE];
    for i in 0..NINDIRECT {
        let off = i * EXTENT_SIZE;
        Extent::new(1000 + i as u32, 1).encode(&mut block[off..off + EXTENT_SIZE]);
    }
    let last = Extent::decode(&block[(NINDIRECT - 1) * EXTENT_SIZE..]);
    assert_eq!(last, Extent::new(1000 + NINDIRECT as u32 - 1, 1));
}

#[test]
fn test_u32_helpers() {
    let mut buf = [0u8; 8];
    write_u32(&mut buf, 4, 0xdead_beef);
    assert_eq!(read_u32(&buf, 4), 0xdead_beef);
    assert_eq!(read_u32(&buf, 0), 0);
}

#[test]
fn test_file_type_from_raw() {
    assert_eq!(FileType::from(1), FileType::Regular);
    assert_eq!(FileType::from(2), FileType::Directory);
    assert_eq!(FileType::from(99), FileType::Free);
}

#[test]
fn test_raw_result() {
    assert_eq!(result_to_raw(Err(FsError::Invalid)), -(errno::EINVAL as isize));
}
