//! XTFS - extent-based file storage core
//!
//! This crate provides the pieces of the filesystem that sit between a block
//! device and file-level reads and writes:
//!
//! - **Block cache**: reference-counted buffers keyed by block number
//! - **Inode view**: typed access to an on-disk inode and its extent table
//! - **Extent allocator**: contiguous runs of free blocks
//! - **File iterator**: offset to extent/block resolution and table growth
//!
//! # Usage
//!
//! ```rust
//! use xtfs::{BitmapAllocator, BufCache, FileIter, InodeRef, RamDisk};
//! use xtfs::config::{AllocatorConfig, BufCacheConfig};
//!
//! let cache = BufCache::new(Box::new(RamDisk::new(64)), BufCacheConfig::default()).unwrap();
//! let alloc = BitmapAllocator::new(AllocatorConfig::new(64, 4)).unwrap();
//! let ino = InodeRef::load(&cache, 1, 0).unwrap();
//!
//! let mut it = FileIter::new(&ino, 0);
//! it.insert(&mut ino.lock(), &alloc, 10, 2).unwrap();
//! it.find(4096);
//! assert_eq!(it.blocknum(), 11);
//! ```

#![no_std]
#![warn(clippy::all)]

#[cfg(feature = "std")]
extern crate std;

extern crate alloc;

pub mod bufcache;
pub mod config;
pub mod cpu;
pub mod drivers;
pub mod extent_alloc;
pub mod file;
pub mod fileiter;
pub mod inode;
pub mod sync;

pub use xtfs_api;
pub use xtfs_api::{BlockNum, Extent, FileType, FsError, Result};

pub use bufcache::{BcRef, BufCache, BufFlags, CacheStats};
pub use drivers::{BlockDevice, RamDisk};
pub use extent_alloc::{BitmapAllocator, ExtentAllocator};
pub use fileiter::{FileIter, IterState};
pub use inode::{InodeFields, InodeRef, InodeView, InodeViewMut};
pub use sync::{SpinLock, SpinLockGuard};
