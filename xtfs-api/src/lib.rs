//! XTFS API - Shared types for the XTFS extent filesystem
//!
//! This crate holds the pieces of the filesystem that every layer agrees on:
//! the on-disk layout constants, block numbers and extent descriptors with
//! their little-endian codecs, and the error type returned by every fallible
//! operation.
//!
//! # Layout
//!
//! - **Types**: block numbers, extent descriptors, layout constants
//! - **Error**: `FsError`, `Result` and errno mapping
//!
//! # Usage
//!
//! ```rust
//! use xtfs_api::{Extent, BLOCKSIZE};
//!
//! let ext = Extent::new(100, 2);
//! assert_eq!(ext.span(), 2 * BLOCKSIZE as u64);
//! assert!(!ext.is_hole());
//! ```

#![no_std]

#[cfg(feature = "std")]
extern crate std;

pub mod error;
pub mod types;

pub use crate::error::{FsError, Result};
pub use crate::types::*;
