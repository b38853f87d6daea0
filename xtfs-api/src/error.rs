//! Error handling for the XTFS filesystem core

use core::fmt;

/// POSIX error numbers surfaced by the filesystem core
pub mod errno {
    /// I/O error
    pub const EIO: i32 = 5;
    /// Out of memory
    pub const ENOMEM: i32 = 12;
    /// Invalid argument
    pub const EINVAL: i32 = 22;
    /// File too large
    pub const EFBIG: i32 = 27;
    /// No space left on device
    pub const ENOSPC: i32 = 28;
}

/// Error type shared by the block cache, allocator and file iterator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsError {
    /// Block device read or write failed
    Io,
    /// The extent allocator has no free run of the requested length
    NoSpace,
    /// Every block cache slot is pinned
    NoMemory,
    /// Caller precondition violated
    Invalid,
    /// The extent table is full
    FileTooBig,
}

impl FsError {
    /// POSIX errno for this error (positive)
    pub const fn errno(self) -> i32 {
        match self {
            FsError::Io => errno::EIO,
            FsError::NoSpace => errno::ENOSPC,
            FsError::NoMemory => errno::ENOMEM,
            FsError::Invalid => errno::EINVAL,
            FsError::FileTooBig => errno::EFBIG,
        }
    }

    /// Negative return code, as handed back across the syscall boundary
    #[inline]
    pub const fn to_neg_errno(self) -> isize {
        -(self.errno() as isize)
    }

    /// Map a positive errno back to an error, if it is one of ours
    pub const fn from_errno(code: i32) -> Option<Self> {
        match code {
            errno::EIO => Some(FsError::Io),
            errno::ENOSPC => Some(FsError::NoSpace),
            errno::ENOMEM => Some(FsError::NoMemory),
            errno::EINVAL => Some(FsError::Invalid),
            errno::EFBIG => Some(FsError::FileTooBig),
            _ => None,
        }
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsError::Io => write!(f, "Input/output error"),
            FsError::NoSpace => write!(f, "No space left on device"),
            FsError::NoMemory => write!(f, "Buffer cache exhausted"),
            FsError::Invalid => write!(f, "Invalid argument"),
            FsError::FileTooBig => write!(f, "File too large"),
        }
    }
}

/// Result type for filesystem operations
pub type Result<T> = core::result::Result<T, FsError>;

/// Collapse a result into the kernel's integer return convention:
/// non-negative value on success, negative errno on failure.
pub fn result_to_raw(result: Result<usize>) -> isize {
    match result {
        Ok(value) => value as isize,
        Err(error) => error.to_neg_errno(),
    }
}
