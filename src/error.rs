//! Error kinds surfaced to the kernel as POSIX errno-equivalents (spec §7).

use thiserror::Error;

/// Everything that can go wrong while servicing a filesystem request.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such inode or directory entry")]
    NotFound,

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("virtual filesystem size exceeded")]
    NoSpace,

    #[error("backend I/O error: {0}")]
    Io(String),

    #[error("corrupt on-disk record: {0}")]
    Corrupt(&'static str),

    #[error("unsupported operation")]
    Unsupported,
}

impl FsError {
    /// The errno this error kind maps to when reported back to the kernel.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::NotDirectory => libc::ENOTDIR,
            FsError::IsDirectory => libc::EISDIR,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::NoSpace => libc::ENOSPC,
            FsError::Io(_) => libc::EIO,
            FsError::Corrupt(_) => libc::EIO,
            FsError::Unsupported => libc::ENOSYS,
        }
    }
}

impl From<redis::RedisError> for FsError {
    fn from(e: redis::RedisError) -> Self {
        FsError::Io(e.to_string())
    }
}
