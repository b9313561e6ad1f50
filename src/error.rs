//! Error kinds surfaced to the kernel.

use std::fmt;

use libc::c_int;

use crate::db::DbError;

/// A failed file system operation, one variant per POSIX status the driver
/// can report. Database failures that survive the retry policy collapse
/// into [`FsError::Io`] with the server's message attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    /// Path resolution failed or the referenced file id is absent.
    NotFound,
    /// A query failed after retries, or a result set was malformed.
    Io(String),
    /// Unsupported rename flags, readlink on a non-symlink, and similar.
    InvalidArgument,
    /// An attempt to alter or delete a protected inode.
    PermissionDenied,
    /// Rename-noreplace into an occupied name.
    Exists,
    /// rmdir on a directory that still has children.
    NotEmpty,
    /// The open-handle table is full.
    OutOfHandles,
}

impl FsError {
    /// The errno handed back to the kernel.
    pub fn errno(&self) -> c_int {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::Io(_) => libc::EIO,
            FsError::InvalidArgument => libc::EINVAL,
            FsError::PermissionDenied => libc::EPERM,
            FsError::Exists => libc::EEXIST,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::OutOfHandles => libc::EMFILE,
        }
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsError::NotFound => write!(f, "not found"),
            FsError::Io(message) => write!(f, "{message}"),
            FsError::InvalidArgument => write!(f, "invalid argument"),
            FsError::PermissionDenied => write!(f, "permission denied"),
            FsError::Exists => write!(f, "already exists"),
            FsError::NotEmpty => write!(f, "not empty"),
            FsError::OutOfHandles => write!(f, "too many open files"),
        }
    }
}

impl std::error::Error for FsError {}

impl From<DbError> for FsError {
    fn from(err: DbError) -> FsError {
        FsError::Io(err.message().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(FsError::NotFound.errno(), libc::ENOENT);
        assert_eq!(FsError::Io(String::new()).errno(), libc::EIO);
        assert_eq!(FsError::InvalidArgument.errno(), libc::EINVAL);
        assert_eq!(FsError::PermissionDenied.errno(), libc::EPERM);
        assert_eq!(FsError::Exists.errno(), libc::EEXIST);
        assert_eq!(FsError::NotEmpty.errno(), libc::ENOTEMPTY);
        assert_eq!(FsError::OutOfHandles.errno(), libc::EMFILE);
    }
}
