//! Error types for the quota filesystem.
//!
//! Four error classes exist and never mix:
//!
//! - Native filesystem errors travel as `std::io::Error` and keep their errno.
//! - [`QuotaError`] is the quota guard's policy denial, surfaced as `EDQUOT`.
//! - [`RemoteStoreError`] stays inside the usage sync task.
//! - [`ConfigError`] is fatal at startup.

use std::io;
use std::path::PathBuf;

use snafu::Snafu;

use crate::quota::GatedOp;

/// Denial returned by the quota guard.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(visibility(pub))]
pub enum QuotaError {
    /// The cached usage estimate leaves no room for the operation.
    #[snafu(display(
        "disk quota exceeded: {operation} needs {requested_bytes} bytes, usage estimate {usage_bytes} of {limit_bytes}"
    ))]
    Exceeded {
        /// Operation that was denied.
        operation: GatedOp,
        /// Bytes the operation would add (0 for entry creation).
        requested_bytes: u64,
        /// Usage estimate the decision was based on.
        usage_bytes: u64,
        /// Configured limit.
        limit_bytes: u64,
    },
}

impl From<QuotaError> for io::Error {
    fn from(_: QuotaError) -> Self {
        io::Error::from_raw_os_error(libc::EDQUOT)
    }
}

/// Errors talking to the remote counter store.
///
/// These never reach a filesystem caller; the sync task logs them and waits for
/// the next tick.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
#[allow(missing_docs)] // Snafu errors are documented via display attributes
pub enum RemoteStoreError {
    #[snafu(display("invalid counter store address {host}:{port}: {source}"))]
    InvalidAddress {
        host: String,
        port: u16,
        source: redis::RedisError,
    },

    #[snafu(display("failed to connect to counter store: {source}"))]
    Connect { source: redis::RedisError },

    #[snafu(display("counter store {operation} timed out after {timeout_ms}ms"))]
    Timeout { operation: &'static str, timeout_ms: u64 },

    #[snafu(display("counter store rejected {command}: {source}"))]
    Command {
        command: &'static str,
        source: redis::RedisError,
    },

    #[snafu(display("counter store unavailable: {reason}"))]
    Unavailable { reason: String },
}

/// Startup configuration errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
#[allow(missing_docs)] // Snafu errors are documented via display attributes
pub enum ConfigError {
    #[snafu(display("cannot resolve root directory {}: {source}", path.display()))]
    RootDir { path: PathBuf, source: io::Error },

    #[snafu(display("root {} is not a directory", path.display()))]
    RootNotDirectory { path: PathBuf },

    #[snafu(display("invalid {field} '{value}': must be non-empty and contain no whitespace"))]
    InvalidIdentity { field: &'static str, value: String },

    #[snafu(display("wrong quota {quota_mib}: does not fit in bytes"))]
    QuotaOverflow { quota_mib: u64 },

    #[snafu(display("wrong counter store port 0"))]
    InvalidPort,
}

/// Map an `io::ErrorKind` onto the errno reported to the kernel.
///
/// Used for errors that were not produced by a syscall and therefore carry no
/// raw OS error.
pub fn errno_for_kind(kind: io::ErrorKind) -> i32 {
    use io::ErrorKind;

    match kind {
        ErrorKind::NotFound => libc::ENOENT,
        ErrorKind::PermissionDenied => libc::EACCES,
        ErrorKind::AlreadyExists => libc::EEXIST,
        ErrorKind::InvalidInput | ErrorKind::InvalidData => libc::EINVAL,
        ErrorKind::NotADirectory => libc::ENOTDIR,
        ErrorKind::IsADirectory => libc::EISDIR,
        ErrorKind::DirectoryNotEmpty => libc::ENOTEMPTY,
        ErrorKind::ReadOnlyFilesystem => libc::EROFS,
        ErrorKind::StorageFull => libc::ENOSPC,
        ErrorKind::FileTooLarge => libc::EFBIG,
        ErrorKind::ResourceBusy => libc::EBUSY,
        ErrorKind::TooManyLinks => libc::EMLINK,
        ErrorKind::Interrupted => libc::EINTR,
        ErrorKind::WouldBlock => libc::EAGAIN,
        ErrorKind::TimedOut => libc::ETIMEDOUT,
        ErrorKind::Unsupported => libc::EOPNOTSUPP,
        ErrorKind::OutOfMemory => libc::ENOMEM,
        _ => libc::EIO,
    }
}

/// Errno for any `io::Error`: the native code when present, the table otherwise.
pub fn errno_for(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or_else(|| errno_for_kind(err.kind()))
}

/// Normalize an error so the FUSE server replies with a meaningful errno.
///
/// fuse-backend-rs answers `EIO` for any error without a raw OS code.
pub fn to_fuse_error(err: io::Error) -> io::Error {
    if err.raw_os_error().is_some() {
        err
    } else {
        io::Error::from_raw_os_error(errno_for_kind(err.kind()))
    }
}

/// Shorthand for an `io::Error` carrying `errno`.
pub(crate) fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_errno_passes_through() {
        let err = io::Error::from_raw_os_error(libc::ENOSPC);
        assert_eq!(errno_for(&err), libc::ENOSPC);
        assert_eq!(to_fuse_error(err).raw_os_error(), Some(libc::ENOSPC));
    }

    #[test]
    fn test_kind_only_errors_are_mapped() {
        let err = io::Error::new(io::ErrorKind::NotFound, "inode not found");
        assert_eq!(to_fuse_error(err).raw_os_error(), Some(libc::ENOENT));

        let err = io::Error::new(io::ErrorKind::InvalidInput, "invalid name");
        assert_eq!(errno_for(&err), libc::EINVAL);

        let err = io::Error::other("lock poisoned");
        assert_eq!(errno_for(&err), libc::EIO);
    }

    #[test]
    fn test_quota_denial_is_edquot_not_enospc() {
        let err: io::Error = QuotaError::Exceeded {
            operation: GatedOp::Write,
            requested_bytes: 2,
            usage_bytes: 9,
            limit_bytes: 10,
        }
        .into();
        assert_eq!(err.raw_os_error(), Some(libc::EDQUOT));
        assert_ne!(err.raw_os_error(), Some(libc::ENOSPC));
    }

    #[test]
    fn test_quota_error_display() {
        let err = QuotaError::Exceeded {
            operation: GatedOp::Mkdir,
            requested_bytes: 0,
            usage_bytes: 11,
            limit_bytes: 10,
        };
        let msg = err.to_string();
        assert!(msg.contains("mkdir"), "{msg}");
        assert!(msg.contains("11"), "{msg}");
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::QuotaOverflow { quota_mib: u64::MAX };
        assert!(err.to_string().starts_with("wrong quota"));
    }
}
