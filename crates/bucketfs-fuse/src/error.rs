//! Error types for the FUSE filesystem.
//!
//! Defines `FsError` and conversions to libc errno values.

use bucketfs_cache::CacheError;
use bucketfs_core::domain::StoreError;
use thiserror::Error;

/// Errors that can occur in the FUSE filesystem.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("stale file handle: {0}")]
    StaleHandle(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("operation interrupted")]
    Interrupted,

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("no space: {0}")]
    NoSpace(String),

    #[error("too many open handles")]
    TooManyOpen,

    #[error("name too long: {0}")]
    NameTooLong(String),

    #[error("extended attribute not found: {0}")]
    XattrNotFound(String),

    #[error("buffer too small for extended attribute")]
    XattrBufferTooSmall,

    #[error("operation not supported")]
    NotSupported,
}

impl From<FsError> for libc::c_int {
    fn from(err: FsError) -> libc::c_int {
        match err {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::Exists(_) => libc::EEXIST,
            FsError::NotADirectory(_) => libc::ENOTDIR,
            FsError::IsADirectory(_) => libc::EISDIR,
            FsError::NotEmpty(_) => libc::ENOTEMPTY,
            FsError::Permission(_) => libc::EACCES,
            FsError::StaleHandle(_) => libc::ESTALE,
            FsError::Io(_) => libc::EIO,
            FsError::Interrupted => libc::EINTR,
            FsError::Invalid(_) => libc::EINVAL,
            FsError::NoSpace(_) => libc::ENOSPC,
            FsError::TooManyOpen => libc::ENFILE,
            FsError::NameTooLong(_) => libc::ENAMETOOLONG,
            FsError::XattrNotFound(_) => libc::ENODATA,
            FsError::XattrBufferTooSmall => libc::ERANGE,
            FsError::NotSupported => libc::ENOSYS,
        }
    }
}

impl From<StoreError> for FsError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(name) => FsError::NotFound(name),
            StoreError::AlreadyExists(name) => FsError::Exists(name),
            StoreError::PreconditionFailed { name, .. } => FsError::StaleHandle(name),
            StoreError::Permission(msg) => FsError::Permission(msg),
            StoreError::Cancelled => FsError::Interrupted,
            StoreError::Invalid(msg) => FsError::Invalid(msg),
            // Retryable errors reaching this layer have exhausted their
            // budget inside the bucket; they surface as plain I/O failures.
            other => FsError::Io(other.to_string()),
        }
    }
}

impl From<CacheError> for FsError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Cancelled => FsError::Interrupted,
            CacheError::Full { needed, budget } => FsError::NoSpace(format!(
                "cache admission refused: {needed} bytes over budget {budget}"
            )),
            other => FsError::Io(other.to_string()),
        }
    }
}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        if err.raw_os_error() == Some(libc::ENOSPC) {
            FsError::NoSpace(err.to_string())
        } else {
            FsError::Io(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(libc::c_int::from(FsError::NotFound("x".into())), libc::ENOENT);
        assert_eq!(
            libc::c_int::from(FsError::StaleHandle("x".into())),
            libc::ESTALE
        );
        assert_eq!(
            libc::c_int::from(FsError::NotEmpty("d".into())),
            libc::ENOTEMPTY
        );
        assert_eq!(libc::c_int::from(FsError::Interrupted), libc::EINTR);
        assert_eq!(libc::c_int::from(FsError::TooManyOpen), libc::ENFILE);
    }

    #[test]
    fn test_store_error_conversion() {
        let err: FsError = StoreError::PreconditionFailed {
            name: "foo".into(),
            expected: 3,
        }
        .into();
        assert!(matches!(err, FsError::StaleHandle(_)));

        let err: FsError = StoreError::Network("down".into()).into();
        assert!(matches!(err, FsError::Io(_)));
    }

    #[test]
    fn test_cache_full_maps_to_nospace() {
        let err: FsError = CacheError::Full {
            needed: 10,
            budget: 5,
        }
        .into();
        assert_eq!(libc::c_int::from(err), libc::ENOSPC);
    }
}
