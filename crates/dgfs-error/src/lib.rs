#![forbid(unsafe_code)]
//! Error types for DataGrid FS.
//!
//! Defines `DgfsError` and a `Result<T>` alias used throughout the
//! workspace. Includes errno mappings for the VFS layer above.
//!
//! End-of-file is deliberately not represented here: positional reads
//! report EOF through `ReadOutcome`, and only genuine failures become
//! errors.

use thiserror::Error;

/// Unified error type for all DataGrid FS operations.
#[derive(Debug, Error)]
pub enum DgfsError {
    /// Local disk I/O failure in the cache tier.
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure reported by the remote store client or a file handle.
    #[error("remote I/O error: {0}")]
    Remote(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A buffer exceeds the receiving store's per-entry or total cap.
    #[error("data of {requested} bytes exceeds cap of {cap} bytes")]
    TooLarge { requested: usize, cap: usize },

    /// A block transfer ended in a failed state before yielding the
    /// requested bytes.
    #[error("transfer for block {block} failed")]
    TransferFailed { block: u64 },

    /// Work was scheduled against a component after its release.
    #[error("operation scheduled after release")]
    Terminated,

    #[error("invalid virtual path mapping: {0}")]
    InvalidMapping(String),

    #[error("permission denied")]
    PermissionDenied,

    #[error("not a directory: {0}")]
    NotDirectory(String),

    #[error("is a directory: {0}")]
    IsDirectory(String),

    #[error("already exists: {0}")]
    Exists(String),
}

impl DgfsError {
    /// Convert this error into a POSIX errno suitable for VFS replies.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Remote(_) | Self::TransferFailed { .. } => libc::EIO,
            Self::NotFound(_) => libc::ENOENT,
            Self::TooLarge { .. } => libc::EFBIG,
            Self::Terminated => libc::ECANCELED,
            Self::InvalidMapping(_) => libc::EINVAL,
            Self::PermissionDenied => libc::EACCES,
            Self::NotDirectory(_) => libc::ENOTDIR,
            Self::IsDirectory(_) => libc::EISDIR,
            Self::Exists(_) => libc::EEXIST,
        }
    }

    /// Whether this error names a missing remote entry.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl Clone for DgfsError {
    fn clone(&self) -> Self {
        match self {
            // std::io::Error is not Clone; preserve kind and message.
            Self::Io(err) => Self::Io(std::io::Error::new(err.kind(), err.to_string())),
            Self::Remote(detail) => Self::Remote(detail.clone()),
            Self::NotFound(path) => Self::NotFound(path.clone()),
            Self::TooLarge { requested, cap } => Self::TooLarge {
                requested: *requested,
                cap: *cap,
            },
            Self::TransferFailed { block } => Self::TransferFailed { block: *block },
            Self::Terminated => Self::Terminated,
            Self::InvalidMapping(detail) => Self::InvalidMapping(detail.clone()),
            Self::PermissionDenied => Self::PermissionDenied,
            Self::NotDirectory(path) => Self::NotDirectory(path.clone()),
            Self::IsDirectory(path) => Self::IsDirectory(path.clone()),
            Self::Exists(path) => Self::Exists(path.clone()),
        }
    }
}

/// Result alias using `DgfsError`.
pub type Result<T> = std::result::Result<T, DgfsError>;
