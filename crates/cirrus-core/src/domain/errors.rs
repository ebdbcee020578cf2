//! Core error kinds
//!
//! Every fallible operation in the core plane returns a [`CoreError`]. The
//! kinds mirror the distinctions the remote API and the local stores can
//! make: callers branch on the kind, not on message text. The FUSE adapter
//! maps surfaced kinds to errnos via [`CoreError::errno`].

use std::time::Duration;

use thiserror::Error;

/// Error kinds for core operations
///
/// `Transient`, `RateLimited`, and `AuthExpired` are recovered inside the
/// download/upload/delta managers with retry and backoff; they surface to
/// filesystem operations only after the retry budget is consumed, as
/// `Exhausted`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Remote or local absence of the requested object
    #[error("not found: {0}")]
    NotFound(String),

    /// Auth or ACL rejection
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The bearer token was rejected; triggers a refresh
    #[error("authentication expired")]
    AuthExpired,

    /// ETag mismatch on a conditional write
    #[error("conflict: {0}")]
    Conflict(String),

    /// Generic precondition failure (HTTP 412)
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Throttled by the remote; carries the server-requested delay
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// Delay requested by the Retry-After header
        retry_after: Duration,
    },

    /// Network failure, 5xx, or DNS error
    #[error("transient failure: {0}")]
    Transient(String),

    /// The offline detector reports no connectivity
    #[error("not connected")]
    NotConnected,

    /// Local disk or metadata-store failure
    #[error("storage failure: {0}")]
    Storage(String),

    /// Bad name, disallowed characters, or malformed input
    #[error("invalid: {0}")]
    Invalid(String),

    /// A path segment other than the last resolved to a non-folder
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// The target name already exists in the folder (case-insensitive)
    #[error("name already exists: {0}")]
    NameConflict(String),

    /// A retry budget was consumed without success
    #[error("retry budget exhausted: {0}")]
    Exhausted(String),

    /// The operation was cancelled
    #[error("cancelled")]
    Cancelled,
}

impl CoreError {
    /// Maps a surfaced error kind to the errno the FUSE adapter reports.
    ///
    /// Conflict and Storage both map to EIO; Conflict additionally drives
    /// the status bus so clients can distinguish them.
    pub fn errno(&self) -> i32 {
        match self {
            CoreError::NotFound(_) => libc::ENOENT,
            CoreError::PermissionDenied(_) | CoreError::AuthExpired => libc::EACCES,
            CoreError::Invalid(_) => libc::EINVAL,
            CoreError::NotADirectory(_) => libc::ENOTDIR,
            CoreError::NameConflict(_) => libc::EEXIST,
            CoreError::Conflict(_) => libc::EIO,
            CoreError::Precondition(_) => libc::EIO,
            CoreError::Storage(_) => libc::EIO,
            CoreError::Cancelled => libc::EINTR,
            CoreError::NotConnected => libc::ENOTCONN,
            CoreError::RateLimited { .. } => libc::EAGAIN,
            CoreError::Transient(_) | CoreError::Exhausted(_) => libc::EIO,
        }
    }

    /// Returns true for kinds the managers recover from with retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Transient(_) | CoreError::RateLimited { .. } | CoreError::AuthExpired
        )
    }

    /// Wraps an I/O error as a storage failure.
    pub fn storage(err: impl std::fmt::Display) -> Self {
        CoreError::Storage(err.to_string())
    }

    /// Wraps a network-layer error as a transient failure.
    pub fn transient(err: impl std::fmt::Display) -> Self {
        CoreError::Transient(err.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => CoreError::NotFound(err.to_string()),
            std::io::ErrorKind::PermissionDenied => CoreError::PermissionDenied(err.to_string()),
            _ => CoreError::Storage(err.to_string()),
        }
    }
}
