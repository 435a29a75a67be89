//! Error types for the daemon, with their POSIX errno mapping.

use thiserror::Error;

use shellfs_client::SharedError;

/// Errors surfaced by the node hierarchy and the state store.
#[derive(Debug, Error)]
pub enum FsError {
    /// Unknown path or entity.
    #[error("not found")]
    NotFound,

    /// Write to a control file after the conversation was created.
    #[error("conversation already created")]
    AlreadyCreated,

    /// Duplicate create, e.g. `mark_created` with conflicting values.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The operation is not supported on this node.
    #[error("operation not permitted")]
    NotPermitted,

    /// Malformed input to a control file.
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// A backend call failed. The detail is logged daemon-side; the
    /// filesystem reply carries only the errno.
    #[error("backend error: {0}")]
    Backend(#[from] SharedError),

    /// State-file I/O failure.
    #[error("state i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// State-file (de)serialization failure.
    #[error("state encoding error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal bug.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl FsError {
    /// The POSIX errno this error maps to at the filesystem boundary.
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::AlreadyCreated => libc::EACCES,
            Self::Conflict(_) => libc::EEXIST,
            Self::NotPermitted => libc::EPERM,
            Self::Invalid(_) => libc::EINVAL,
            Self::Backend(_) | Self::Io(_) | Self::Json(_) | Self::Invariant(_) => libc::EIO,
        }
    }
}

/// Result type alias using [`FsError`].
pub type Result<T> = std::result::Result<T, FsError>;
