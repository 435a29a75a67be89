//! Error types for the client stack.

use std::sync::Arc;

use thiserror::Error;

/// Errors that can occur when talking to the conversation backend.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// The backend answered with a status outside the accepted set for the
    /// operation. The body is kept for daemon-side logging only; it must
    /// never be copied into a filesystem reply.
    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// Network or HTTP transport failure.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The backend sent JSON we could not decode.
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// The configured backend URL is not a valid URL.
    #[error("invalid backend url: {0}")]
    InvalidUrl(String),

    /// Internal invariant violation (poisoned lock and the like).
    #[error("internal error: {0}")]
    Internal(String),
}

impl ClientError {
    /// Whether this is a backend status error with the given code.
    pub fn is_status(&self, code: u16) -> bool {
        matches!(self, Self::Status { status, .. } if *status == code)
    }

    /// Whether the backend reported the entity as gone.
    pub fn is_not_found(&self) -> bool {
        self.is_status(404)
    }
}

/// A clonable client error, as handed to every waiter of a coalesced
/// request.
pub type SharedError = Arc<ClientError>;

/// Result type alias using [`ClientError`].
pub type Result<T> = std::result::Result<T, ClientError>;
