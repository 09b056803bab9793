//! Error types for the sync engine.

use thiserror::Error;

use crate::storage::StorageError;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network unreachable or the request failed in flight.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// A remote call exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The server refused the submitted mutation.
    #[error("server rejected request: {0}")]
    ServerRejected(String),

    /// Push channel handshake failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Credentials were refused.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The push channel is not open.
    #[error("not connected to server")]
    NotConnected,

    /// The operation was superseded by a disconnect.
    #[error("operation cancelled")]
    Cancelled,

    /// The conflict has already been resolved.
    #[error("conflict {0} is already resolved")]
    AlreadyResolved(String),

    /// Merge resolution without a merged payload.
    #[error("merge resolution requires a merged payload")]
    InvalidMerge,

    /// No conflict with this id is known.
    #[error("unknown conflict: {0}")]
    UnknownConflict(String),

    /// Response could not be understood.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Local persistence failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl SyncError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Returns true if the failed operation should be retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Transport { .. }
                | SyncError::Timeout
                | SyncError::Connection(_)
                | SyncError::NotConnected
                | SyncError::AuthenticationFailed(_)
                | SyncError::Protocol(_)
        )
    }

    /// Returns true for a terminal refusal of a submitted mutation.
    pub fn is_rejection(&self) -> bool {
        matches!(self, SyncError::ServerRejected(_))
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self, SyncError::AuthenticationFailed(_))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Timeout
        } else if err.is_decode() {
            SyncError::Protocol(err.to_string())
        } else {
            SyncError::transport(err.to_string())
        }
    }
}
