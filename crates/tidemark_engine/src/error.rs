//! Error types for the sync engine.

use thiserror::Error;
use tidemark_store::{LocalId, StoreError};

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Not connected to the remote store.
    #[error("not connected to remote store")]
    NotConnected,

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The remote store rejected the request.
    #[error("server error: {0}")]
    ServerError(String),

    /// A remote request did not complete in time.
    #[error("operation timed out")]
    Timeout,

    /// The remote store returned something the engine cannot use.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A downloaded entity could be neither updated nor inserted locally.
    ///
    /// The whole download batch is rolled back.
    #[error("storage conflict applying remote object {remote_id:?}: {reason}")]
    StorageConflict {
        /// Remote id of the entity that could not be applied.
        remote_id: Option<String>,
        /// Why the write was rejected.
        reason: String,
    },

    /// The local changed-since query failed.
    #[error("local change query failed: {0}")]
    StorageQuery(#[source] StoreError),

    /// Writing an upload result back to the local row failed.
    #[error("write-back of local row {local_id} failed: {source}")]
    StorageWrite {
        /// Local id of the row.
        local_id: LocalId,
        /// Underlying store error.
        #[source]
        source: StoreError,
    },

    /// Local store or watermark error outside the cases above.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// An entity could not be converted.
    #[error("codec error: {0}")]
    Codec(String),

    /// Sync was cancelled at a phase boundary.
    #[error("sync cancelled")]
    Cancelled,

    /// Invalid state transition.
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error came from talking to the remote store.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SyncError::Transport { .. }
                | SyncError::NotConnected
                | SyncError::AuthenticationFailed(_)
                | SyncError::ServerError(_)
                | SyncError::Timeout
        )
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::NotConnected => true,
            SyncError::Timeout => true,
            SyncError::ServerError(_) => true,
            _ => false,
        }
    }
}
