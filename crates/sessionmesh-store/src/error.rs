//! Error types for session store operations.

use crate::cluster::MemberId;
use crate::transport::TransportError;

/// Error type for session store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Session is absent or logically expired.
    #[error("Session not found: {0}")]
    NotFound(String),

    /// The owner of the session could not be reached (or no owner is known).
    #[error("Owner unavailable for session {id} (owner: {owner:?})")]
    OwnerUnavailable {
        id: String,
        owner: Option<MemberId>,
    },

    /// No replica holding the session could be reached.
    #[error("No reachable replica for session: {0}")]
    Unavailable(String),

    /// Attribute value could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Error from the replication transport.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The store has been shut down.
    #[error("Session store is shut down")]
    Shutdown,
}

impl Error {
    /// Whether retrying after membership settles may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::OwnerUnavailable { .. } | Error::Unavailable(_) | Error::Transport(_)
        )
    }
}

/// Result type for session store operations.
pub type Result<T> = std::result::Result<T, Error>;
