//! Error types for the session layer.

use rnse_core::{NodeId, ParticipantId, SyncError};
use thiserror::Error;

/// Errors that can occur while driving a session.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Participant not connected: {0}")]
    NotConnected(ParticipantId),

    #[error("Participant already connected: {0}")]
    AlreadyConnected(ParticipantId),

    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    /// The authority went away while events were still expected.
    #[error("Transport closed")]
    Closed,

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),
}

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;
