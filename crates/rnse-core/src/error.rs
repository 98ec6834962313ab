//! Error types for the synchronization engine.
//!
//! None of these terminate a session. Each names the recovery the engine
//! performs when it raises them.

use crate::ids::{EntityKey, NodeHandle, ParticipantId};
use crate::node::Lifecycle;
use thiserror::Error;

/// Errors that can occur in synchronization operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Operation attempted on a deleted or pending node. Logged and dropped.
    #[error("Invalid state for {handle}: {operation} not allowed while {lifecycle:?}")]
    InvalidState {
        handle: NodeHandle,
        lifecycle: Lifecycle,
        operation: &'static str,
    },

    /// Write attempted on a node locked by another participant. The local
    /// change is reverted to the authoritative state.
    #[error("Node {handle} is locked by {owner}")]
    LockConflict {
        handle: NodeHandle,
        owner: ParticipantId,
    },

    /// Two nodes were created for the same entity. Resolved automatically.
    #[error("Duplicate creation of {key}: {loser} collapsed into {survivor}")]
    DuplicateCreation {
        key: EntityKey,
        survivor: NodeHandle,
        loser: NodeHandle,
    },

    /// Local content disagrees with the authority. Sync is suspended for
    /// this node only.
    #[error("Content conflict on {handle}")]
    ContentConflict { handle: NodeHandle },

    /// A reference points at content that could not be materialized.
    #[error("Reference to broken node {target}")]
    ReferenceBroken { target: NodeHandle },

    #[error("Node not found: {0}")]
    NodeNotFound(NodeHandle),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
