//! Identifiers used across the engine.
//!
//! A node carries two identities: a [`NodeHandle`] minted locally the moment
//! the node exists on this participant, and a [`NodeId`] assigned by the
//! authority once creation is confirmed.

use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

/// Local handle for a node, stable for the life of the local node.
///
/// Handles sort by creation millisecond, then by their random part, which
/// gives a deterministic tie-break between two nodes that are both pending.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeHandle(pub Ulid);

impl NodeHandle {
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Truncated display (last 6 chars, the random part varies most there).
    pub fn short(&self) -> String {
        let s = self.0.to_string();
        s[s.len() - 6..].to_string()
    }
}

impl Default for NodeHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Authority-assigned node identifier, unique for the life of the
/// authoritative state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifier of a participant in the session.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Domain type tag of a node. Opaque beyond equality.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKind(pub String);

impl NodeKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Equality key identifying the logical entity a node represents
/// (an asset path, an external identifier, ...). Two live nodes sharing a
/// key are a creation race.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey(pub String);

impl EntityKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
