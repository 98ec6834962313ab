//! The replicated node and its lock / lifecycle states.

use crate::ids::{EntityKey, NodeHandle, NodeId, NodeKind, ParticipantId};
use crate::value::Attributes;
use serde::{Deserialize, Serialize};

/// Lock claim stored directly on a node.
///
/// This is only the node's own claim. Whether a node is partially locked
/// depends on its descendants and is derived on read, see [`LockState`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectLock {
    #[default]
    Unlocked,
    /// Request sent (or about to be), awaiting grant.
    Requested,
    /// Held by the local participant.
    Local,
    /// Held by another participant.
    Other(ParticipantId),
}

impl DirectLock {
    /// True for a granted lock, whoever holds it.
    pub fn is_held(&self) -> bool {
        matches!(self, DirectLock::Local | DirectLock::Other(_))
    }
}

/// Lock state as observed by readers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockState {
    Unlocked,
    LockRequested,
    LockedByLocal,
    LockedByOther(ParticipantId),
    /// No direct lock, but at least one descendant is locked.
    PartiallyLocked,
}

/// Creation / deletion lifecycle of a node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifecycle {
    /// Created locally, not yet confirmed by the authority.
    #[default]
    Pending,
    /// Confirmed and live.
    Syncing,
    /// Delete requested, not yet confirmed.
    DeletePending,
    Deleted,
}

impl Lifecycle {
    /// True while the node can still take part in edits.
    pub fn is_live(&self) -> bool {
        matches!(self, Lifecycle::Pending | Lifecycle::Syncing)
    }
}

/// Behavioural flags of a node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFlags {
    /// Destroyed automatically on disconnect, never persisted.
    pub transient: bool,
    /// Children are only delivered to participants that subscribe.
    pub requires_subscription: bool,
}

impl NodeFlags {
    pub fn transient() -> Self {
        Self {
            transient: true,
            ..Default::default()
        }
    }

    pub fn requires_subscription() -> Self {
        Self {
            requires_subscription: true,
            ..Default::default()
        }
    }
}

/// A node of the replicated scene graph as held by one participant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplicatedNode {
    /// Local handle.
    pub handle: NodeHandle,
    /// Authority-assigned id, `None` while creation is pending.
    pub id: Option<NodeId>,
    pub kind: NodeKind,
    pub attributes: Attributes,
    /// Containing node (relation only).
    pub parent: Option<NodeHandle>,
    /// Ordered children.
    pub children: Vec<NodeHandle>,
    pub lock: DirectLock,
    pub lifecycle: Lifecycle,
    pub flags: NodeFlags,
    /// Authority sequence number of the confirming create.
    pub confirmed_seq: Option<u64>,
    /// Logical entity this node stands for, if its kind defines one.
    pub entity_key: Option<EntityKey>,
    /// Local content disagreed with the authority; excluded from sync.
    pub conflicting: bool,
}

impl ReplicatedNode {
    /// A node created locally, awaiting confirmation.
    pub fn pending(kind: NodeKind, attributes: Attributes, flags: NodeFlags) -> Self {
        Self {
            handle: NodeHandle::new(),
            id: None,
            kind,
            attributes,
            parent: None,
            children: Vec::new(),
            lock: DirectLock::Unlocked,
            lifecycle: Lifecycle::Pending,
            flags,
            confirmed_seq: None,
            entity_key: None,
            conflicting: false,
        }
    }

    /// A node delivered by the authority, already live.
    pub fn confirmed(
        id: NodeId,
        seq: u64,
        kind: NodeKind,
        attributes: Attributes,
        flags: NodeFlags,
    ) -> Self {
        let mut node = Self::pending(kind, attributes, flags);
        node.id = Some(id);
        node.confirmed_seq = Some(seq);
        node.lifecycle = Lifecycle::Syncing;
        node
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Whether the node currently takes part in synchronization.
    pub fn is_synced(&self) -> bool {
        self.lifecycle == Lifecycle::Syncing && !self.conflicting
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_node_has_no_id() {
        let node = ReplicatedNode::pending(NodeKind::new("mesh"), Attributes::new(), NodeFlags::default());
        assert!(node.id.is_none());
        assert_eq!(node.lifecycle, Lifecycle::Pending);
        assert!(node.is_root());
        assert!(!node.is_synced());
    }

    #[test]
    fn test_confirmed_node_is_live() {
        let node = ReplicatedNode::confirmed(
            NodeId(7),
            3,
            NodeKind::new("light"),
            Attributes::new(),
            NodeFlags::transient(),
        );
        assert_eq!(node.id, Some(NodeId(7)));
        assert_eq!(node.confirmed_seq, Some(3));
        assert!(node.is_synced());
        assert!(node.flags.transient);
        assert!(node.lifecycle.is_live());
    }

    #[test]
    fn test_direct_lock_held() {
        assert!(!DirectLock::Unlocked.is_held());
        assert!(!DirectLock::Requested.is_held());
        assert!(DirectLock::Local.is_held());
        assert!(DirectLock::Other(ParticipantId::new("bob")).is_held());
    }
}
