//! Interfaces between the engine and its collaborators.
//!
//! - [`AuthorityChannel`]: outbound structural operations for the session
//!   authority. Inbound confirmations arrive as [`AuthorityEvent`]s.
//! - [`LocalAdapter`]: the local representation (scene objects). All
//!   domain-specific payload handling is delegated to it.
//! - [`NotificationSink`]: notification attach/detach for the UI.
//!
//! Nothing here defines a wire format; the engine works on already
//! deserialized values.

use crate::notify::Notification;
use rnse_core::{
    Attributes, ContentChecksum, NodeFlags, NodeHandle, NodeId, NodeKind, ParticipantId,
    ReplicatedNode,
};
use serde::{Deserialize, Serialize};

/// One node of a batched create.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateRequest {
    /// Local handle; echoed back by the authority so the creator can match
    /// the confirmation to its pending node.
    pub origin: NodeHandle,
    pub kind: NodeKind,
    pub attributes: Attributes,
    pub flags: NodeFlags,
    /// Id the node had before a retracted delete, offered for reuse.
    pub reuse_id: Option<NodeId>,
}

/// Structural operation sent to the authority.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AuthorityOp {
    Create {
        nodes: Vec<CreateRequest>,
        parent: Option<NodeId>,
        index: usize,
    },
    Delete {
        node: NodeId,
    },
    SetChildIndex {
        node: NodeId,
        index: usize,
    },
    SetParent {
        node: NodeId,
        parent: Option<NodeId>,
        index: usize,
    },
    Lock {
        node: NodeId,
    },
    Unlock {
        node: NodeId,
    },
    Subscribe {
        node: NodeId,
    },
    Unsubscribe {
        node: NodeId,
    },
}

/// Outbound side of the authority session.
pub trait AuthorityChannel {
    /// Create `nodes` as consecutive children of `parent`, the first at
    /// `index`.
    fn create(&mut self, nodes: Vec<CreateRequest>, parent: Option<NodeId>, index: usize);

    fn delete(&mut self, node: NodeId);

    /// Move `node` to `index` within its authoritative parent.
    fn set_child_index(&mut self, node: NodeId, index: usize);

    fn set_parent(&mut self, node: NodeId, parent: Option<NodeId>, index: usize);

    fn lock(&mut self, node: NodeId);

    fn unlock(&mut self, node: NodeId);

    fn subscribe(&mut self, node: NodeId);

    fn unsubscribe(&mut self, node: NodeId);
}

/// Records operations instead of sending them. The session drains the
/// buffer after each tick and forwards it to the transport.
#[derive(Clone, Debug, Default)]
pub struct OpBuffer {
    ops: Vec<AuthorityOp>,
}

impl OpBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> &[AuthorityOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn take(&mut self) -> Vec<AuthorityOp> {
        std::mem::take(&mut self.ops)
    }
}

impl AuthorityChannel for OpBuffer {
    fn create(&mut self, nodes: Vec<CreateRequest>, parent: Option<NodeId>, index: usize) {
        self.ops.push(AuthorityOp::Create {
            nodes,
            parent,
            index,
        });
    }

    fn delete(&mut self, node: NodeId) {
        self.ops.push(AuthorityOp::Delete { node });
    }

    fn set_child_index(&mut self, node: NodeId, index: usize) {
        self.ops.push(AuthorityOp::SetChildIndex { node, index });
    }

    fn set_parent(&mut self, node: NodeId, parent: Option<NodeId>, index: usize) {
        self.ops.push(AuthorityOp::SetParent {
            node,
            parent,
            index,
        });
    }

    fn lock(&mut self, node: NodeId) {
        self.ops.push(AuthorityOp::Lock { node });
    }

    fn unlock(&mut self, node: NodeId) {
        self.ops.push(AuthorityOp::Unlock { node });
    }

    fn subscribe(&mut self, node: NodeId) {
        self.ops.push(AuthorityOp::Subscribe { node });
    }

    fn unsubscribe(&mut self, node: NodeId) {
        self.ops.push(AuthorityOp::Unsubscribe { node });
    }
}

/// Confirmed authoritative event, delivered once per event in the order
/// the authority sequenced them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AuthorityEvent {
    Created {
        id: NodeId,
        /// Authority sequence number of this create.
        seq: u64,
        /// Creator's local handle; only set on the creator's own copy.
        origin: Option<NodeHandle>,
        kind: NodeKind,
        attributes: Attributes,
        flags: NodeFlags,
        parent: Option<NodeId>,
        index: usize,
        /// Declared content fingerprint, for kinds that carry content.
        checksum: Option<ContentChecksum>,
    },
    Deleted {
        id: NodeId,
    },
    ParentChanged {
        id: NodeId,
        parent: Option<NodeId>,
        index: usize,
    },
    Locked {
        id: NodeId,
        owner: ParticipantId,
    },
    Unlocked {
        id: NodeId,
    },
    PropertyChanged {
        id: NodeId,
        attributes: Attributes,
    },
    ParticipantLeft {
        participant: ParticipantId,
    },
}

/// Content that existed locally before the authority announced the node,
/// e.g. an asset already present on disk.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalContent {
    /// Raw bytes the checksum is computed over.
    pub data: Vec<u8>,
    /// Attribute values the local content resolves to.
    pub attributes: Attributes,
}

/// The local representation of the scene graph.
pub trait LocalAdapter {
    /// Current local order of `parent`'s children.
    fn local_child_order(&self, parent: NodeHandle) -> Vec<NodeHandle>;

    /// Move `child` to `index` within its local parent (remove then insert).
    fn move_local_child(&mut self, child: NodeHandle, index: usize);

    /// Re-parent `child` locally, appending it to the new parent.
    fn set_local_parent(&mut self, child: NodeHandle, parent: Option<NodeHandle>);

    fn apply_attributes(&mut self, node: NodeHandle, attributes: &Attributes);

    fn send_attribute_changes(&mut self, node: NodeHandle, attributes: &Attributes);

    /// Whether the user is currently manipulating `node`.
    fn is_selected(&self, _node: NodeHandle) -> bool {
        false
    }

    /// Pre-existing local content for a node about to be created remotely.
    fn local_content(&self, _kind: &NodeKind, _attributes: &Attributes) -> Option<LocalContent> {
        None
    }

    /// Materialize the local object for a node (remote create or recreate),
    /// appended under its parent. Returns false if the content could not be
    /// materialized.
    fn instantiate(&mut self, _node: &ReplicatedNode) -> bool {
        true
    }

    /// Remove the local object of a node.
    fn destroy(&mut self, _node: NodeHandle) {}
}

/// UI-facing notification hooks.
pub trait NotificationSink {
    fn on_notification_attached(&mut self, node: NodeHandle, notification: &Notification);

    fn on_notification_detached(&mut self, node: NodeHandle, notification: &Notification);
}

/// Sink that drops everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl NotificationSink for NullSink {
    fn on_notification_attached(&mut self, _node: NodeHandle, _notification: &Notification) {}

    fn on_notification_detached(&mut self, _node: NodeHandle, _notification: &Notification) {}
}
