//! Node Store - owns every replicated node known to the local participant.
//!
//! Nodes are indexed by local handle and, once confirmed, by authority id.
//! The store keeps parent/child edges consistent:
//! - a node's children are always present in the store
//! - a deleted node is never inserted into another node's children
//! - exactly one node exists per authority id

use rnse_core::{
    map_references, AttributeValue, Attributes, Lifecycle, NodeHandle, NodeId, ReferenceValue,
    ReplicatedNode, Result, SyncError,
};
use std::collections::HashMap;

#[derive(Clone, Debug, Default)]
pub struct NodeStore {
    /// All nodes indexed by handle.
    nodes: HashMap<NodeHandle, ReplicatedNode>,
    /// Authority id -> handle.
    by_id: HashMap<NodeId, NodeHandle>,
}

impl NodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, handle: NodeHandle) -> bool {
        self.nodes.contains_key(&handle)
    }

    pub fn get(&self, handle: NodeHandle) -> Option<&ReplicatedNode> {
        self.nodes.get(&handle)
    }

    /// Mutable access is reserved to the engine; child order and lock state
    /// must only change through the coordinator and reconciler.
    pub(crate) fn get_mut(&mut self, handle: NodeHandle) -> Option<&mut ReplicatedNode> {
        self.nodes.get_mut(&handle)
    }

    pub fn get_by_id(&self, id: NodeId) -> Option<&ReplicatedNode> {
        self.by_id.get(&id).and_then(|h| self.nodes.get(h))
    }

    pub fn handle_of(&self, id: NodeId) -> Option<NodeHandle> {
        self.by_id.get(&id).copied()
    }

    pub fn id_of(&self, handle: NodeHandle) -> Option<NodeId> {
        self.nodes.get(&handle).and_then(|n| n.id)
    }

    /// Attributes in the form the authority keeps them: references name the
    /// target's id. A reference to a node without an id yet is sent as null
    /// and counted in the second value; one to an unknown node is dropped.
    pub fn session_attributes(&self, attributes: &Attributes) -> (Attributes, usize) {
        let mut held = 0;
        let translated = map_references(attributes, &mut |value| match value {
            AttributeValue::Reference(r) => match self.nodes.get(&r.target) {
                Some(node) => match node.id {
                    Some(id) => AttributeValue::RemoteReference(id),
                    None => {
                        held += 1;
                        AttributeValue::Null
                    }
                },
                None => AttributeValue::Null,
            },
            other => other.clone(),
        });
        (translated, held)
    }

    /// Attributes received from the authority, with id-form references
    /// turned into local handles where the target is known.
    pub fn local_attributes(&self, attributes: &Attributes) -> Attributes {
        map_references(attributes, &mut |value| match value {
            AttributeValue::RemoteReference(id) => match self.by_id.get(id) {
                Some(handle) => ReferenceValue::to(*handle).into(),
                None => value.clone(),
            },
            other => other.clone(),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReplicatedNode> + '_ {
        self.nodes.values()
    }

    pub fn handles(&self) -> Vec<NodeHandle> {
        let mut handles: Vec<_> = self.nodes.keys().copied().collect();
        handles.sort();
        handles
    }

    fn node(&self, handle: NodeHandle) -> Result<&ReplicatedNode> {
        self.nodes.get(&handle).ok_or(SyncError::NodeNotFound(handle))
    }

    fn node_mut(&mut self, handle: NodeHandle) -> Result<&mut ReplicatedNode> {
        self.nodes
            .get_mut(&handle)
            .ok_or(SyncError::NodeNotFound(handle))
    }

    /// Insert a detached node. Any parent/children it carries are cleared;
    /// edges are only created through [`NodeStore::add_child`].
    pub fn insert(&mut self, mut node: ReplicatedNode) -> Result<NodeHandle> {
        if node.lifecycle == Lifecycle::Deleted {
            return Err(SyncError::InvalidState {
                handle: node.handle,
                lifecycle: node.lifecycle,
                operation: "insert",
            });
        }
        if let Some(id) = node.id {
            if self.by_id.contains_key(&id) {
                return Err(SyncError::InvalidState {
                    handle: node.handle,
                    lifecycle: node.lifecycle,
                    operation: "insert duplicate id",
                });
            }
            self.by_id.insert(id, node.handle);
        }
        node.parent = None;
        node.children.clear();
        let handle = node.handle;
        self.nodes.insert(handle, node);
        Ok(handle)
    }

    /// Record the authority's confirmation of a pending node.
    pub fn confirm(&mut self, handle: NodeHandle, id: NodeId, seq: u64) -> Result<()> {
        if let Some(existing) = self.by_id.get(&id) {
            if *existing != handle {
                let node = self.node(handle)?;
                return Err(SyncError::InvalidState {
                    handle,
                    lifecycle: node.lifecycle,
                    operation: "confirm with id owned by another node",
                });
            }
        }
        let node = self
            .nodes
            .get_mut(&handle)
            .ok_or(SyncError::NodeNotFound(handle))?;
        if let Some(old) = node.id.replace(id) {
            self.by_id.remove(&old);
        }
        node.confirmed_seq = Some(seq);
        if node.lifecycle == Lifecycle::Pending {
            node.lifecycle = Lifecycle::Syncing;
        }
        self.by_id.insert(id, handle);
        Ok(())
    }

    /// Forget the authority id of a node, turning it back into a fresh
    /// pending node. Returns the id it had.
    pub(crate) fn reset_to_pending(&mut self, handle: NodeHandle) -> Result<Option<NodeId>> {
        let node = self
            .nodes
            .get_mut(&handle)
            .ok_or(SyncError::NodeNotFound(handle))?;
        let old = node.id.take();
        node.confirmed_seq = None;
        node.lifecycle = Lifecycle::Pending;
        if let Some(id) = old {
            self.by_id.remove(&id);
        }
        Ok(old)
    }

    pub(crate) fn set_lifecycle(&mut self, handle: NodeHandle, lifecycle: Lifecycle) -> Result<()> {
        self.node_mut(handle)?.lifecycle = lifecycle;
        Ok(())
    }

    pub fn children(&self, handle: NodeHandle) -> &[NodeHandle] {
        self.nodes
            .get(&handle)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
    }

    pub fn parent(&self, handle: NodeHandle) -> Option<NodeHandle> {
        self.nodes.get(&handle).and_then(|n| n.parent)
    }

    /// Ancestors, nearest first.
    pub fn ancestors(&self, handle: NodeHandle) -> Vec<NodeHandle> {
        let mut result = Vec::new();
        let mut current = self.parent(handle);
        while let Some(p) = current {
            if result.contains(&p) {
                break;
            }
            result.push(p);
            current = self.parent(p);
        }
        result
    }

    /// Descendants in pre-order, excluding `handle` itself.
    pub fn descendants(&self, handle: NodeHandle) -> Vec<NodeHandle> {
        let mut result = Vec::new();
        let mut stack: Vec<NodeHandle> = self.children(handle).iter().rev().copied().collect();
        while let Some(h) = stack.pop() {
            result.push(h);
            stack.extend(self.children(h).iter().rev().copied());
        }
        result
    }

    pub fn roots(&self) -> Vec<NodeHandle> {
        let mut roots: Vec<_> = self
            .nodes
            .values()
            .filter(|n| n.parent.is_none())
            .map(|n| n.handle)
            .collect();
        roots.sort();
        roots
    }

    /// Attach `child` under `parent` at `index` (clamped), detaching it from
    /// any previous parent first.
    pub fn add_child(&mut self, parent: NodeHandle, child: NodeHandle, index: usize) -> Result<()> {
        let parent_node = self.node(parent)?;
        if parent_node.lifecycle == Lifecycle::Deleted {
            return Err(SyncError::InvalidState {
                handle: parent,
                lifecycle: parent_node.lifecycle,
                operation: "add_child to",
            });
        }
        let child_node = self.node(child)?;
        if child_node.lifecycle == Lifecycle::Deleted {
            return Err(SyncError::InvalidState {
                handle: child,
                lifecycle: child_node.lifecycle,
                operation: "add_child",
            });
        }
        if parent == child || self.ancestors(parent).contains(&child) {
            return Err(SyncError::InvalidState {
                handle: child,
                lifecycle: child_node.lifecycle,
                operation: "add_child under own descendant",
            });
        }

        self.detach(child);
        let parent_node = self.node_mut(parent)?;
        let index = index.min(parent_node.children.len());
        parent_node.children.insert(index, child);
        self.node_mut(child)?.parent = Some(parent);
        Ok(())
    }

    /// Detach `child` from `parent`, making it a root. A no-op if `child`
    /// is not a child of `parent`.
    pub fn remove_child(&mut self, parent: NodeHandle, child: NodeHandle) -> Result<()> {
        self.node(parent)?;
        if self.node(child)?.parent == Some(parent) {
            self.detach(child);
        }
        Ok(())
    }

    fn detach(&mut self, child: NodeHandle) {
        let old_parent = self.nodes.get_mut(&child).and_then(|n| n.parent.take());
        if let Some(p) = old_parent {
            if let Some(parent_node) = self.nodes.get_mut(&p) {
                parent_node.children.retain(|c| *c != child);
            }
        }
    }

    /// Move `child` to `index` within its current parent's children.
    /// Returns whether the order changed.
    pub fn move_child(&mut self, parent: NodeHandle, child: NodeHandle, index: usize) -> Result<bool> {
        let parent_node = self.node_mut(parent)?;
        let Some(from) = parent_node.children.iter().position(|c| *c == child) else {
            return Err(SyncError::NodeNotFound(child));
        };
        let index = index.min(parent_node.children.len() - 1);
        if from == index {
            return Ok(false);
        }
        let item = parent_node.children.remove(from);
        parent_node.children.insert(index, item);
        Ok(true)
    }

    /// Reorder the children of `parent` to follow `order`. Children missing
    /// from `order` keep their relative order after the listed ones; entries
    /// of `order` that are not children are ignored.
    pub fn reorder_children(&mut self, parent: NodeHandle, order: &[NodeHandle]) -> Result<()> {
        let parent_node = self.node_mut(parent)?;
        let current = std::mem::take(&mut parent_node.children);
        let mut reordered: Vec<NodeHandle> = order
            .iter()
            .copied()
            .filter(|h| current.contains(h))
            .collect();
        for h in current {
            if !reordered.contains(&h) {
                reordered.push(h);
            }
        }
        parent_node.children = reordered;
        Ok(())
    }

    /// Remove a node and its whole subtree from the store. The removed
    /// nodes are returned marked `Deleted`, root of the subtree first.
    pub fn discard(&mut self, handle: NodeHandle) -> Vec<ReplicatedNode> {
        if !self.nodes.contains_key(&handle) {
            return Vec::new();
        }
        self.detach(handle);
        let mut order = vec![handle];
        order.extend(self.descendants(handle));

        let mut removed = Vec::with_capacity(order.len());
        for h in order {
            if let Some(mut node) = self.nodes.remove(&h) {
                if let Some(id) = node.id {
                    self.by_id.remove(&id);
                }
                node.lifecycle = Lifecycle::Deleted;
                removed.push(node);
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rnse_core::{Attributes, NodeFlags, NodeKind};

    fn pending(store: &mut NodeStore) -> NodeHandle {
        store
            .insert(ReplicatedNode::pending(
                NodeKind::new("group"),
                Attributes::new(),
                NodeFlags::default(),
            ))
            .unwrap()
    }

    #[test]
    fn test_references_translate_between_handles_and_ids() {
        let mut store = NodeStore::new();
        let confirmed = pending(&mut store);
        let waiting = pending(&mut store);
        store.confirm(confirmed, NodeId(7), 1).unwrap();

        let mut attrs = Attributes::new();
        attrs.insert("a".into(), ReferenceValue::to(confirmed).into());
        attrs.insert("b".into(), ReferenceValue::to(waiting).into());
        attrs.insert("c".into(), ReferenceValue::to(NodeHandle::new()).into());

        let (sent, held) = store.session_attributes(&attrs);
        assert_eq!(held, 1);
        assert_eq!(sent["a"], AttributeValue::RemoteReference(NodeId(7)));
        assert!(sent["b"].is_null());
        assert!(sent["c"].is_null());

        let mut received = Attributes::new();
        received.insert("a".into(), AttributeValue::RemoteReference(NodeId(7)));
        received.insert("b".into(), AttributeValue::RemoteReference(NodeId(8)));
        let local = store.local_attributes(&received);
        assert_eq!(local["a"], AttributeValue::Reference(ReferenceValue::to(confirmed)));
        assert_eq!(local["b"], AttributeValue::RemoteReference(NodeId(8)));
    }

    #[test]
    fn test_add_and_remove_child() {
        let mut store = NodeStore::new();
        let root = pending(&mut store);
        let a = pending(&mut store);
        let b = pending(&mut store);

        store.add_child(root, a, 0).unwrap();
        store.add_child(root, b, 0).unwrap();
        assert_eq!(store.children(root), &[b, a]);
        assert_eq!(store.parent(a), Some(root));

        store.remove_child(root, b).unwrap();
        assert_eq!(store.children(root), &[a]);
        assert_eq!(store.parent(b), None);
    }

    #[test]
    fn test_reparent_detaches_from_old_parent() {
        let mut store = NodeStore::new();
        let p1 = pending(&mut store);
        let p2 = pending(&mut store);
        let c = pending(&mut store);

        store.add_child(p1, c, 0).unwrap();
        store.add_child(p2, c, 5).unwrap();
        assert!(store.children(p1).is_empty());
        assert_eq!(store.children(p2), &[c]);
    }

    #[test]
    fn test_cycles_are_rejected() {
        let mut store = NodeStore::new();
        let a = pending(&mut store);
        let b = pending(&mut store);
        store.add_child(a, b, 0).unwrap();

        let err = store.add_child(b, a, 0).unwrap_err();
        assert!(matches!(err, SyncError::InvalidState { .. }));
    }

    #[test]
    fn test_confirm_indexes_by_id() {
        let mut store = NodeStore::new();
        let a = pending(&mut store);
        store.confirm(a, NodeId(9), 1).unwrap();

        assert_eq!(store.handle_of(NodeId(9)), Some(a));
        assert_eq!(store.get(a).unwrap().lifecycle, Lifecycle::Syncing);

        let b = pending(&mut store);
        assert!(store.confirm(b, NodeId(9), 2).is_err());
    }

    #[test]
    fn test_one_node_per_id() {
        let mut store = NodeStore::new();
        let node = ReplicatedNode::confirmed(
            NodeId(1),
            1,
            NodeKind::new("group"),
            Attributes::new(),
            NodeFlags::default(),
        );
        store.insert(node).unwrap();
        let dup = ReplicatedNode::confirmed(
            NodeId(1),
            2,
            NodeKind::new("group"),
            Attributes::new(),
            NodeFlags::default(),
        );
        assert!(store.insert(dup).is_err());
    }

    #[test]
    fn test_discard_removes_subtree() {
        let mut store = NodeStore::new();
        let root = pending(&mut store);
        let a = pending(&mut store);
        let b = pending(&mut store);
        store.add_child(root, a, 0).unwrap();
        store.add_child(a, b, 0).unwrap();
        store.confirm(b, NodeId(3), 1).unwrap();

        let removed = store.discard(a);
        assert_eq!(removed.len(), 2);
        assert!(removed.iter().all(|n| n.lifecycle == Lifecycle::Deleted));
        assert!(store.children(root).is_empty());
        assert!(store.handle_of(NodeId(3)).is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_move_and_reorder() {
        let mut store = NodeStore::new();
        let root = pending(&mut store);
        let kids: Vec<_> = (0..3).map(|_| pending(&mut store)).collect();
        for (i, k) in kids.iter().enumerate() {
            store.add_child(root, *k, i).unwrap();
        }

        assert!(store.move_child(root, kids[2], 0).unwrap());
        assert_eq!(store.children(root), &[kids[2], kids[0], kids[1]]);
        assert!(!store.move_child(root, kids[2], 0).unwrap());

        store.reorder_children(root, &[kids[1]]).unwrap();
        assert_eq!(store.children(root), &[kids[1], kids[2], kids[0]]);
    }

    #[test]
    fn test_descendants_preorder() {
        let mut store = NodeStore::new();
        let root = pending(&mut store);
        let a = pending(&mut store);
        let a1 = pending(&mut store);
        let b = pending(&mut store);
        store.add_child(root, a, 0).unwrap();
        store.add_child(root, b, 1).unwrap();
        store.add_child(a, a1, 0).unwrap();

        assert_eq!(store.descendants(root), vec![a, a1, b]);
        assert_eq!(store.ancestors(a1), vec![a, root]);
    }
}
