//! In-memory local representation and notification sink.

use crate::channel::{LocalAdapter, LocalContent, NotificationSink};
use crate::notify::Notification;
use rnse_core::{Attributes, NodeHandle, NodeKind, ReplicatedNode};
use std::collections::{HashMap, HashSet};

/// A scene graph held in memory, standing in for an editor's objects.
#[derive(Clone, Debug, Default)]
pub struct MemoryScene {
    children: HashMap<Option<NodeHandle>, Vec<NodeHandle>>,
    parent: HashMap<NodeHandle, Option<NodeHandle>>,
    attributes: HashMap<NodeHandle, Attributes>,
    selected: HashSet<NodeHandle>,
    /// (kind, selector, content): content found on disk for nodes of
    /// `kind` whose attributes contain every selector entry.
    preexisting: Vec<(NodeKind, Attributes, LocalContent)>,
    unmaterializable: HashSet<NodeKind>,
    sent: Vec<(NodeHandle, Attributes)>,
}

impl MemoryScene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, node: NodeHandle) -> bool {
        self.parent.contains_key(&node)
    }

    pub fn len(&self) -> usize {
        self.parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    /// Local children of `parent` (`None` for the roots).
    pub fn order(&self, parent: Option<NodeHandle>) -> Vec<NodeHandle> {
        self.children.get(&parent).cloned().unwrap_or_default()
    }

    pub fn parent_of(&self, node: NodeHandle) -> Option<NodeHandle> {
        self.parent.get(&node).copied().flatten()
    }

    pub fn attributes(&self, node: NodeHandle) -> Option<&Attributes> {
        self.attributes.get(&node)
    }

    /// Add an object at `index` under `parent`, moving it if it exists.
    pub fn insert(&mut self, node: NodeHandle, parent: Option<NodeHandle>, index: usize) {
        self.detach(node);
        let siblings = self.children.entry(parent).or_default();
        let index = index.min(siblings.len());
        siblings.insert(index, node);
        self.parent.insert(node, parent);
    }

    /// Remove an object and everything below it.
    pub fn remove(&mut self, node: NodeHandle) {
        if !self.contains(node) {
            return;
        }
        self.detach(node);
        let mut stack = vec![node];
        while let Some(h) = stack.pop() {
            self.parent.remove(&h);
            self.attributes.remove(&h);
            self.selected.remove(&h);
            if let Some(children) = self.children.remove(&Some(h)) {
                stack.extend(children);
            }
        }
    }

    fn detach(&mut self, node: NodeHandle) {
        if let Some(old) = self.parent.remove(&node) {
            if let Some(siblings) = self.children.get_mut(&old) {
                siblings.retain(|c| *c != node);
            }
        }
    }

    pub fn set_selected(&mut self, node: NodeHandle, selected: bool) {
        if selected {
            self.selected.insert(node);
        } else {
            self.selected.remove(&node);
        }
    }

    pub fn set_attributes(&mut self, node: NodeHandle, attributes: Attributes) {
        self.attributes.insert(node, attributes);
    }

    pub fn add_local_content(&mut self, kind: NodeKind, selector: Attributes, content: LocalContent) {
        self.preexisting.push((kind, selector, content));
    }

    /// Objects of `kind` fail to materialize from now on.
    pub fn fail_kind(&mut self, kind: NodeKind) {
        self.unmaterializable.insert(kind);
    }

    pub fn allow_kind(&mut self, kind: &NodeKind) {
        self.unmaterializable.remove(kind);
    }

    /// Attribute changes handed to the authority so far.
    pub fn take_sent(&mut self) -> Vec<(NodeHandle, Attributes)> {
        std::mem::take(&mut self.sent)
    }
}

impl LocalAdapter for MemoryScene {
    fn local_child_order(&self, parent: NodeHandle) -> Vec<NodeHandle> {
        self.order(Some(parent))
    }

    fn move_local_child(&mut self, child: NodeHandle, index: usize) {
        let Some(parent) = self.parent.get(&child).copied() else {
            return;
        };
        if let Some(siblings) = self.children.get_mut(&parent) {
            siblings.retain(|c| *c != child);
            let index = index.min(siblings.len());
            siblings.insert(index, child);
        }
    }

    fn set_local_parent(&mut self, child: NodeHandle, parent: Option<NodeHandle>) {
        self.insert(child, parent, usize::MAX);
    }

    fn apply_attributes(&mut self, node: NodeHandle, attributes: &Attributes) {
        self.attributes.insert(node, attributes.clone());
    }

    fn send_attribute_changes(&mut self, node: NodeHandle, attributes: &Attributes) {
        self.sent.push((node, attributes.clone()));
    }

    fn is_selected(&self, node: NodeHandle) -> bool {
        self.selected.contains(&node)
    }

    fn local_content(&self, kind: &NodeKind, attributes: &Attributes) -> Option<LocalContent> {
        self.preexisting
            .iter()
            .find(|(k, selector, _)| {
                k == kind && selector.iter().all(|(name, v)| attributes.get(name) == Some(v))
            })
            .map(|(_, _, content)| content.clone())
    }

    fn instantiate(&mut self, node: &ReplicatedNode) -> bool {
        if !self.contains(node.handle) {
            self.insert(node.handle, node.parent, usize::MAX);
        }
        self.attributes.insert(node.handle, node.attributes.clone());
        !self.unmaterializable.contains(&node.kind)
    }

    fn destroy(&mut self, node: NodeHandle) {
        self.remove(node);
    }
}

/// Sink that records what is currently attached where.
#[derive(Clone, Debug, Default)]
pub struct NotificationLog {
    active: Vec<(NodeHandle, Notification)>,
    attached: usize,
    detached: usize,
}

impl NotificationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications currently shown on `node`.
    pub fn on(&self, node: NodeHandle) -> Vec<&Notification> {
        self.active
            .iter()
            .filter(|(n, _)| *n == node)
            .map(|(_, notification)| notification)
            .collect()
    }

    pub fn active(&self) -> usize {
        self.active.len()
    }

    pub fn attached_total(&self) -> usize {
        self.attached
    }

    pub fn detached_total(&self) -> usize {
        self.detached
    }
}

impl NotificationSink for NotificationLog {
    fn on_notification_attached(&mut self, node: NodeHandle, notification: &Notification) {
        self.attached += 1;
        self.active.push((node, notification.clone()));
    }

    fn on_notification_detached(&mut self, node: NodeHandle, notification: &Notification) {
        self.detached += 1;
        if let Some(pos) = self
            .active
            .iter()
            .position(|(n, existing)| *n == node && existing == notification)
        {
            self.active.remove(pos);
        }
    }
}
