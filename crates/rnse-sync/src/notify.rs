//! Reference & Conflict Notifier.
//!
//! Two independent maps drive notifications:
//! - the broken set: target -> notification, one per broken target
//! - the reference index: target -> owner -> count
//!
//! An owner gets the notification of a broken target while it holds at
//! least one reference to it. Attaching is deferred to the next flush so
//! the owner's local representation exists by the time the UI sees it; a
//! reference added and removed before that flush never attaches anything.

use crate::channel::{LocalContent, NotificationSink};
use rnse_core::{Attributes, ContentChecksum, NodeHandle};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationKind {
    /// A referenced node's content could not be materialized.
    ReferenceBroken,
    /// Local content disagrees with the authority.
    ContentConflict,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Node the notification is about.
    pub target: NodeHandle,
    pub kind: NotificationKind,
    pub message: String,
}

impl Notification {
    pub fn broken(target: NodeHandle, message: impl Into<String>) -> Self {
        Self {
            target,
            kind: NotificationKind::ReferenceBroken,
            message: message.into(),
        }
    }

    pub fn conflict(target: NodeHandle, message: impl Into<String>) -> Self {
        Self {
            target,
            kind: NotificationKind::ContentConflict,
            message: message.into(),
        }
    }
}

/// Count the references per target in one attribute payload.
pub fn reference_counts(attributes: &Attributes) -> BTreeMap<NodeHandle, usize> {
    let mut counts = BTreeMap::new();
    for value in attributes.values() {
        value.for_each_reference(&mut |r| *counts.entry(r.target).or_insert(0) += 1);
    }
    counts
}

/// Which owners hold references to which targets, with multiplicity.
#[derive(Clone, Debug, Default)]
pub struct ReferenceIndex {
    by_target: HashMap<NodeHandle, BTreeMap<NodeHandle, usize>>,
    by_owner: HashMap<NodeHandle, BTreeMap<NodeHandle, usize>>,
}

impl ReferenceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the new count.
    pub fn add(&mut self, owner: NodeHandle, target: NodeHandle) -> usize {
        *self.by_owner.entry(owner).or_default().entry(target).or_insert(0) += 1;
        let count = self.by_target.entry(target).or_default().entry(owner).or_insert(0);
        *count += 1;
        *count
    }

    /// Returns the remaining count; removing an unknown reference is a no-op.
    pub fn remove(&mut self, owner: NodeHandle, target: NodeHandle) -> usize {
        let Some(owners) = self.by_target.get_mut(&target) else {
            return 0;
        };
        let Some(count) = owners.get_mut(&owner) else {
            return 0;
        };
        *count -= 1;
        let remaining = *count;
        if remaining == 0 {
            owners.remove(&owner);
            if owners.is_empty() {
                self.by_target.remove(&target);
            }
        }

        if let Some(targets) = self.by_owner.get_mut(&owner) {
            if remaining == 0 {
                targets.remove(&target);
            } else {
                targets.insert(target, remaining);
            }
            if targets.is_empty() {
                self.by_owner.remove(&owner);
            }
        }
        remaining
    }

    pub fn count(&self, owner: NodeHandle, target: NodeHandle) -> usize {
        self.by_target
            .get(&target)
            .and_then(|owners| owners.get(&owner))
            .copied()
            .unwrap_or(0)
    }

    /// Owners referencing `target`, sorted.
    pub fn referrers(&self, target: NodeHandle) -> Vec<NodeHandle> {
        self.by_target
            .get(&target)
            .map(|owners| owners.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_referenced(&self, target: NodeHandle) -> bool {
        self.by_target.contains_key(&target)
    }

    pub fn targets_of(&self, owner: NodeHandle) -> BTreeMap<NodeHandle, usize> {
        self.by_owner.get(&owner).cloned().unwrap_or_default()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum SinkEvent {
    Attach(NodeHandle, Notification),
    Detach(NodeHandle, Notification),
}

#[derive(Clone, Debug, Default)]
pub struct ReferenceNotifier {
    index: ReferenceIndex,
    broken: HashMap<NodeHandle, Notification>,
    /// target -> owners currently showing its notification.
    attached: HashMap<NodeHandle, BTreeSet<NodeHandle>>,
    /// (owner, target) pairs waiting for the next flush.
    deferred: Vec<(NodeHandle, NodeHandle)>,
    conflicts: HashMap<NodeHandle, Notification>,
    outbox: Vec<SinkEvent>,
    auto_clear: bool,
}

impl ReferenceNotifier {
    /// With `auto_clear`, a broken target is cleared once the last
    /// reference to it goes away.
    pub fn new(auto_clear: bool) -> Self {
        Self {
            auto_clear,
            ..Default::default()
        }
    }

    pub fn index(&self) -> &ReferenceIndex {
        &self.index
    }

    pub fn referrers(&self, target: NodeHandle) -> Vec<NodeHandle> {
        self.index.referrers(target)
    }

    pub fn is_broken(&self, target: NodeHandle) -> bool {
        self.broken.contains_key(&target)
    }

    pub fn is_attached(&self, owner: NodeHandle, target: NodeHandle) -> bool {
        self.attached
            .get(&target)
            .is_some_and(|owners| owners.contains(&owner))
    }

    pub fn has_pending_attaches(&self) -> bool {
        !self.deferred.is_empty()
    }

    /// Bring the index in line with the references now held in `owner`'s
    /// attributes.
    pub fn sync_references(&mut self, owner: NodeHandle, attributes: &Attributes) {
        let before = self.index.targets_of(owner);
        let after = reference_counts(attributes);

        for (target, old) in &before {
            let new = after.get(target).copied().unwrap_or(0);
            for _ in new..*old {
                self.remove_reference(owner, *target);
            }
        }
        for (target, new) in &after {
            let old = before.get(target).copied().unwrap_or(0);
            for _ in old..*new {
                self.add_reference(owner, *target);
            }
        }
    }

    pub fn add_reference(&mut self, owner: NodeHandle, target: NodeHandle) {
        let count = self.index.add(owner, target);
        if count == 1 && self.broken.contains_key(&target) && !self.is_attached(owner, target) {
            self.deferred.push((owner, target));
        }
    }

    pub fn remove_reference(&mut self, owner: NodeHandle, target: NodeHandle) {
        if self.index.remove(owner, target) > 0 {
            return;
        }
        self.deferred.retain(|pair| *pair != (owner, target));
        self.detach(owner, target);

        if self.auto_clear && !self.index.is_referenced(target) && self.broken.contains_key(&target) {
            self.clear_broken(target);
        }
    }

    fn detach(&mut self, owner: NodeHandle, target: NodeHandle) {
        let Some(owners) = self.attached.get_mut(&target) else {
            return;
        };
        if !owners.remove(&owner) {
            return;
        }
        if owners.is_empty() {
            self.attached.remove(&target);
        }
        if let Some(notification) = self.broken.get(&target) {
            self.outbox.push(SinkEvent::Detach(owner, notification.clone()));
        }
    }

    /// Mark `target` broken; every current referrer gets the notification
    /// at the next flush.
    pub fn mark_broken(&mut self, target: NodeHandle, message: impl Into<String>) {
        if self.broken.contains_key(&target) {
            return;
        }
        self.broken
            .insert(target, Notification::broken(target, message));
        for owner in self.index.referrers(target) {
            self.deferred.push((owner, target));
        }
    }

    /// The target became available again: detach from every owner.
    pub fn clear_broken(&mut self, target: NodeHandle) {
        let owners = self.attached.remove(&target).unwrap_or_default();
        self.deferred.retain(|(_, t)| *t != target);
        if let Some(notification) = self.broken.remove(&target) {
            for owner in owners {
                self.outbox
                    .push(SinkEvent::Detach(owner, notification.clone()));
            }
        }
    }

    /// Attach a persistent conflict notification to `node`.
    pub fn raise_conflict(&mut self, node: NodeHandle, message: impl Into<String>) -> Notification {
        let notification = Notification::conflict(node, message);
        if let Some(previous) = self.conflicts.insert(node, notification.clone()) {
            self.outbox.push(SinkEvent::Detach(node, previous));
        }
        self.outbox
            .push(SinkEvent::Attach(node, notification.clone()));
        notification
    }

    pub fn conflict(&self, node: NodeHandle) -> Option<&Notification> {
        self.conflicts.get(&node)
    }

    /// A node left the store: drop the references it held, its conflict,
    /// and its own broken state.
    pub fn remove_node(&mut self, node: NodeHandle) {
        for (target, count) in self.index.targets_of(node) {
            for _ in 0..count {
                self.remove_reference(node, target);
            }
        }
        if let Some(notification) = self.conflicts.remove(&node) {
            self.outbox.push(SinkEvent::Detach(node, notification));
        }
        self.clear_broken(node);
    }

    /// Deliver queued detaches, then attach deferred notifications whose
    /// target is still broken and still referenced by the owner.
    pub fn flush(&mut self, sink: &mut dyn NotificationSink) -> usize {
        let mut delivered = 0;
        for event in std::mem::take(&mut self.outbox) {
            match event {
                SinkEvent::Attach(owner, notification) => {
                    sink.on_notification_attached(owner, &notification)
                }
                SinkEvent::Detach(owner, notification) => {
                    sink.on_notification_detached(owner, &notification)
                }
            }
            delivered += 1;
        }

        for (owner, target) in std::mem::take(&mut self.deferred) {
            let Some(notification) = self.broken.get(&target) else {
                continue;
            };
            if self.index.count(owner, target) == 0 || self.is_attached(owner, target) {
                continue;
            }
            self.attached.entry(target).or_default().insert(owner);
            sink.on_notification_attached(owner, notification);
            delivered += 1;
        }
        delivered
    }
}

/// Result of comparing pre-existing local content with the authority.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentVerdict {
    /// Checksums agree.
    Match,
    /// Checksums differ but the resolved values agree; take the authority's.
    Adopt,
    /// Both differ; the node must stop syncing.
    Conflict,
}

pub fn check_content(
    local: &LocalContent,
    declared: &ContentChecksum,
    authority: &Attributes,
) -> ContentVerdict {
    if ContentChecksum::of(&local.data) == *declared {
        ContentVerdict::Match
    } else if local.attributes == *authority {
        ContentVerdict::Adopt
    } else {
        ContentVerdict::Conflict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rnse_core::{AttributeValue, ReferenceValue};

    #[derive(Default)]
    struct Recorder {
        attached: Vec<(NodeHandle, Notification)>,
        detached: Vec<(NodeHandle, Notification)>,
    }

    impl NotificationSink for Recorder {
        fn on_notification_attached(&mut self, node: NodeHandle, notification: &Notification) {
            self.attached.push((node, notification.clone()));
        }

        fn on_notification_detached(&mut self, node: NodeHandle, notification: &Notification) {
            self.detached.push((node, notification.clone()));
        }
    }

    fn refs(targets: &[NodeHandle]) -> Attributes {
        targets
            .iter()
            .enumerate()
            .map(|(i, t)| (format!("ref{i}"), ReferenceValue::to(*t).into()))
            .collect()
    }

    #[test]
    fn test_attach_is_deferred_to_flush() {
        let mut notifier = ReferenceNotifier::new(false);
        let (owner, target) = (NodeHandle::new(), NodeHandle::new());
        notifier.mark_broken(target, "texture missing");
        notifier.add_reference(owner, target);
        assert!(!notifier.is_attached(owner, target));

        let mut sink = Recorder::default();
        notifier.flush(&mut sink);
        assert_eq!(sink.attached.len(), 1);
        assert_eq!(sink.attached[0].0, owner);
        assert!(notifier.is_attached(owner, target));
    }

    #[test]
    fn test_add_then_remove_before_flush_never_attaches() {
        let mut notifier = ReferenceNotifier::new(false);
        let (owner, target) = (NodeHandle::new(), NodeHandle::new());
        notifier.mark_broken(target, "missing");
        notifier.add_reference(owner, target);
        notifier.remove_reference(owner, target);

        let mut sink = Recorder::default();
        notifier.flush(&mut sink);
        assert!(sink.attached.is_empty());
        assert!(sink.detached.is_empty());
    }

    #[test]
    fn test_shared_notification_and_detach_on_last_reference() {
        let mut notifier = ReferenceNotifier::new(false);
        let target = NodeHandle::new();
        let (a, b) = (NodeHandle::new(), NodeHandle::new());
        notifier.add_reference(a, target);
        notifier.add_reference(a, target);
        notifier.add_reference(b, target);
        notifier.mark_broken(target, "missing");

        let mut sink = Recorder::default();
        notifier.flush(&mut sink);
        assert_eq!(sink.attached.len(), 2);
        assert_eq!(sink.attached[0].1, sink.attached[1].1);

        notifier.remove_reference(a, target);
        notifier.flush(&mut sink);
        assert!(sink.detached.is_empty());

        notifier.remove_reference(a, target);
        notifier.flush(&mut sink);
        assert_eq!(sink.detached.len(), 1);
        assert_eq!(sink.detached[0].0, a);
        assert!(notifier.is_broken(target));
    }

    #[test]
    fn test_auto_clear_when_unreferenced() {
        let mut notifier = ReferenceNotifier::new(true);
        let (owner, target) = (NodeHandle::new(), NodeHandle::new());
        notifier.add_reference(owner, target);
        notifier.mark_broken(target, "missing");
        notifier.flush(&mut Recorder::default());

        notifier.remove_reference(owner, target);
        assert!(!notifier.is_broken(target));
    }

    #[test]
    fn test_clear_broken_detaches_all() {
        let mut notifier = ReferenceNotifier::new(false);
        let target = NodeHandle::new();
        let owners = [NodeHandle::new(), NodeHandle::new()];
        for o in owners {
            notifier.add_reference(o, target);
        }
        notifier.mark_broken(target, "missing");
        let mut sink = Recorder::default();
        notifier.flush(&mut sink);

        notifier.clear_broken(target);
        notifier.flush(&mut sink);
        assert_eq!(sink.detached.len(), 2);
        assert!(!notifier.is_attached(owners[0], target));
    }

    #[test]
    fn test_sync_references_diffs_attributes() {
        let mut notifier = ReferenceNotifier::new(false);
        let owner = NodeHandle::new();
        let (x, y) = (NodeHandle::new(), NodeHandle::new());

        notifier.sync_references(owner, &refs(&[x, x, y]));
        assert_eq!(notifier.index().count(owner, x), 2);
        assert_eq!(notifier.index().count(owner, y), 1);

        notifier.sync_references(owner, &refs(&[y]));
        assert_eq!(notifier.index().count(owner, x), 0);
        assert_eq!(notifier.referrers(y), vec![owner]);
        assert!(notifier.referrers(x).is_empty());
    }

    #[test]
    fn test_conflict_attaches_to_node_itself() {
        let mut notifier = ReferenceNotifier::new(false);
        let node = NodeHandle::new();
        notifier.raise_conflict(node, "content differs");
        let mut sink = Recorder::default();
        notifier.flush(&mut sink);
        assert_eq!(sink.attached[0].1.kind, NotificationKind::ContentConflict);

        notifier.remove_node(node);
        notifier.flush(&mut sink);
        assert_eq!(sink.detached.len(), 1);
    }

    #[test]
    fn test_check_content_verdicts() {
        let mut attrs = Attributes::new();
        attrs.insert("path".into(), AttributeValue::from("rock.png"));
        let local = LocalContent {
            data: b"old bytes".to_vec(),
            attributes: attrs.clone(),
        };

        let same = ContentChecksum::of(b"old bytes");
        assert_eq!(check_content(&local, &same, &attrs), ContentVerdict::Match);

        let other = ContentChecksum::of(b"new bytes");
        assert_eq!(check_content(&local, &other, &attrs), ContentVerdict::Adopt);

        let mut changed = attrs.clone();
        changed.insert("path".into(), AttributeValue::from("stone.png"));
        assert_eq!(
            check_content(&local, &other, &changed),
            ContentVerdict::Conflict
        );
    }
}
