//! The synchronization engine.
//!
//! A [`SyncEngine`] owns every piece of per-session state. It is built from
//! a [`SyncConfig`] when the session starts and torn down with
//! [`SyncEngine::shutdown`]; nothing lives outside of it.
//!
//! Work happens in ticks. Authority events are queued with
//! [`SyncEngine::handle_event`] and applied at the start of the next
//! [`SyncEngine::tick`] (inbound phase), after which local changes are
//! detected and sent (outbound phase).

use crate::channel::{AuthorityChannel, AuthorityEvent, LocalAdapter, NotificationSink};
use crate::config::SyncConfig;
use crate::kinds::KindTable;
use crate::lock::{LockClass, LockCommand, LockCoordinator, LockOwner, LockRequestOutcome};
use crate::notify::{check_content, ContentVerdict, ReferenceNotifier};
use crate::order::{AuthoritativeTree, OrderReconciler, PassContext, PendingCreates};
use crate::race::CreationRaceResolver;
use crate::store::NodeStore;
use rnse_core::{
    remote_references, retarget_references, Attributes, ContentChecksum, Lifecycle, LockState,
    NodeFlags, NodeHandle, NodeId, NodeKind, ParticipantId, ReplicatedNode, Result, SyncError,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// What one tick did.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub tick: u64,
    pub events_applied: usize,
    /// Local moves issued by inbound passes.
    pub local_moves: usize,
    /// Structural operations sent to the authority.
    pub authority_ops: usize,
    pub duplicates_resolved: usize,
    pub conflicts: usize,
    pub forced_passes: usize,
}

/// Outcome of a local delete request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Never sent to the authority; dropped locally.
    Discarded,
    /// Will be sent in the next outbound phase.
    Queued,
    /// The create is still in flight; deleted once confirmed.
    Deferred,
    /// Locked by someone else; the local object was recreated instead.
    Recreated,
}

pub struct SyncEngine {
    config: SyncConfig,
    kinds: KindTable,
    store: NodeStore,
    tree: AuthoritativeTree,
    locks: LockCoordinator,
    reconciler: OrderReconciler,
    creates: PendingCreates,
    races: CreationRaceResolver,
    notifier: ReferenceNotifier,
    inbox: VecDeque<AuthorityEvent>,
    /// Parents whose authoritative order changed.
    inbound_dirty: BTreeSet<NodeHandle>,
    /// Parents whose local order changed.
    outbound_dirty: BTreeSet<NodeHandle>,
    attribute_dirty: BTreeSet<NodeHandle>,
    /// Local deletes not sent yet.
    delete_queue: BTreeSet<NodeHandle>,
    delete_on_confirm: BTreeSet<NodeHandle>,
    deletes_in_flight: HashSet<NodeHandle>,
    /// Deletes retracted after they were sent.
    retracted: HashSet<NodeHandle>,
    subscriptions: Vec<(NodeHandle, bool)>,
    subscribed: BTreeSet<NodeHandle>,
    /// Owners holding id-form references to nodes not known locally yet.
    unresolved: HashMap<NodeId, BTreeSet<NodeHandle>>,
    /// Nodes whose local object could not be materialized.
    unmaterialized: HashSet<NodeHandle>,
    tick: u64,
}

impl SyncEngine {
    pub fn new(config: SyncConfig) -> Self {
        let kinds = KindTable::from_config(&config);
        let notifier = ReferenceNotifier::new(config.auto_clear_broken);
        SyncEngine {
            config,
            kinds,
            store: NodeStore::new(),
            tree: AuthoritativeTree::new(),
            locks: LockCoordinator::new(),
            reconciler: OrderReconciler::new(),
            creates: PendingCreates::default(),
            races: CreationRaceResolver::new(),
            notifier,
            inbox: VecDeque::new(),
            inbound_dirty: BTreeSet::new(),
            outbound_dirty: BTreeSet::new(),
            attribute_dirty: BTreeSet::new(),
            delete_queue: BTreeSet::new(),
            delete_on_confirm: BTreeSet::new(),
            deletes_in_flight: HashSet::new(),
            retracted: HashSet::new(),
            subscriptions: Vec::new(),
            subscribed: BTreeSet::new(),
            unresolved: HashMap::new(),
            unmaterialized: HashSet::new(),
            tick: 0,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.config.participant
    }

    pub fn store(&self) -> &NodeStore {
        &self.store
    }

    pub fn tree(&self) -> &AuthoritativeTree {
        &self.tree
    }

    pub fn notifier(&self) -> &ReferenceNotifier {
        &self.notifier
    }

    pub fn get(&self, handle: NodeHandle) -> Option<&ReplicatedNode> {
        self.store.get(handle)
    }

    pub fn handle_of(&self, id: NodeId) -> Option<NodeHandle> {
        self.store.handle_of(id)
    }

    pub fn lock_state(&self, handle: NodeHandle) -> Option<LockState> {
        self.locks.lock_state(&self.store, handle)
    }

    pub fn classify(&self, handle: NodeHandle) -> LockClass {
        self.locks.classify(&self.store, handle)
    }

    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    /// Whether a tick would have anything to do.
    pub fn has_pending_work(&self) -> bool {
        !self.inbox.is_empty()
            || !self.inbound_dirty.is_empty()
            || !self.outbound_dirty.is_empty()
            || !self.attribute_dirty.is_empty()
            || !self.delete_queue.is_empty()
            || !self.subscriptions.is_empty()
            || self.notifier.has_pending_attaches()
            || self.reconciler.has_forced()
            || self.locks.has_commands()
            || self.store.roots().into_iter().any(|h| self.is_unsent(h))
    }

    /// Queue an authority event for the next tick.
    pub fn handle_event(&mut self, event: AuthorityEvent) {
        self.inbox.push_back(event);
    }

    // === Local operations ===

    /// Register a node created locally. The local object must already
    /// exist under `parent` at `index`; it is sent with the next tick.
    pub fn create_local(
        &mut self,
        kind: NodeKind,
        attributes: Attributes,
        parent: Option<NodeHandle>,
        index: usize,
        flags: NodeFlags,
    ) -> Result<NodeHandle> {
        if let Some(p) = parent {
            self.check_live(p, "create_local under")?;
            self.check_structural(p)?;
        }

        let mut node = ReplicatedNode::pending(kind, attributes, flags);
        node.entity_key = self.kinds.entity_key(&node.kind, &node.attributes);
        let key = node.entity_key.clone();
        let handle = self.store.insert(node)?;
        if let Some(p) = parent {
            self.store.add_child(p, handle, index)?;
            self.outbound_dirty.insert(p);
        }
        if let Some(key) = key {
            self.races.track(key, handle);
        }
        if let Some(node) = self.store.get(handle) {
            self.notifier.sync_references(handle, &node.attributes);
        }
        Ok(handle)
    }

    /// The local order (or membership) of `parent`'s children changed.
    pub fn mark_local_change(&mut self, parent: NodeHandle) {
        if self.store.contains(parent) {
            self.outbound_dirty.insert(parent);
        }
    }

    /// Apply a local attribute write. A write to a node locked by another
    /// participant is reverted to the last confirmed values.
    pub fn set_attributes(
        &mut self,
        handle: NodeHandle,
        attributes: Attributes,
        adapter: &mut dyn LocalAdapter,
    ) -> Result<()> {
        let node = self.check_live(handle, "set_attributes")?;
        if node.conflicting {
            return Err(SyncError::ContentConflict { handle });
        }
        if let Err(err) = self.locks.check_writable(&self.store, handle) {
            tracing::warn!(node = %handle, %err, "attribute write reverted");
            adapter.apply_attributes(handle, &node.attributes);
            return Err(err);
        }
        self.replace_attributes(handle, attributes);
        self.attribute_dirty.insert(handle);
        Ok(())
    }

    fn replace_attributes(&mut self, handle: NodeHandle, attributes: Attributes) {
        let Some(kind) = self.store.get(handle).map(|n| n.kind.clone()) else {
            return;
        };
        let key = self.kinds.entity_key(&kind, &attributes);
        self.notifier.sync_references(handle, &attributes);
        let Some(node) = self.store.get_mut(handle) else {
            return;
        };
        node.attributes = attributes;
        if node.entity_key != key {
            if let Some(old) = node.entity_key.take() {
                self.races.untrack(&old, handle);
            }
            node.entity_key = key.clone();
            if let Some(key) = key {
                self.races.track(key, handle);
            }
        }
    }

    /// Ask for the deletion of a node whose local object was removed.
    pub fn request_delete(
        &mut self,
        handle: NodeHandle,
        adapter: &mut dyn LocalAdapter,
    ) -> Result<DeleteOutcome> {
        self.check_live(handle, "request_delete")?;
        if self.classify(handle) != LockClass::Free {
            self.recreate_local(handle, adapter);
            tracing::info!(node = %handle, "delete of locked node turned into recreate");
            return Ok(DeleteOutcome::Recreated);
        }
        Ok(self.delete_node(handle, adapter))
    }

    fn delete_node(&mut self, handle: NodeHandle, adapter: &mut dyn LocalAdapter) -> DeleteOutcome {
        let Some(node) = self.store.get(handle) else {
            return DeleteOutcome::Discarded;
        };
        let parent = node.parent;
        if node.id.is_some() {
            self.mark_delete_pending(handle);
            self.delete_queue.insert(handle);
            DeleteOutcome::Queued
        } else if self.creates.is_in_flight(handle) {
            self.mark_delete_pending(handle);
            self.delete_on_confirm.insert(handle);
            DeleteOutcome::Deferred
        } else {
            let removed = self.store.discard(handle);
            self.forget_removed(removed, adapter);
            if let Some(p) = parent {
                self.outbound_dirty.insert(p);
            }
            DeleteOutcome::Discarded
        }
    }

    fn mark_delete_pending(&mut self, handle: NodeHandle) {
        if let Err(err) = self.store.set_lifecycle(handle, Lifecycle::DeletePending) {
            tracing::warn!(node = %handle, %err, "could not mark node for deletion");
        }
    }

    fn recreate_local(&mut self, handle: NodeHandle, adapter: &mut dyn LocalAdapter) {
        let subtree: Vec<NodeHandle> = std::iter::once(handle)
            .chain(self.store.descendants(handle))
            .collect();
        for h in &subtree {
            self.materialize(*h, adapter);
            self.inbound_dirty.insert(*h);
        }
        if let Some(p) = self.store.parent(handle) {
            self.inbound_dirty.insert(p);
        }
    }

    /// Withdraw a delete. Before it is sent nothing happens; after it is
    /// sent the node is recreated once the delete is confirmed.
    pub fn retract_delete(&mut self, handle: NodeHandle) -> Result<bool> {
        let node = self
            .store
            .get(handle)
            .ok_or(SyncError::NodeNotFound(handle))?;
        if node.lifecycle != Lifecycle::DeletePending {
            return Ok(false);
        }
        if self.delete_queue.remove(&handle) {
            self.store.set_lifecycle(handle, Lifecycle::Syncing)?;
        } else if self.delete_on_confirm.remove(&handle) {
            self.store.set_lifecycle(handle, Lifecycle::Pending)?;
        } else if self.deletes_in_flight.contains(&handle) {
            self.retracted.insert(handle);
        } else {
            return Ok(false);
        }
        if let Some(p) = self.store.parent(handle) {
            self.outbound_dirty.insert(p);
        }
        Ok(true)
    }

    pub fn request_lock(&mut self, handle: NodeHandle) -> Result<LockRequestOutcome> {
        self.locks.request_lock(&mut self.store, handle)
    }

    pub fn release_lock(&mut self, handle: NodeHandle) -> Result<()> {
        self.locks.release_lock(&mut self.store, handle)
    }

    pub fn retract_lock_request(&mut self, handle: NodeHandle) {
        self.locks.retract_request(&mut self.store, handle);
    }

    /// Ask the authority for the children of a subscription-gated node.
    pub fn subscribe(&mut self, handle: NodeHandle) -> Result<()> {
        self.check_live(handle, "subscribe")?;
        if self.subscribed.insert(handle) {
            self.subscriptions.push((handle, true));
        }
        Ok(())
    }

    /// Stop receiving the children of `handle` and drop the local copies.
    pub fn unsubscribe(&mut self, handle: NodeHandle, adapter: &mut dyn LocalAdapter) -> Result<()> {
        self.check_live(handle, "unsubscribe")?;
        if !self.subscribed.remove(&handle) {
            return Ok(());
        }
        self.subscriptions.push((handle, false));
        for child in self.store.children(handle).to_vec() {
            let removed = self.store.discard(child);
            self.forget_removed(removed, adapter);
        }
        Ok(())
    }

    /// Mark `target`'s content as unavailable.
    pub fn mark_broken(&mut self, target: NodeHandle, message: impl Into<String>) {
        self.notifier.mark_broken(target, message);
    }

    pub fn clear_broken(&mut self, target: NodeHandle) {
        self.notifier.clear_broken(target);
    }

    /// Re-apply the authoritative order to every known parent next tick.
    pub fn request_full_resync(&mut self) {
        let parents: Vec<NodeHandle> = self
            .store
            .iter()
            .filter(|n| !self.tree.children(n.handle).is_empty() || !n.children.is_empty())
            .map(|n| n.handle)
            .collect();
        self.inbound_dirty.extend(parents);
    }

    /// End the session: remove the local objects of transient nodes.
    /// Returns how many were removed.
    pub fn shutdown(self, adapter: &mut dyn LocalAdapter) -> usize {
        let transient: Vec<NodeHandle> = self
            .store
            .iter()
            .filter(|n| n.flags.transient)
            .map(|n| n.handle)
            .collect();
        for h in &transient {
            adapter.destroy(*h);
        }
        tracing::debug!(
            participant = %self.config.participant,
            transient = transient.len(),
            "engine shut down"
        );
        transient.len()
    }

    fn check_live(&self, handle: NodeHandle, operation: &'static str) -> Result<&ReplicatedNode> {
        let node = self
            .store
            .get(handle)
            .ok_or(SyncError::NodeNotFound(handle))?;
        if !node.lifecycle.is_live() {
            tracing::warn!(node = %handle, lifecycle = ?node.lifecycle, operation, "operation dropped");
            return Err(SyncError::InvalidState {
                handle,
                lifecycle: node.lifecycle,
                operation,
            });
        }
        Ok(node)
    }

    fn check_structural(&self, handle: NodeHandle) -> Result<()> {
        match self.locks.effective_owner(&self.store, handle) {
            Some(LockOwner::Other(owner)) => Err(SyncError::LockConflict { handle, owner }),
            _ => Ok(()),
        }
    }

    /// Create (or refresh) the local object of `handle`. A failure marks the
    /// node broken; a later success clears that again.
    fn materialize(&mut self, handle: NodeHandle, adapter: &mut dyn LocalAdapter) {
        let Some(node) = self.store.get(handle) else {
            return;
        };
        if adapter.instantiate(node) {
            if self.unmaterialized.remove(&handle) {
                tracing::debug!(node = %handle, "materialized after earlier failure");
                self.notifier.clear_broken(handle);
            }
        } else {
            let message = format!("could not materialize {}", node.kind);
            self.unmaterialized.insert(handle);
            self.notifier.mark_broken(handle, message);
        }
    }

    /// Record the id-form references in `owner`'s attributes that still
    /// wait for their target.
    fn track_unresolved(&mut self, owner: NodeHandle) {
        let Some(node) = self.store.get(owner) else {
            return;
        };
        for id in remote_references(&node.attributes) {
            self.unresolved.entry(id).or_default().insert(owner);
        }
    }

    /// `id` just arrived: point the references waiting for it at `target`.
    fn resolve_references_to(&mut self, id: NodeId, target: NodeHandle, adapter: &mut dyn LocalAdapter) {
        let Some(owners) = self.unresolved.remove(&id) else {
            return;
        };
        for owner in owners {
            let Some(node) = self.store.get(owner) else {
                continue;
            };
            let attributes = self.store.local_attributes(&node.attributes);
            if attributes == node.attributes {
                continue;
            }
            tracing::debug!(node = %owner, target = %target, "reference resolved");
            adapter.apply_attributes(owner, &attributes);
            self.replace_attributes(owner, attributes);
        }
    }

    fn forget_removed(&mut self, removed: Vec<ReplicatedNode>, adapter: &mut dyn LocalAdapter) {
        for node in removed {
            let h = node.handle;
            adapter.destroy(h);
            self.tree.remove(h);
            self.notifier.remove_node(h);
            if self.notifier.index().is_referenced(h) {
                self.notifier.mark_broken(h, format!("{} {} was deleted", node.kind, h));
            }
            if let Some(key) = &node.entity_key {
                self.races.untrack(key, h);
            }
            self.locks.forget(h);
            self.creates.forget(h);
            self.inbound_dirty.remove(&h);
            self.outbound_dirty.remove(&h);
            self.attribute_dirty.remove(&h);
            self.delete_queue.remove(&h);
            self.delete_on_confirm.remove(&h);
            self.deletes_in_flight.remove(&h);
            self.retracted.remove(&h);
            self.subscribed.remove(&h);
            self.unmaterialized.remove(&h);
        }
    }

    // === Tick ===

    /// Run one tick: apply queued authority events, then send local
    /// changes through `channel`.
    pub fn tick(
        &mut self,
        adapter: &mut dyn LocalAdapter,
        channel: &mut dyn AuthorityChannel,
        sink: &mut dyn NotificationSink,
    ) -> TickReport {
        self.tick += 1;
        let mut report = TickReport {
            tick: self.tick,
            ..Default::default()
        };

        self.inbound_phase(adapter, sink, &mut report);
        self.outbound_phase(adapter, channel, &mut report);

        let forced = self.reconciler.take_forced();
        for parent in forced {
            self.outbound_dirty.remove(&parent);
            let mut ctx = PassContext {
                store: &mut self.store,
                tree: &self.tree,
                locks: &self.locks,
                adapter: &mut *adapter,
            };
            let outcome = self
                .reconciler
                .reconcile_inbound(parent, &mut ctx, &BTreeSet::new());
            report.local_moves += outcome.moves;
            report.forced_passes += 1;
            self.inbound_dirty.extend(outcome.deferred);
        }

        if report.events_applied + report.local_moves + report.authority_ops > 0 {
            tracing::debug!(?report, "tick");
        }
        report
    }

    fn inbound_phase(
        &mut self,
        adapter: &mut dyn LocalAdapter,
        sink: &mut dyn NotificationSink,
        report: &mut TickReport,
    ) {
        self.notifier.flush(sink);

        while let Some(event) = self.inbox.pop_front() {
            if let Err(err) = self.apply_event(event, adapter, report) {
                tracing::warn!(%err, "authority event dropped");
            }
            report.events_applied += 1;
        }

        let mut queue: Vec<NodeHandle> = std::mem::take(&mut self.inbound_dirty).into_iter().collect();
        let mut done = BTreeSet::new();
        let mut retained = BTreeSet::new();
        while let Some(parent) = queue.pop() {
            if !done.insert(parent) {
                continue;
            }
            if self.outbound_dirty.contains(&parent) {
                if self.classify(parent) != LockClass::Full {
                    retained.insert(parent);
                    continue;
                }
                self.outbound_dirty.remove(&parent);
            }
            let mut ctx = PassContext {
                store: &mut self.store,
                tree: &self.tree,
                locks: &self.locks,
                adapter: &mut *adapter,
            };
            let outcome = self
                .reconciler
                .reconcile_inbound(parent, &mut ctx, &self.outbound_dirty);
            report.local_moves += outcome.moves;
            queue.extend(outcome.deferred);
        }
        self.inbound_dirty = retained;
    }

    fn apply_event(
        &mut self,
        event: AuthorityEvent,
        adapter: &mut dyn LocalAdapter,
        report: &mut TickReport,
    ) -> Result<()> {
        match event {
            AuthorityEvent::Created {
                id,
                seq,
                origin,
                kind,
                attributes,
                flags,
                parent,
                index,
                checksum,
            } => {
                let parent = match parent {
                    Some(p) => match self.store.handle_of(p) {
                        Some(h) => Some(h),
                        None => {
                            tracing::debug!(node = %id, parent = %p, "create under unknown parent ignored");
                            return Ok(());
                        }
                    },
                    None => None,
                };
                if let Some(origin) = origin.filter(|o| self.store.get(*o).is_some_and(|n| n.id.is_none())) {
                    return self.confirm_local(origin, id, seq, parent, index);
                }
                if self.store.handle_of(id).is_some() {
                    return Ok(());
                }
                let created = RemoteCreate {
                    id,
                    seq,
                    kind,
                    attributes: self.store.local_attributes(&attributes),
                    flags,
                    parent,
                    index,
                    checksum,
                };
                self.insert_remote(created, adapter, report)
            }
            AuthorityEvent::Deleted { id } => {
                let Some(handle) = self.store.handle_of(id) else {
                    return Ok(());
                };
                self.deletes_in_flight.remove(&handle);
                if self.retracted.remove(&handle) {
                    return self.revive(handle);
                }
                let old_parent = self.store.parent(handle);
                let removed = self.store.discard(handle);
                self.forget_removed(removed, adapter);
                if let Some(p) = old_parent {
                    self.inbound_dirty.insert(p);
                }
                Ok(())
            }
            AuthorityEvent::ParentChanged { id, parent, index } => {
                let Some(handle) = self.store.handle_of(id) else {
                    return Ok(());
                };
                let new_parent = match parent {
                    Some(p) => match self.store.handle_of(p) {
                        Some(h) => Some(h),
                        None => {
                            tracing::debug!(node = %handle, parent = %p, "move under unknown parent ignored");
                            return Ok(());
                        }
                    },
                    None => None,
                };
                let old_parent = self.tree.parent(handle);
                if !self.tree.place(handle, new_parent, index) {
                    return Ok(());
                }
                if let Some(Some(p)) = old_parent {
                    self.inbound_dirty.insert(p);
                }
                match new_parent {
                    Some(p) => {
                        self.inbound_dirty.insert(p);
                    }
                    None => {
                        if let Some(local) = self.store.parent(handle) {
                            adapter.set_local_parent(handle, None);
                            self.store.remove_child(local, handle)?;
                        }
                    }
                }
                Ok(())
            }
            AuthorityEvent::Locked { id, owner } => {
                let Some(handle) = self.store.handle_of(id) else {
                    return Ok(());
                };
                let owner = if owner == self.config.participant {
                    LockOwner::Local
                } else {
                    LockOwner::Other(owner)
                };
                self.locks.on_granted(&mut self.store, handle, owner);
                Ok(())
            }
            AuthorityEvent::Unlocked { id } => {
                if let Some(handle) = self.store.handle_of(id) {
                    self.locks.on_released(&mut self.store, handle);
                }
                Ok(())
            }
            AuthorityEvent::PropertyChanged { id, attributes } => {
                let Some(handle) = self.store.handle_of(id) else {
                    return Ok(());
                };
                let node = self.check_live(handle, "apply property change")?;
                if node.conflicting {
                    tracing::debug!(node = %handle, "property change on conflicting node ignored");
                    return Ok(());
                }
                let attributes = self.store.local_attributes(&attributes);
                if node.attributes == attributes {
                    return Ok(());
                }
                adapter.apply_attributes(handle, &attributes);
                self.replace_attributes(handle, attributes);
                self.track_unresolved(handle);
                if self.unmaterialized.contains(&handle) {
                    self.materialize(handle, adapter);
                }
                Ok(())
            }
            AuthorityEvent::ParticipantLeft { participant } => {
                let fired = self.locks.on_participant_left(&mut self.store, &participant);
                tracing::debug!(%participant, fired = fired.len(), "participant left");
                Ok(())
            }
        }
    }

    fn confirm_local(
        &mut self,
        handle: NodeHandle,
        id: NodeId,
        seq: u64,
        parent: Option<NodeHandle>,
        index: usize,
    ) -> Result<()> {
        self.store.confirm(handle, id, seq)?;
        if self.creates.confirmed(handle) {
            // Created with references to nodes that had no id yet.
            self.attribute_dirty.insert(handle);
        }
        self.tree.place(handle, parent, index);
        // Children created meanwhile can be sent now.
        self.outbound_dirty.insert(handle);
        if let Some(p) = parent {
            self.inbound_dirty.insert(p);
        }
        if let Some(key) = self.store.get(handle).and_then(|n| n.entity_key.clone()) {
            self.races.touch(&key);
        }
        if self.delete_on_confirm.remove(&handle) {
            self.store.set_lifecycle(handle, Lifecycle::DeletePending)?;
            self.delete_queue.insert(handle);
        }
        Ok(())
    }

    fn insert_remote(
        &mut self,
        created: RemoteCreate,
        adapter: &mut dyn LocalAdapter,
        report: &mut TickReport,
    ) -> Result<()> {
        let RemoteCreate {
            id,
            seq,
            kind,
            attributes,
            flags,
            parent,
            index,
            checksum,
        } = created;

        let mut node = ReplicatedNode::confirmed(id, seq, kind, attributes, flags);
        node.entity_key = self.kinds.entity_key(&node.kind, &node.attributes);

        if let Some(declared) = checksum.filter(|_| self.kinds.checks_content(&node.kind)) {
            if let Some(local) = adapter.local_content(&node.kind, &node.attributes) {
                match check_content(&local, &declared, &node.attributes) {
                    ContentVerdict::Match => {}
                    ContentVerdict::Adopt => {
                        tracing::debug!(node = %id, "checksum differs, values agree; adopting");
                    }
                    ContentVerdict::Conflict => {
                        tracing::warn!(
                            node = %id,
                            declared = %declared.short(),
                            local = %ContentChecksum::of(&local.data).short(),
                            "content conflict, node excluded from sync"
                        );
                        node.conflicting = true;
                        node.attributes = local.attributes;
                        report.conflicts += 1;
                    }
                }
            }
        }

        let key = node.entity_key.clone();
        let handle = self.store.insert(node)?;
        if let Some(p) = parent {
            self.store.add_child(p, handle, usize::MAX)?;
            self.inbound_dirty.insert(p);
        }
        self.tree.place(handle, parent, index);

        let Some(node) = self.store.get(handle) else {
            return Ok(());
        };
        if node.conflicting {
            self.notifier.raise_conflict(
                handle,
                format!("local {} differs from the session copy", node.kind),
            );
        }
        let attributes = node.attributes.clone();
        self.materialize(handle, adapter);
        self.notifier.sync_references(handle, &attributes);
        self.track_unresolved(handle);
        self.resolve_references_to(id, handle, adapter);
        if let Some(key) = key {
            self.races.track(key, handle);
        }
        Ok(())
    }

    /// A delete retracted after sending was confirmed: turn the subtree
    /// back into pending nodes that offer their old ids for reuse.
    fn revive(&mut self, handle: NodeHandle) -> Result<()> {
        let subtree: Vec<NodeHandle> = std::iter::once(handle)
            .chain(self.store.descendants(handle))
            .collect();
        for h in &subtree {
            self.tree.remove(*h);
            if let Some(old) = self.store.reset_to_pending(*h)? {
                self.creates.offer_reuse(*h, old);
            }
            self.locks.forget(*h);
            self.outbound_dirty.insert(*h);
        }
        if let Some(p) = self.store.parent(handle) {
            self.outbound_dirty.insert(p);
        }
        tracing::debug!(node = %handle, nodes = subtree.len(), "retracted delete, recreating");
        Ok(())
    }

    fn outbound_phase(
        &mut self,
        adapter: &mut dyn LocalAdapter,
        channel: &mut dyn AuthorityChannel,
        report: &mut TickReport,
    ) {
        self.resolve_races(adapter, report);

        // Root creates go out as one batch appended to the roots.
        let roots: Vec<NodeHandle> = self
            .store
            .roots()
            .into_iter()
            .filter(|h| self.is_unsent(*h))
            .collect();
        if !roots.is_empty() {
            self.creates
                .send(&self.store, &roots, None, self.tree.roots().len(), channel);
            report.authority_ops += 1;
        }

        let mut waiting = BTreeSet::new();
        for parent in std::mem::take(&mut self.outbound_dirty) {
            let mut ctx = PassContext {
                store: &mut self.store,
                tree: &self.tree,
                locks: &self.locks,
                adapter: &mut *adapter,
            };
            let outcome =
                self.reconciler
                    .reconcile_outbound(parent, &mut ctx, &mut self.creates, channel);
            if outcome.waiting {
                waiting.insert(parent);
            }
            report.authority_ops += outcome.moves + outcome.reparented;
            if outcome.created > 0 {
                report.authority_ops += 1;
            }
        }
        self.outbound_dirty = waiting;

        let mut unsent = BTreeSet::new();
        for handle in std::mem::take(&mut self.attribute_dirty) {
            let Some(node) = self.store.get(handle) else {
                continue;
            };
            if node.is_synced() {
                let (attributes, held) = self.store.session_attributes(&node.attributes);
                if held > 0 {
                    // Sent once every referenced node has an id.
                    unsent.insert(handle);
                } else {
                    adapter.send_attribute_changes(handle, &attributes);
                }
            } else if node.lifecycle == Lifecycle::Pending && !node.conflicting {
                unsent.insert(handle);
            }
        }
        self.attribute_dirty = unsent;

        for handle in std::mem::take(&mut self.delete_queue) {
            if let Some(id) = self.store.id_of(handle) {
                channel.delete(id);
                self.deletes_in_flight.insert(handle);
                report.authority_ops += 1;
            }
        }

        let mut later = Vec::new();
        for command in self.locks.take_commands() {
            let handle = match command {
                LockCommand::Request(h) | LockCommand::Release(h) => h,
            };
            match self.store.id_of(handle) {
                Some(id) => match command {
                    LockCommand::Request(_) => channel.lock(id),
                    LockCommand::Release(_) => channel.unlock(id),
                },
                None if self.store.contains(handle) => later.push(command),
                None => {}
            }
        }
        self.locks.requeue(later);

        let mut pending = Vec::new();
        for (handle, on) in std::mem::take(&mut self.subscriptions) {
            match self.store.id_of(handle) {
                Some(id) if on => channel.subscribe(id),
                Some(id) => channel.unsubscribe(id),
                None if self.store.contains(handle) => pending.push((handle, on)),
                None => {}
            }
        }
        self.subscriptions = pending;
    }

    fn is_unsent(&self, handle: NodeHandle) -> bool {
        self.store.get(handle).is_some_and(|n| {
            n.lifecycle == Lifecycle::Pending && !n.conflicting && n.parent.is_none()
        }) && !self.creates.is_in_flight(handle)
    }

    fn resolve_races(&mut self, adapter: &mut dyn LocalAdapter, report: &mut TickReport) {
        for resolution in self.races.resolve(&self.store) {
            let (loser, survivor) = (resolution.loser, resolution.survivor);
            for owner in self.notifier.referrers(loser) {
                let Some(node) = self.store.get(owner) else {
                    continue;
                };
                let mut attributes = node.attributes.clone();
                if retarget_references(&mut attributes, loser, survivor) == 0 {
                    continue;
                }
                adapter.apply_attributes(owner, &attributes);
                self.replace_attributes(owner, attributes);
                self.attribute_dirty.insert(owner);
            }
            if self.store.get(loser).is_some_and(|n| n.lifecycle.is_live()) {
                adapter.destroy(loser);
                self.delete_node(loser, adapter);
            }
            let err = SyncError::DuplicateCreation {
                key: resolution.key,
                survivor,
                loser,
            };
            tracing::info!(%err, "references retargeted");
            report.duplicates_resolved += 1;
        }
    }
}

struct RemoteCreate {
    id: NodeId,
    seq: u64,
    kind: NodeKind,
    attributes: Attributes,
    flags: NodeFlags,
    parent: Option<NodeHandle>,
    index: usize,
    checksum: Option<ContentChecksum>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("participant", &self.config.participant)
            .field("nodes", &self.store.len())
            .field("tick", &self.tick)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{AuthorityOp, LocalContent, OpBuffer};
    use crate::memory::{MemoryScene, NotificationLog};
    use crate::notify::NotificationKind;
    use rnse_core::{AttributeValue, ReferenceValue};

    struct Harness {
        engine: SyncEngine,
        scene: MemoryScene,
        ops: OpBuffer,
        log: NotificationLog,
    }

    impl Harness {
        fn new(config: SyncConfig) -> Self {
            Self {
                engine: SyncEngine::new(config),
                scene: MemoryScene::new(),
                ops: OpBuffer::new(),
                log: NotificationLog::new(),
            }
        }

        fn alice() -> Self {
            Self::new(
                SyncConfig::builder("alice")
                    .with_entity_key("texture", "path")
                    .with_content_check("texture")
                    .build(),
            )
        }

        fn tick(&mut self) -> TickReport {
            self.engine
                .tick(&mut self.scene, &mut self.ops, &mut self.log)
        }

        fn send(&mut self, event: AuthorityEvent) {
            self.engine.handle_event(event);
        }

        fn handle(&self, id: u64) -> NodeHandle {
            self.engine.handle_of(NodeId(id)).unwrap()
        }

        /// Remote group P (id 1) with children A, B, C (ids 2, 3, 4).
        fn with_group(mut self) -> Self {
            self.send(created(1, 1, "group", Attributes::new(), None, 0));
            for (i, id) in [2, 3, 4].into_iter().enumerate() {
                self.send(created(id, id, "mesh", Attributes::new(), Some(1), i));
            }
            self.tick();
            self.ops.take();
            self
        }
    }

    fn created(
        id: u64,
        seq: u64,
        kind: &str,
        attributes: Attributes,
        parent: Option<u64>,
        index: usize,
    ) -> AuthorityEvent {
        AuthorityEvent::Created {
            id: NodeId(id),
            seq,
            origin: None,
            kind: NodeKind::new(kind),
            attributes,
            flags: NodeFlags::default(),
            parent: parent.map(NodeId),
            index,
            checksum: None,
        }
    }

    fn confirm(origin: NodeHandle, id: u64, seq: u64, kind: &str, parent: Option<u64>) -> AuthorityEvent {
        AuthorityEvent::Created {
            id: NodeId(id),
            seq,
            origin: Some(origin),
            kind: NodeKind::new(kind),
            attributes: Attributes::new(),
            flags: NodeFlags::default(),
            parent: parent.map(NodeId),
            index: 0,
            checksum: None,
        }
    }

    fn attrs(pairs: &[(&str, AttributeValue)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_local_create_is_confirmed() {
        let mut h = Harness::alice();
        let root = h
            .engine
            .create_local(NodeKind::new("group"), Attributes::new(), None, 0, NodeFlags::default())
            .unwrap();
        h.scene.insert(root, None, 0);

        h.tick();
        let ops = h.ops.take();
        assert!(matches!(&ops[..], [AuthorityOp::Create { nodes, parent: None, .. }] if nodes[0].origin == root));

        // Nothing is resent while the create is in flight.
        h.tick();
        assert!(h.ops.is_empty());

        h.send(confirm(root, 10, 1, "group", None));
        h.tick();
        let node = h.engine.get(root).unwrap();
        assert_eq!(node.id, Some(NodeId(10)));
        assert_eq!(node.lifecycle, Lifecycle::Syncing);
    }

    #[test]
    fn test_remote_rotation_is_one_local_move() {
        let mut h = Harness::alice().with_group();
        let (p, a, b, c) = (h.handle(1), h.handle(2), h.handle(3), h.handle(4));
        assert_eq!(h.scene.order(Some(p)), vec![a, b, c]);

        let moved = AuthorityEvent::ParentChanged {
            id: NodeId(4),
            parent: Some(NodeId(1)),
            index: 0,
        };
        h.send(moved.clone());
        let report = h.tick();
        assert_eq!(report.local_moves, 1);
        assert_eq!(h.scene.order(Some(p)), vec![c, a, b]);
        assert_eq!(h.engine.store().children(p), &[c, a, b]);

        h.send(moved);
        let report = h.tick();
        assert_eq!(report.local_moves, 0);
        assert_eq!(h.scene.order(Some(p)), vec![c, a, b]);
    }

    #[test]
    fn test_local_reorder_sends_single_index_change() {
        let mut h = Harness::alice().with_group();
        let (p, c) = (h.handle(1), h.handle(4));
        h.scene.move_local_child(c, 0);
        h.engine.mark_local_change(p);

        h.tick();
        assert_eq!(
            h.ops.take(),
            vec![AuthorityOp::SetChildIndex {
                node: NodeId(4),
                index: 0
            }]
        );
    }

    #[test]
    fn test_reorder_of_foreign_locked_child_reverts() {
        let mut h = Harness::alice().with_group();
        let (p, a, b, c) = (h.handle(1), h.handle(2), h.handle(3), h.handle(4));
        h.send(AuthorityEvent::Locked {
            id: NodeId(2),
            owner: ParticipantId::new("bob"),
        });
        h.tick();

        h.scene.move_local_child(a, 2);
        h.engine.mark_local_change(p);
        let report = h.tick();

        assert!(h.ops.is_empty());
        assert_eq!(report.forced_passes, 1);
        assert_eq!(h.scene.order(Some(p)), vec![a, b, c]);
    }

    #[test]
    fn test_fully_locked_parent_takes_authority_order() {
        let mut h = Harness::alice().with_group();
        let (p, a, b, c) = (h.handle(1), h.handle(2), h.handle(3), h.handle(4));
        h.send(AuthorityEvent::Locked {
            id: NodeId(1),
            owner: ParticipantId::new("bob"),
        });
        h.tick();

        h.scene.move_local_child(c, 0);
        h.engine.mark_local_change(p);
        h.tick();

        assert!(h.ops.is_empty());
        assert_eq!(h.scene.order(Some(p)), vec![a, b, c]);
        assert_eq!(h.engine.classify(c), LockClass::Full);
    }

    #[test]
    fn test_new_children_are_created_in_one_batch() {
        let mut h = Harness::alice().with_group();
        let p = h.handle(1);
        let mesh = || NodeKind::new("mesh");
        let x = h
            .engine
            .create_local(mesh(), Attributes::new(), Some(p), 1, NodeFlags::default())
            .unwrap();
        h.scene.insert(x, Some(p), 1);
        let y = h
            .engine
            .create_local(mesh(), Attributes::new(), Some(p), 2, NodeFlags::default())
            .unwrap();
        h.scene.insert(y, Some(p), 2);

        let report = h.tick();
        let ops = h.ops.take();
        assert_eq!(ops.len(), 1);
        match &ops[0] {
            AuthorityOp::Create {
                nodes,
                parent,
                index,
            } => {
                let origins: Vec<_> = nodes.iter().map(|n| n.origin).collect();
                assert_eq!(origins, vec![x, y]);
                assert_eq!(*parent, Some(NodeId(1)));
                assert_eq!(*index, 1);
            }
            other => panic!("unexpected op {other:?}"),
        }
        assert_eq!(report.authority_ops, 1);
    }

    #[test]
    fn test_local_reparent_sends_set_parent() {
        let mut h = Harness::alice().with_group();
        let (p, b, c) = (h.handle(1), h.handle(3), h.handle(4));
        h.scene.insert(c, Some(b), 0);
        h.engine.mark_local_change(b);
        h.engine.mark_local_change(p);

        h.tick();
        assert_eq!(
            h.ops.take(),
            vec![AuthorityOp::SetParent {
                node: NodeId(4),
                parent: Some(NodeId(3)),
                index: 0
            }]
        );
        assert_eq!(h.engine.store().parent(c), Some(b));
    }

    #[test]
    fn test_queued_lock_fires_after_release() {
        let mut h = Harness::alice().with_group();
        let (p, a) = (h.handle(1), h.handle(2));
        h.send(AuthorityEvent::Locked {
            id: NodeId(2),
            owner: ParticipantId::new("bob"),
        });
        h.tick();

        assert_eq!(h.engine.request_lock(a), Ok(LockRequestOutcome::Queued));
        h.tick();
        assert!(h.ops.is_empty());

        h.send(AuthorityEvent::Unlocked { id: NodeId(2) });
        h.tick();
        assert_eq!(h.ops.take(), vec![AuthorityOp::Lock { node: NodeId(2) }]);
        assert_eq!(h.engine.lock_state(a), Some(LockState::LockRequested));

        h.send(AuthorityEvent::Locked {
            id: NodeId(2),
            owner: ParticipantId::new("alice"),
        });
        h.tick();
        assert_eq!(h.engine.lock_state(a), Some(LockState::LockedByLocal));
        assert_eq!(h.engine.lock_state(p), Some(LockState::PartiallyLocked));
    }

    #[test]
    fn test_participant_leaving_releases_its_locks() {
        let mut h = Harness::alice().with_group();
        let b = h.handle(3);
        h.send(AuthorityEvent::Locked {
            id: NodeId(3),
            owner: ParticipantId::new("bob"),
        });
        h.tick();
        h.engine.request_lock(b).unwrap();

        h.send(AuthorityEvent::ParticipantLeft {
            participant: ParticipantId::new("bob"),
        });
        h.tick();
        assert_eq!(h.ops.take(), vec![AuthorityOp::Lock { node: NodeId(3) }]);
    }

    #[test]
    fn test_write_to_foreign_locked_node_is_reverted() {
        let mut h = Harness::alice().with_group();
        let a = h.handle(2);
        h.send(AuthorityEvent::Locked {
            id: NodeId(1),
            owner: ParticipantId::new("bob"),
        });
        h.tick();

        let edited = attrs(&[("name", "mine".into())]);
        h.scene.set_attributes(a, edited.clone());
        let err = h.engine.set_attributes(a, edited, &mut h.scene).unwrap_err();
        assert!(matches!(err, SyncError::LockConflict { .. }));
        assert_eq!(h.scene.attributes(a), Some(&Attributes::new()));
    }

    #[test]
    fn test_attribute_write_is_sent_next_tick() {
        let mut h = Harness::alice().with_group();
        let a = h.handle(2);
        let edited = attrs(&[("name", "mine".into())]);
        h.engine.set_attributes(a, edited.clone(), &mut h.scene).unwrap();
        h.tick();
        assert_eq!(h.scene.take_sent(), vec![(a, edited)]);
    }

    #[test]
    fn test_delete_paths() {
        let mut h = Harness::alice().with_group();
        let b = h.handle(3);

        let draft = h
            .engine
            .create_local(NodeKind::new("group"), Attributes::new(), None, 0, NodeFlags::default())
            .unwrap();
        assert_eq!(
            h.engine.request_delete(draft, &mut h.scene),
            Ok(DeleteOutcome::Discarded)
        );
        assert!(h.engine.get(draft).is_none());

        assert_eq!(h.engine.request_delete(b, &mut h.scene), Ok(DeleteOutcome::Queued));
        assert_eq!(h.engine.get(b).unwrap().lifecycle, Lifecycle::DeletePending);
        assert_eq!(h.engine.retract_delete(b), Ok(true));
        h.tick();
        assert!(h.ops.is_empty());
        assert_eq!(h.engine.get(b).unwrap().lifecycle, Lifecycle::Syncing);

        h.engine.request_delete(b, &mut h.scene).unwrap();
        assert!(h.engine.request_lock(b).is_err());
        h.tick();
        assert_eq!(h.ops.take(), vec![AuthorityOp::Delete { node: NodeId(3) }]);

        h.send(AuthorityEvent::Deleted { id: NodeId(3) });
        h.tick();
        assert!(h.engine.get(b).is_none());
        assert!(!h.scene.contains(b));
    }

    #[test]
    fn test_delete_of_locked_node_recreates_it() {
        let mut h = Harness::alice().with_group();
        let (p, a, b, c) = (h.handle(1), h.handle(2), h.handle(3), h.handle(4));
        h.send(AuthorityEvent::Locked {
            id: NodeId(3),
            owner: ParticipantId::new("bob"),
        });
        h.tick();

        h.scene.remove(b);
        assert_eq!(
            h.engine.request_delete(b, &mut h.scene),
            Ok(DeleteOutcome::Recreated)
        );
        h.tick();
        assert!(h.ops.is_empty());
        assert_eq!(h.scene.order(Some(p)), vec![a, b, c]);

        // A parent of a locked node is protected too.
        assert_eq!(
            h.engine.request_delete(p, &mut h.scene),
            Ok(DeleteOutcome::Recreated)
        );
    }

    #[test]
    fn test_delete_retracted_after_send_recreates_with_old_id() {
        let mut h = Harness::alice().with_group();
        let b = h.handle(3);
        h.engine.request_delete(b, &mut h.scene).unwrap();
        h.tick();
        h.ops.take();

        assert_eq!(h.engine.retract_delete(b), Ok(true));
        h.send(AuthorityEvent::Deleted { id: NodeId(3) });
        h.tick();

        let node = h.engine.get(b).unwrap();
        assert_eq!(node.lifecycle, Lifecycle::Pending);
        assert_eq!(node.id, None);
        let ops = h.ops.take();
        match &ops[..] {
            [AuthorityOp::Create { nodes, index, .. }] => {
                assert_eq!(nodes[0].origin, b);
                assert_eq!(nodes[0].reuse_id, Some(NodeId(3)));
                assert_eq!(*index, 1);
            }
            other => panic!("unexpected ops {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_creation_retargets_references() {
        let mut h = Harness::alice();
        let path = || attrs(&[("path", "rock.png".into())]);
        let local_tex = h
            .engine
            .create_local(NodeKind::new("texture"), path(), None, 0, NodeFlags::default())
            .unwrap();
        h.scene.insert(local_tex, None, 0);
        let mesh = h
            .engine
            .create_local(
                NodeKind::new("mesh"),
                attrs(&[("tex", ReferenceValue::to(local_tex).into())]),
                None,
                1,
                NodeFlags::default(),
            )
            .unwrap();
        h.scene.insert(mesh, None, 1);
        h.tick();
        h.ops.take();

        // Someone else's texture for the same path was confirmed first.
        h.send(created(5, 1, "texture", path(), None, 0));
        let report = h.tick();
        let remote_tex = h.handle(5);

        assert_eq!(report.duplicates_resolved, 1);
        let tex_ref = h.engine.get(mesh).unwrap().attributes["tex"].as_reference();
        assert_eq!(tex_ref, Some(ReferenceValue::to(remote_tex)));
        assert!(!h.scene.contains(local_tex));
        assert_eq!(h.engine.notifier().referrers(remote_tex), vec![mesh]);

        h.send(confirm(local_tex, 6, 2, "texture", None));
        h.send(confirm(mesh, 7, 3, "mesh", None));
        h.tick();
        assert_eq!(h.ops.take(), vec![AuthorityOp::Delete { node: NodeId(6) }]);
        let sent = h.scene.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, mesh);
    }

    fn textured(checksum_of: &[u8], width: i64) -> AuthorityEvent {
        AuthorityEvent::Created {
            id: NodeId(9),
            seq: 9,
            origin: None,
            kind: NodeKind::new("texture"),
            attributes: attrs(&[("path", "rock.png".into()), ("width", width.into())]),
            flags: NodeFlags::default(),
            parent: None,
            index: 0,
            checksum: Some(ContentChecksum::of(checksum_of)),
        }
    }

    fn with_local_texture(h: &mut Harness, width: i64) {
        h.scene.add_local_content(
            NodeKind::new("texture"),
            attrs(&[("path", "rock.png".into())]),
            LocalContent {
                data: b"local bytes".to_vec(),
                attributes: attrs(&[("path", "rock.png".into()), ("width", width.into())]),
            },
        );
    }

    #[test]
    fn test_checksum_mismatch_with_equal_values_adopts() {
        let mut h = Harness::alice();
        with_local_texture(&mut h, 128);
        h.send(textured(b"remote bytes", 128));
        let report = h.tick();

        let node = h.engine.get(h.handle(9)).unwrap();
        assert_eq!(report.conflicts, 0);
        assert!(!node.conflicting);
        assert_eq!(node.attributes["width"], AttributeValue::Int(128));
    }

    #[test]
    fn test_checksum_mismatch_with_different_values_conflicts() {
        let mut h = Harness::alice();
        with_local_texture(&mut h, 64);
        h.send(textured(b"remote bytes", 128));
        let report = h.tick();
        let tex = h.handle(9);

        assert_eq!(report.conflicts, 1);
        assert!(h.engine.get(tex).unwrap().conflicting);
        assert_eq!(
            h.engine.get(tex).unwrap().attributes["width"],
            AttributeValue::Int(64)
        );

        h.send(AuthorityEvent::PropertyChanged {
            id: NodeId(9),
            attributes: attrs(&[("width", 256i64.into())]),
        });
        h.tick();
        assert_eq!(
            h.engine.get(tex).unwrap().attributes["width"],
            AttributeValue::Int(64)
        );
        assert_eq!(h.log.on(tex)[0].kind, NotificationKind::ContentConflict);
        assert!(matches!(
            h.engine.set_attributes(tex, Attributes::new(), &mut h.scene),
            Err(SyncError::ContentConflict { .. })
        ));
    }

    #[test]
    fn test_matching_checksum_is_not_a_conflict() {
        let mut h = Harness::alice();
        with_local_texture(&mut h, 64);
        h.send(textured(b"local bytes", 128));
        h.tick();
        assert!(!h.engine.get(h.handle(9)).unwrap().conflicting);
    }

    #[test]
    fn test_broken_reference_notification_lifecycle() {
        let mut h = Harness::alice();
        h.scene.fail_kind(NodeKind::new("texture"));
        h.send(created(9, 1, "texture", attrs(&[("path", "gone.png".into())]), None, 0));
        h.tick();
        let tex = h.handle(9);
        assert!(h.engine.notifier().is_broken(tex));

        let refs = || attrs(&[("tex", ReferenceValue::to(tex).into())]);
        let mesh = h
            .engine
            .create_local(NodeKind::new("mesh"), refs(), None, 0, NodeFlags::default())
            .unwrap();
        h.scene.insert(mesh, None, 0);
        let short_lived = h
            .engine
            .create_local(NodeKind::new("mesh"), refs(), None, 0, NodeFlags::default())
            .unwrap();
        h.scene.insert(short_lived, None, 0);
        h.engine
            .set_attributes(short_lived, Attributes::new(), &mut h.scene)
            .unwrap();

        h.tick();
        assert!(h.log.on(short_lived).is_empty());
        assert_eq!(h.log.on(mesh).len(), 1);
        assert_eq!(h.log.attached_total(), 1);

        h.engine
            .set_attributes(mesh, Attributes::new(), &mut h.scene)
            .unwrap();
        h.tick();
        assert_eq!(h.log.active(), 0);
        assert!(!h.engine.notifier().is_broken(tex));
    }

    #[test]
    fn test_remote_delete_of_referenced_node_marks_it_broken() {
        let mut h = Harness::alice();
        h.send(created(9, 1, "material", Attributes::new(), None, 0));
        h.tick();
        let material = h.handle(9);
        h.send(created(
            10,
            2,
            "mesh",
            attrs(&[("material", AttributeValue::RemoteReference(NodeId(9)))]),
            None,
            1,
        ));
        h.tick();
        assert_eq!(h.engine.notifier().referrers(material), vec![h.handle(10)]);

        h.send(AuthorityEvent::Deleted { id: NodeId(9) });
        h.tick();
        h.tick();
        assert_eq!(h.log.on(h.handle(10)).len(), 1);
    }

    #[test]
    fn test_two_pending_duplicates_collapse_before_sending() {
        let mut h = Harness::alice();
        let path = || attrs(&[("path", "rock.png".into())]);
        let mut textures = Vec::new();
        let mut meshes = Vec::new();
        for i in 0..2 {
            let tex = h
                .engine
                .create_local(NodeKind::new("texture"), path(), None, 2 * i, NodeFlags::default())
                .unwrap();
            h.scene.insert(tex, None, 2 * i);
            let mesh = h
                .engine
                .create_local(
                    NodeKind::new("mesh"),
                    attrs(&[("tex", ReferenceValue::to(tex).into())]),
                    None,
                    2 * i + 1,
                    NodeFlags::default(),
                )
                .unwrap();
            h.scene.insert(mesh, None, 2 * i + 1);
            textures.push(tex);
            meshes.push(mesh);
        }
        let survivor = textures[0].min(textures[1]);
        let loser = textures[0].max(textures[1]);

        let report = h.tick();
        assert_eq!(report.duplicates_resolved, 1);
        assert!(h.engine.get(loser).is_none());
        assert!(!h.scene.contains(loser));
        for mesh in &meshes {
            let target = h.engine.get(*mesh).unwrap().attributes["tex"].as_reference();
            assert_eq!(target, Some(ReferenceValue::to(survivor)));
        }
        let mut referrers = h.engine.notifier().referrers(survivor);
        referrers.sort();
        let mut expected = meshes.clone();
        expected.sort();
        assert_eq!(referrers, expected);

        let ops = h.ops.take();
        let sent_textures: Vec<NodeHandle> = ops
            .iter()
            .flat_map(|op| match op {
                AuthorityOp::Create { nodes, .. } => nodes.clone(),
                _ => Vec::new(),
            })
            .filter(|n| n.kind == NodeKind::new("texture"))
            .map(|n| n.origin)
            .collect();
        assert_eq!(sent_textures, vec![survivor]);
    }

    #[test]
    fn test_references_cross_the_authority_as_ids() {
        let mut h = Harness::alice();
        h.send(created(9, 1, "material", Attributes::new(), None, 0));
        h.tick();
        let material = h.handle(9);

        let mesh = h
            .engine
            .create_local(
                NodeKind::new("mesh"),
                attrs(&[("material", ReferenceValue::to(material).into())]),
                None,
                1,
                NodeFlags::default(),
            )
            .unwrap();
        h.scene.insert(mesh, None, 1);
        h.tick();
        match &h.ops.take()[..] {
            [AuthorityOp::Create { nodes, .. }] => {
                assert_eq!(nodes[0].attributes["material"], AttributeValue::RemoteReference(NodeId(9)));
            }
            other => panic!("unexpected ops {other:?}"),
        }

        h.send(AuthorityEvent::PropertyChanged {
            id: NodeId(9),
            attributes: attrs(&[("base", AttributeValue::RemoteReference(NodeId(9)))]),
        });
        h.tick();
        let own = h.engine.get(material).unwrap().attributes["base"].as_reference();
        assert_eq!(own, Some(ReferenceValue::to(material)));
        assert_eq!(
            h.scene.attributes(material).unwrap()["base"].as_reference(),
            Some(ReferenceValue::to(material))
        );
    }

    #[test]
    fn test_reference_to_pending_node_waits_for_its_id() {
        let mut h = Harness::alice();
        let tex = h
            .engine
            .create_local(NodeKind::new("texture"), Attributes::new(), None, 0, NodeFlags::default())
            .unwrap();
        h.scene.insert(tex, None, 0);
        let mesh = h
            .engine
            .create_local(
                NodeKind::new("mesh"),
                attrs(&[("tex", ReferenceValue::to(tex).into())]),
                None,
                1,
                NodeFlags::default(),
            )
            .unwrap();
        h.scene.insert(mesh, None, 1);
        h.tick();
        match &h.ops.take()[..] {
            [AuthorityOp::Create { nodes, .. }] => {
                let request = nodes.iter().find(|n| n.origin == mesh).unwrap();
                assert!(request.attributes["tex"].is_null());
            }
            other => panic!("unexpected ops {other:?}"),
        }

        // The mesh is confirmed before the texture it points at.
        h.send(confirm(mesh, 2, 2, "mesh", None));
        h.tick();
        assert!(h.scene.take_sent().is_empty());

        h.send(confirm(tex, 1, 1, "texture", None));
        h.tick();
        let sent = h.scene.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, mesh);
        assert_eq!(sent[0].1["tex"], AttributeValue::RemoteReference(NodeId(1)));
        assert!(!h.engine.has_pending_work());
    }

    #[test]
    fn test_reference_to_unseen_node_resolves_when_it_arrives() {
        let mut h = Harness::alice();
        h.send(created(
            10,
            2,
            "mesh",
            attrs(&[("material", AttributeValue::RemoteReference(NodeId(9)))]),
            None,
            0,
        ));
        h.tick();
        let mesh = h.handle(10);
        assert_eq!(
            h.engine.get(mesh).unwrap().attributes["material"],
            AttributeValue::RemoteReference(NodeId(9))
        );

        h.send(created(9, 3, "material", Attributes::new(), None, 1));
        h.tick();
        let material = h.handle(9);
        assert_eq!(
            h.engine.get(mesh).unwrap().attributes["material"].as_reference(),
            Some(ReferenceValue::to(material))
        );
        assert_eq!(
            h.scene.attributes(mesh).unwrap()["material"].as_reference(),
            Some(ReferenceValue::to(material))
        );
        assert_eq!(h.engine.notifier().referrers(material), vec![mesh]);
    }

    #[test]
    fn test_broken_target_clears_once_it_materializes() {
        let mut h = Harness::alice();
        h.scene.fail_kind(NodeKind::new("texture"));
        h.send(created(9, 1, "texture", attrs(&[("path", "late.png".into())]), None, 0));
        h.send(created(
            10,
            2,
            "mesh",
            attrs(&[("tex", AttributeValue::RemoteReference(NodeId(9)))]),
            None,
            1,
        ));
        h.tick();
        h.tick();
        let (tex, mesh) = (h.handle(9), h.handle(10));
        assert!(h.engine.notifier().is_broken(tex));
        assert_eq!(h.log.active(), 1);

        h.scene.allow_kind(&NodeKind::new("texture"));
        h.send(AuthorityEvent::PropertyChanged {
            id: NodeId(9),
            attributes: attrs(&[("path", "late.png".into()), ("width", 64i64.into())]),
        });
        h.tick();
        h.tick();
        assert!(!h.engine.notifier().is_broken(tex));
        assert_eq!(h.log.active(), 0);
        assert_eq!(h.engine.notifier().referrers(tex), vec![mesh]);
    }

    #[test]
    fn test_unsubscribe_drops_children() {
        let mut h = Harness::alice().with_group();
        let (p, a) = (h.handle(1), h.handle(2));
        h.engine.subscribe(p).unwrap();
        h.tick();
        assert_eq!(h.ops.take(), vec![AuthorityOp::Subscribe { node: NodeId(1) }]);

        h.engine.unsubscribe(p, &mut h.scene).unwrap();
        assert!(h.engine.get(a).is_none());
        assert!(h.scene.order(Some(p)).is_empty());
        h.tick();
        assert_eq!(h.ops.take(), vec![AuthorityOp::Unsubscribe { node: NodeId(1) }]);
    }

    #[test]
    fn test_shutdown_removes_transient_nodes() {
        let mut h = Harness::alice();
        h.send(AuthorityEvent::Created {
            id: NodeId(1),
            seq: 1,
            origin: None,
            kind: NodeKind::new("cursor"),
            attributes: Attributes::new(),
            flags: NodeFlags::transient(),
            parent: None,
            index: 0,
            checksum: None,
        });
        h.send(created(2, 2, "group", Attributes::new(), None, 1));
        h.tick();
        let (cursor, group) = (h.handle(1), h.handle(2));

        let Harness { engine, mut scene, .. } = h;
        assert_eq!(engine.shutdown(&mut scene), 1);
        assert!(!scene.contains(cursor));
        assert!(scene.contains(group));
    }
}
