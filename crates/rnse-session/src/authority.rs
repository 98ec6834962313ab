//! The authority side of a session.
//!
//! [`AuthorityTransport`] is what a [`Session`](crate::Session) talks to.
//! [`MemoryAuthority`] is an in-process sequencer for tests and
//! simulation: it assigns ids and sequence numbers, serializes structural
//! operations, grants locks and fans events out to every participant that
//! can see the affected node.

use crate::error::{Result, SessionError};
use async_trait::async_trait;
use parking_lot::Mutex;
use rnse_core::{Attributes, ContentChecksum, NodeFlags, NodeId, NodeKind, ParticipantId};
use rnse_sync::{AuthorityEvent, AuthorityOp, CreateRequest};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Connection to the session authority.
#[async_trait]
pub trait AuthorityTransport: Send + Sync + 'static {
    /// Join the session. The receiver yields a snapshot of everything
    /// visible to `participant`, then live events in authority order.
    async fn join(&self, participant: &ParticipantId) -> Result<mpsc::UnboundedReceiver<AuthorityEvent>>;

    /// Submit structural operations, applied in order.
    async fn submit(&self, participant: &ParticipantId, ops: Vec<AuthorityOp>) -> Result<()>;

    /// Replace the attributes of a confirmed node.
    async fn update_attributes(
        &self,
        participant: &ParticipantId,
        node: NodeId,
        attributes: Attributes,
    ) -> Result<()>;

    async fn leave(&self, participant: &ParticipantId) -> Result<()>;
}

struct Entry {
    kind: NodeKind,
    attributes: Attributes,
    flags: NodeFlags,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    seq: u64,
    creator: ParticipantId,
    lock: Option<ParticipantId>,
    checksum: Option<ContentChecksum>,
}

struct Member {
    events: mpsc::UnboundedSender<AuthorityEvent>,
    subscriptions: BTreeSet<NodeId>,
}

#[derive(Default)]
struct AuthorityState {
    nodes: HashMap<NodeId, Entry>,
    roots: Vec<NodeId>,
    members: BTreeMap<ParticipantId, Member>,
    next_id: u64,
    seq: u64,
    content_kinds: HashSet<NodeKind>,
}

impl AuthorityState {
    fn siblings(&self, parent: Option<NodeId>) -> &[NodeId] {
        match parent {
            None => &self.roots,
            Some(p) => self.nodes.get(&p).map(|e| e.children.as_slice()).unwrap_or(&[]),
        }
    }

    fn siblings_mut(&mut self, parent: Option<NodeId>) -> Option<&mut Vec<NodeId>> {
        match parent {
            None => Some(&mut self.roots),
            Some(p) => self.nodes.get_mut(&p).map(|e| &mut e.children),
        }
    }

    fn index_of(&self, id: NodeId) -> usize {
        let parent = self.nodes.get(&id).and_then(|e| e.parent);
        self.siblings(parent)
            .iter()
            .position(|c| *c == id)
            .unwrap_or(0)
    }

    fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut current = self.nodes.get(&id).and_then(|e| e.parent);
        while let Some(p) = current {
            out.push(p);
            current = self.nodes.get(&p).and_then(|e| e.parent);
        }
        out
    }

    /// `id` followed by its descendants, parents before children.
    fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            if let Some(entry) = self.nodes.get(&n) {
                out.push(n);
                stack.extend(entry.children.iter().rev());
            }
        }
        out
    }

    /// Whether `member` receives events about `id`: every gated ancestor
    /// must be subscribed.
    fn visible(&self, member: &Member, id: NodeId) -> bool {
        self.ancestors(id).into_iter().all(|a| {
            let gated = self
                .nodes
                .get(&a)
                .is_some_and(|e| e.flags.requires_subscription);
            !gated || member.subscriptions.contains(&a)
        })
    }

    fn audience(&self, id: NodeId) -> Vec<ParticipantId> {
        self.members
            .iter()
            .filter(|(_, m)| self.visible(m, id))
            .map(|(p, _)| p.clone())
            .collect()
    }

    fn send(&self, to: &ParticipantId, event: AuthorityEvent) {
        if let Some(member) = self.members.get(to) {
            // A dropped receiver only means the participant is leaving.
            let _ = member.events.send(event);
        }
    }

    fn send_all(&self, to: &[ParticipantId], event: &AuthorityEvent) {
        for p in to {
            self.send(p, event.clone());
        }
    }

    /// First holder of a lock on `id` or one of its ancestors.
    fn effective_lock(&self, id: NodeId) -> Option<&ParticipantId> {
        std::iter::once(id)
            .chain(self.ancestors(id))
            .find_map(|n| self.nodes.get(&n).and_then(|e| e.lock.as_ref()))
    }

    /// A lock held by someone other than `by` that covers `id` or
    /// anything below it.
    fn foreign_lock(&self, id: NodeId, by: &ParticipantId) -> Option<ParticipantId> {
        if let Some(owner) = self.effective_lock(id).filter(|o| *o != by) {
            return Some(owner.clone());
        }
        self.subtree(id)
            .into_iter()
            .filter_map(|n| self.nodes.get(&n).and_then(|e| e.lock.clone()))
            .find(|owner| owner != by)
    }

    fn created_event(&self, id: NodeId) -> Option<AuthorityEvent> {
        let entry = self.nodes.get(&id)?;
        Some(AuthorityEvent::Created {
            id,
            seq: entry.seq,
            origin: None,
            kind: entry.kind.clone(),
            attributes: entry.attributes.clone(),
            flags: entry.flags,
            parent: entry.parent,
            index: self.index_of(id),
            checksum: entry.checksum,
        })
    }

    /// Created (and Locked) events for `nodes` that `participant` can see.
    fn replay(&self, participant: &ParticipantId, nodes: &[NodeId]) {
        let Some(member) = self.members.get(participant) else {
            return;
        };
        let visible: Vec<NodeId> = nodes
            .iter()
            .copied()
            .filter(|n| self.visible(member, *n))
            .collect();
        for n in &visible {
            if let Some(event) = self.created_event(*n) {
                self.send(participant, event);
            }
        }
        for n in &visible {
            if let Some(owner) = self.nodes.get(n).and_then(|e| e.lock.clone()) {
                self.send(participant, AuthorityEvent::Locked { id: *n, owner });
            }
        }
    }

    fn allocate_id(&mut self, reuse: Option<NodeId>) -> NodeId {
        if let Some(id) = reuse.filter(|id| !self.nodes.contains_key(id)) {
            self.next_id = self.next_id.max(id.0);
            return id;
        }
        self.next_id += 1;
        while self.nodes.contains_key(&NodeId(self.next_id)) {
            self.next_id += 1;
        }
        NodeId(self.next_id)
    }

    /// Send `participant` the current position of `id`, undoing a rejected
    /// move on their side.
    fn correct_position(&self, participant: &ParticipantId, id: NodeId) {
        let parent = self.nodes.get(&id).and_then(|e| e.parent);
        let index = self.index_of(id);
        self.send(participant, AuthorityEvent::ParentChanged { id, parent, index });
    }

    fn apply(&mut self, participant: &ParticipantId, op: AuthorityOp) {
        match op {
            AuthorityOp::Create {
                nodes,
                parent,
                index,
            } => self.create(participant, nodes, parent, index),
            AuthorityOp::Delete { node } => {
                if let Some(owner) = self.foreign_lock(node, participant) {
                    tracing::warn!(%participant, %node, %owner, "delete of locked node rejected");
                    return;
                }
                self.remove_subtree(node);
            }
            AuthorityOp::SetChildIndex { node, index } => {
                self.set_child_index(participant, node, index)
            }
            AuthorityOp::SetParent {
                node,
                parent,
                index,
            } => self.set_parent(participant, node, parent, index),
            AuthorityOp::Lock { node } => self.lock(participant, node),
            AuthorityOp::Unlock { node } => {
                let Some(entry) = self.nodes.get_mut(&node) else {
                    return;
                };
                if entry.lock.as_ref() != Some(participant) {
                    return;
                }
                entry.lock = None;
                let audience = self.audience(node);
                self.send_all(&audience, &AuthorityEvent::Unlocked { id: node });
            }
            AuthorityOp::Subscribe { node } => {
                let Some(member) = self.members.get_mut(participant) else {
                    return;
                };
                if !member.subscriptions.insert(node) {
                    return;
                }
                let below: Vec<NodeId> = self.subtree(node).into_iter().skip(1).collect();
                tracing::debug!(%participant, %node, nodes = below.len(), "subscribed");
                self.replay(participant, &below);
            }
            AuthorityOp::Unsubscribe { node } => {
                if let Some(member) = self.members.get_mut(participant) {
                    member.subscriptions.remove(&node);
                }
            }
        }
    }

    fn create(
        &mut self,
        participant: &ParticipantId,
        nodes: Vec<CreateRequest>,
        parent: Option<NodeId>,
        index: usize,
    ) {
        if parent.is_some_and(|p| !self.nodes.contains_key(&p)) {
            tracing::warn!(%participant, ?parent, "create under unknown parent rejected");
            return;
        }
        let mut at = index.min(self.siblings(parent).len());
        for request in nodes {
            let id = self.allocate_id(request.reuse_id);
            self.seq += 1;
            let checksum = if self.content_kinds.contains(&request.kind) {
                ContentChecksum::of_attributes(&request.attributes).ok()
            } else {
                None
            };
            self.nodes.insert(
                id,
                Entry {
                    kind: request.kind.clone(),
                    attributes: request.attributes.clone(),
                    flags: request.flags,
                    parent,
                    children: Vec::new(),
                    seq: self.seq,
                    creator: participant.clone(),
                    lock: None,
                    checksum,
                },
            );
            if let Some(siblings) = self.siblings_mut(parent) {
                siblings.insert(at, id);
            }

            let event = AuthorityEvent::Created {
                id,
                seq: self.seq,
                origin: None,
                kind: request.kind,
                attributes: request.attributes,
                flags: request.flags,
                parent,
                index: at,
                checksum,
            };
            let mut own = event.clone();
            if let AuthorityEvent::Created { origin, .. } = &mut own {
                *origin = Some(request.origin);
            }
            let others: Vec<ParticipantId> = self
                .audience(id)
                .into_iter()
                .filter(|p| p != participant)
                .collect();
            self.send(participant, own);
            self.send_all(&others, &event);
            at += 1;
        }
    }

    fn remove_subtree(&mut self, id: NodeId) {
        let Some(parent) = self.nodes.get(&id).map(|e| e.parent) else {
            return;
        };
        let audience = self.audience(id);
        if let Some(siblings) = self.siblings_mut(parent) {
            siblings.retain(|c| *c != id);
        }
        let removed = self.subtree(id);
        for n in &removed {
            self.nodes.remove(n);
        }
        for member in self.members.values_mut() {
            for n in &removed {
                member.subscriptions.remove(n);
            }
        }
        tracing::debug!(node = %id, nodes = removed.len(), "deleted");
        self.send_all(&audience, &AuthorityEvent::Deleted { id });
    }

    fn set_child_index(&mut self, participant: &ParticipantId, id: NodeId, index: usize) {
        let Some(parent) = self.nodes.get(&id).map(|e| e.parent) else {
            return;
        };
        if let Some(owner) = self.foreign_lock(id, participant) {
            tracing::debug!(%participant, node = %id, %owner, "reorder of locked node rejected");
            self.correct_position(participant, id);
            return;
        }
        let Some(siblings) = self.siblings_mut(parent) else {
            return;
        };
        siblings.retain(|c| *c != id);
        let index = index.min(siblings.len());
        siblings.insert(index, id);
        let audience = self.audience(id);
        self.send_all(&audience, &AuthorityEvent::ParentChanged { id, parent, index });
    }

    fn set_parent(
        &mut self,
        participant: &ParticipantId,
        id: NodeId,
        parent: Option<NodeId>,
        index: usize,
    ) {
        let Some(old_parent) = self.nodes.get(&id).map(|e| e.parent) else {
            return;
        };
        let valid = match parent {
            None => true,
            Some(p) => self.nodes.contains_key(&p) && !self.subtree(id).contains(&p),
        };
        let locked = self.foreign_lock(id, participant).is_some()
            || parent.is_some_and(|p| {
                self.effective_lock(p)
                    .is_some_and(|owner| owner != participant)
            });
        if !valid || locked {
            tracing::debug!(%participant, node = %id, ?parent, valid, locked, "re-parent rejected");
            self.correct_position(participant, id);
            return;
        }

        let mut audience = self.audience(id);
        if let Some(siblings) = self.siblings_mut(old_parent) {
            siblings.retain(|c| *c != id);
        }
        let index = match self.siblings_mut(parent) {
            Some(siblings) => {
                let index = index.min(siblings.len());
                siblings.insert(index, id);
                index
            }
            None => return,
        };
        if let Some(entry) = self.nodes.get_mut(&id) {
            entry.parent = parent;
        }
        for p in self.audience(id) {
            if !audience.contains(&p) {
                audience.push(p);
            }
        }
        self.send_all(&audience, &AuthorityEvent::ParentChanged { id, parent, index });
    }

    fn lock(&mut self, participant: &ParticipantId, id: NodeId) {
        let Some(entry) = self.nodes.get_mut(&id) else {
            return;
        };
        match entry.lock.clone() {
            None => {
                entry.lock = Some(participant.clone());
                let audience = self.audience(id);
                let event = AuthorityEvent::Locked {
                    id,
                    owner: participant.clone(),
                };
                self.send_all(&audience, &event);
            }
            Some(owner) if owner == *participant => {
                let event = AuthorityEvent::Locked {
                    id,
                    owner: participant.clone(),
                };
                self.send(participant, event);
            }
            Some(owner) => {
                tracing::debug!(%participant, node = %id, %owner, "lock contended");
            }
        }
    }

    fn leave(&mut self, participant: &ParticipantId) {
        for entry in self.nodes.values_mut() {
            if entry.lock.as_ref() == Some(participant) {
                entry.lock = None;
            }
        }
        let transient: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, e)| e.flags.transient && e.creator == *participant)
            .map(|(id, _)| *id)
            .collect();
        for id in transient {
            self.remove_subtree(id);
        }
        let others: Vec<ParticipantId> = self.members.keys().cloned().collect();
        self.send_all(
            &others,
            &AuthorityEvent::ParticipantLeft {
                participant: participant.clone(),
            },
        );
    }
}

/// In-memory authority shared by every session of one process.
#[derive(Clone, Default)]
pub struct MemoryAuthority {
    state: Arc<Mutex<AuthorityState>>,
}

impl MemoryAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates of `kind` declare a checksum of their attributes.
    pub fn with_content_kind(self, kind: impl Into<String>) -> Self {
        self.state.lock().content_kinds.insert(NodeKind::new(kind));
        self
    }

    pub fn len(&self) -> usize {
        self.state.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().nodes.is_empty()
    }

    /// Authoritative children of `parent` (`None` for the roots).
    pub fn children(&self, parent: Option<NodeId>) -> Vec<NodeId> {
        self.state.lock().siblings(parent).to_vec()
    }

    pub fn parent_of(&self, node: NodeId) -> Option<NodeId> {
        self.state.lock().nodes.get(&node).and_then(|e| e.parent)
    }

    pub fn attributes(&self, node: NodeId) -> Option<Attributes> {
        self.state.lock().nodes.get(&node).map(|e| e.attributes.clone())
    }

    pub fn lock_owner(&self, node: NodeId) -> Option<ParticipantId> {
        self.state.lock().nodes.get(&node).and_then(|e| e.lock.clone())
    }

    /// Ids of every node of `kind`, in id order.
    pub fn nodes_of_kind(&self, kind: &NodeKind) -> Vec<NodeId> {
        let state = self.state.lock();
        let mut ids: Vec<NodeId> = state
            .nodes
            .iter()
            .filter(|(_, e)| e.kind == *kind)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    pub fn participants(&self) -> Vec<ParticipantId> {
        self.state.lock().members.keys().cloned().collect()
    }
}

impl std::fmt::Debug for MemoryAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryAuthority")
            .field("nodes", &state.nodes.len())
            .field("participants", &state.members.len())
            .field("seq", &state.seq)
            .finish()
    }
}

#[async_trait]
impl AuthorityTransport for MemoryAuthority {
    async fn join(&self, participant: &ParticipantId) -> Result<mpsc::UnboundedReceiver<AuthorityEvent>> {
        let mut state = self.state.lock();
        if state.members.contains_key(participant) {
            return Err(SessionError::AlreadyConnected(participant.clone()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.members.insert(
            participant.clone(),
            Member {
                events: tx,
                subscriptions: BTreeSet::new(),
            },
        );
        let snapshot: Vec<NodeId> = state
            .roots
            .clone()
            .into_iter()
            .flat_map(|root| state.subtree(root))
            .collect();
        state.replay(participant, &snapshot);
        tracing::info!(%participant, nodes = snapshot.len(), "participant joined");
        Ok(rx)
    }

    async fn submit(&self, participant: &ParticipantId, ops: Vec<AuthorityOp>) -> Result<()> {
        let mut state = self.state.lock();
        if !state.members.contains_key(participant) {
            return Err(SessionError::NotConnected(participant.clone()));
        }
        for op in ops {
            state.apply(participant, op);
        }
        Ok(())
    }

    async fn update_attributes(
        &self,
        participant: &ParticipantId,
        node: NodeId,
        attributes: Attributes,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if !state.members.contains_key(participant) {
            return Err(SessionError::NotConnected(participant.clone()));
        }
        if !state.nodes.contains_key(&node) {
            return Err(SessionError::UnknownNode(node));
        }
        if let Some(owner) = state.effective_lock(node).filter(|o| *o != participant).cloned() {
            tracing::debug!(%participant, %node, %owner, "attribute write on locked node rejected");
            let current = state.nodes.get(&node).map(|e| e.attributes.clone());
            if let Some(attributes) = current {
                state.send(participant, AuthorityEvent::PropertyChanged { id: node, attributes });
            }
            return Ok(());
        }
        if let Some(entry) = state.nodes.get_mut(&node) {
            entry.attributes = attributes.clone();
        }
        let others: Vec<ParticipantId> = state
            .audience(node)
            .into_iter()
            .filter(|p| p != participant)
            .collect();
        state.send_all(&others, &AuthorityEvent::PropertyChanged { id: node, attributes });
        Ok(())
    }

    async fn leave(&self, participant: &ParticipantId) -> Result<()> {
        let mut state = self.state.lock();
        if state.members.remove(participant).is_none() {
            return Err(SessionError::NotConnected(participant.clone()));
        }
        state.leave(participant);
        tracing::info!(%participant, "participant left");
        Ok(())
    }
}
