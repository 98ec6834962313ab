//! Hierarchy Order Reconciler.
//!
//! Brings a parent's local child order into agreement with the authority,
//! in both directions, while issuing as few single-element moves as
//! possible.
//!
//! The core is [`plan_moves`], a pure planner shared by both directions:
//! - inbound: `current` is the local order, `target` the authoritative one
//! - outbound: `current` is the authoritative order, `target` the local one
//!
//! A handful of transpositions costs O(n) moves; the planner only degrades
//! to O(n^2) work when nearly every element must move.

use crate::channel::{AuthorityChannel, CreateRequest, LocalAdapter};
use crate::lock::{LockClass, LockCoordinator};
use crate::store::NodeStore;
use rnse_core::{NodeHandle, NodeId};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::hash::Hash;

/// Move `item` so it ends up at `index` (remove, then insert).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Move<K> {
    pub item: K,
    pub index: usize,
}

/// Reorder `current` in place so that its elements that also appear in
/// `target` follow `target`'s order, returning the moves applied.
///
/// Elements of `current` absent from `target` are left where they are, and
/// elements of `target` absent from `current` are ignored. When the
/// authoritative element and the local occupant of a slot disagree, the
/// side that is further from home moves: `delta_s` is how far the expected
/// element must travel, `delta_l` how far the occupant sits from its own
/// slot. Ties pass over the occupant. Passed-over occupants go into a skip
/// set and are moved exactly once when the walk reaches them.
///
/// `prefer` overrides the distance rule when exactly one of the two
/// candidates is preferred; that one is the one moved.
pub fn plan_moves<K, F>(current: &mut Vec<K>, target: &[K], prefer: F) -> Vec<Move<K>>
where
    K: Copy + Eq + Hash,
    F: Fn(&K) -> bool,
{
    let present: HashSet<K> = current.iter().copied().collect();
    let mut seen = HashSet::new();
    let wanted: Vec<K> = target
        .iter()
        .copied()
        .filter(|k| present.contains(k) && seen.insert(*k))
        .collect();
    let rank: HashMap<K, usize> = wanted.iter().enumerate().map(|(i, k)| (*k, i)).collect();

    // Index-keyed by rank, reset every pass.
    let mut skipped = vec![false; wanted.len()];
    let mut moves = Vec::new();
    let mut cursor = 0;
    let mut i = 0;

    while i < wanted.len() {
        let expected = wanted[i];

        if skipped[i] {
            skipped[i] = false;
            let from = position(current, expected, 0);
            if from + 1 != cursor {
                current.remove(from);
                let to = cursor - 1;
                current.insert(to, expected);
                moves.push(Move {
                    item: expected,
                    index: to,
                });
            }
            i += 1;
            continue;
        }

        while cursor < current.len() {
            match rank.get(&current[cursor]) {
                Some(&r) if !skipped[r] => break,
                _ => cursor += 1,
            }
        }

        let occupant = current[cursor];
        if occupant == expected {
            cursor += 1;
            i += 1;
            continue;
        }

        let from = position(current, expected, cursor + 1);
        let delta_s = from - cursor;
        let delta_l = rank[&occupant] - i;
        let move_expected = match (prefer(&expected), prefer(&occupant)) {
            (true, false) => true,
            (false, true) => false,
            _ => delta_s > delta_l,
        };

        if move_expected {
            current.remove(from);
            current.insert(cursor, expected);
            moves.push(Move {
                item: expected,
                index: cursor,
            });
            cursor += 1;
            i += 1;
        } else {
            skipped[rank[&occupant]] = true;
            cursor += 1;
        }
    }

    moves
}

fn position<K: Eq>(items: &[K], item: K, from: usize) -> usize {
    from + items[from..]
        .iter()
        .position(|k| *k == item)
        .expect("planned element is present in the working order")
}

/// The authority's view of the hierarchy, mirrored from confirmed events.
///
/// Every update is idempotent: replaying an event that is already reflected
/// leaves the mirror unchanged and reports no change.
#[derive(Clone, Debug, Default)]
pub struct AuthoritativeTree {
    children: HashMap<NodeHandle, Vec<NodeHandle>>,
    roots: Vec<NodeHandle>,
    parent: HashMap<NodeHandle, Option<NodeHandle>>,
}

impl AuthoritativeTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, node: NodeHandle) -> bool {
        self.parent.contains_key(&node)
    }

    /// Authoritative parent: `None` if unknown, `Some(None)` for a root.
    pub fn parent(&self, node: NodeHandle) -> Option<Option<NodeHandle>> {
        self.parent.get(&node).copied()
    }

    pub fn children(&self, parent: NodeHandle) -> &[NodeHandle] {
        self.children
            .get(&parent)
            .map(|c| c.as_slice())
            .unwrap_or(&[])
    }

    pub fn roots(&self) -> &[NodeHandle] {
        &self.roots
    }

    fn siblings_mut(&mut self, parent: Option<NodeHandle>) -> &mut Vec<NodeHandle> {
        match parent {
            Some(p) => self.children.entry(p).or_default(),
            None => &mut self.roots,
        }
    }

    pub fn index_of(&self, node: NodeHandle) -> Option<usize> {
        let siblings = match self.parent(node)? {
            Some(p) => self.children(p),
            None => self.roots.as_slice(),
        };
        siblings.iter().position(|c| *c == node)
    }

    /// Place `node` under `parent` at `index` (clamped). Returns whether
    /// anything changed.
    pub fn place(&mut self, node: NodeHandle, parent: Option<NodeHandle>, index: usize) -> bool {
        if let Some(old_parent) = self.parent(node) {
            let siblings = self.siblings_mut(old_parent);
            let from = siblings.iter().position(|c| *c == node);
            if old_parent == parent {
                let clamped = index.min(siblings.len().saturating_sub(1));
                if from == Some(clamped) {
                    return false;
                }
            }
            siblings.retain(|c| *c != node);
        }
        let siblings = self.siblings_mut(parent);
        let index = index.min(siblings.len());
        siblings.insert(index, node);
        self.parent.insert(node, parent);
        true
    }

    /// Forget a node. Its own child list is dropped with it.
    pub fn remove(&mut self, node: NodeHandle) -> Option<Option<NodeHandle>> {
        let parent = self.parent.remove(&node)?;
        self.siblings_mut(parent).retain(|c| *c != node);
        self.children.remove(&node);
        Some(parent)
    }
}

/// Creates that have been sent but not confirmed yet, and ids offered for
/// reuse by recreated nodes.
#[derive(Clone, Debug, Default)]
pub struct PendingCreates {
    in_flight: HashSet<NodeHandle>,
    reuse_ids: HashMap<NodeHandle, NodeId>,
    /// Sent with a reference to a node that had no id yet.
    held_references: HashSet<NodeHandle>,
}

impl PendingCreates {
    pub fn is_in_flight(&self, node: NodeHandle) -> bool {
        self.in_flight.contains(&node)
    }

    /// Returns whether the node was created with references held back;
    /// its attributes then have to be sent again.
    pub fn confirmed(&mut self, node: NodeHandle) -> bool {
        self.reuse_ids.remove(&node);
        self.in_flight.remove(&node);
        self.held_references.remove(&node)
    }

    pub fn offer_reuse(&mut self, node: NodeHandle, id: NodeId) {
        self.reuse_ids.insert(node, id);
    }

    pub fn forget(&mut self, node: NodeHandle) {
        self.in_flight.remove(&node);
        self.reuse_ids.remove(&node);
        self.held_references.remove(&node);
    }

    /// Build the create requests for `nodes` and mark them in flight.
    pub fn send(
        &mut self,
        store: &NodeStore,
        nodes: &[NodeHandle],
        parent: Option<NodeId>,
        index: usize,
        channel: &mut dyn AuthorityChannel,
    ) {
        let mut requests = Vec::with_capacity(nodes.len());
        for node in nodes.iter().filter_map(|h| store.get(*h)) {
            let (attributes, held) = store.session_attributes(&node.attributes);
            if held > 0 {
                self.held_references.insert(node.handle);
            }
            requests.push(CreateRequest {
                origin: node.handle,
                kind: node.kind.clone(),
                attributes,
                flags: node.flags,
                reuse_id: self.reuse_ids.get(&node.handle).copied(),
            });
        }
        if requests.is_empty() {
            return;
        }
        self.in_flight.extend(requests.iter().map(|r| r.origin));
        channel.create(requests, parent, index);
    }
}

/// Borrowed engine state a reconciliation pass works on.
pub struct PassContext<'a> {
    pub store: &'a mut NodeStore,
    pub tree: &'a AuthoritativeTree,
    pub locks: &'a LockCoordinator,
    pub adapter: &'a mut dyn LocalAdapter,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InboundOutcome {
    pub moves: usize,
    pub reparented: usize,
    /// Authoritative parents of local children found under the wrong
    /// parent; they need their own pass.
    pub deferred: Vec<NodeHandle>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OutboundOutcome {
    pub moves: usize,
    pub created: usize,
    pub reparented: usize,
    /// The parent was handed to a forced inbound pass instead.
    pub forced: bool,
    /// The parent is not confirmed yet; try again later.
    pub waiting: bool,
}

/// How a locally ordered child relates to the authority.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChildStatus {
    Known,
    New,
    Reparented,
    InFlight,
}

/// Placement walk for creates and re-parents after the moves are planned.
struct Placement {
    work: Vec<NodeHandle>,
    prev: Option<usize>,
    batch: Vec<NodeHandle>,
    batch_at: usize,
}

impl Placement {
    fn next_index(&self) -> usize {
        self.prev.map_or(0, |p| p + 1)
    }

    fn flush(
        &mut self,
        ctx: &PassContext<'_>,
        parent: NodeId,
        creates: &mut PendingCreates,
        channel: &mut dyn AuthorityChannel,
    ) -> usize {
        if self.batch.is_empty() {
            return 0;
        }
        let batch = std::mem::take(&mut self.batch);
        creates.send(&*ctx.store, &batch, Some(parent), self.batch_at, channel);
        for (offset, h) in batch.iter().enumerate() {
            self.work.insert(self.batch_at + offset, *h);
        }
        self.prev = Some(self.batch_at + batch.len() - 1);
        batch.len()
    }
}

/// Per-tick bookkeeping of the reconciler.
#[derive(Clone, Debug, Default)]
pub struct OrderReconciler {
    /// Parents whose local order must be reset to the authority's.
    forced: BTreeSet<NodeHandle>,
}

impl OrderReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `parent` for a forced inbound pass at the end of the tick.
    pub fn force_inbound(&mut self, parent: NodeHandle) {
        self.forced.insert(parent);
    }

    pub fn take_forced(&mut self) -> BTreeSet<NodeHandle> {
        std::mem::take(&mut self.forced)
    }

    pub fn has_forced(&self) -> bool {
        !self.forced.is_empty()
    }

    /// Apply the authoritative child order of `parent` to the local copy.
    ///
    /// Children the authority places under `parent` but that sit under
    /// another local parent are pulled over, unless that parent carries
    /// unsent local edits (`locally_edited`). Local children that belong to
    /// another authoritative parent are left alone and reported in
    /// `deferred`.
    pub fn reconcile_inbound(
        &mut self,
        parent: NodeHandle,
        ctx: &mut PassContext<'_>,
        locally_edited: &BTreeSet<NodeHandle>,
    ) -> InboundOutcome {
        let mut outcome = InboundOutcome::default();
        if !ctx.store.contains(parent) {
            return outcome;
        }

        let authoritative = ctx.tree.children(parent).to_vec();
        for child in &authoritative {
            let Some(node) = ctx.store.get(*child) else {
                continue;
            };
            if !node.lifecycle.is_live() || node.parent == Some(parent) {
                continue;
            }
            if node.parent.is_some_and(|q| locally_edited.contains(&q)) {
                continue;
            }
            ctx.adapter.set_local_parent(*child, Some(parent));
            match ctx.store.add_child(parent, *child, usize::MAX) {
                Ok(()) => outcome.reparented += 1,
                Err(err) => tracing::warn!(%err, "inbound re-parent dropped"),
            }
        }

        let mut local = ctx.adapter.local_child_order(parent);
        for child in &local {
            if let Some(Some(owner)) = ctx.tree.parent(*child) {
                if owner != parent && !outcome.deferred.contains(&owner) {
                    outcome.deferred.push(owner);
                }
            }
        }

        let moves = plan_moves(&mut local, &authoritative, |_| false);
        for m in &moves {
            ctx.adapter.move_local_child(m.item, m.index);
        }
        outcome.moves = moves.len();
        if let Err(err) = ctx.store.reorder_children(parent, &local) {
            tracing::warn!(%err, "store reorder dropped");
        }
        if outcome.moves > 0 || outcome.reparented > 0 {
            tracing::debug!(
                parent = %parent,
                moves = outcome.moves,
                reparented = outcome.reparented,
                "applied authoritative order"
            );
        }
        outcome
    }

    /// Push the local child order of `parent` to the authority.
    ///
    /// Unconfirmed children are created in contiguous batches at their
    /// computed index; children re-parented locally are moved over. A
    /// move involving a node locked by someone else aborts the pass and
    /// queues the parent for a forced inbound pass, so nothing is sent for
    /// it this tick.
    pub fn reconcile_outbound(
        &mut self,
        parent: NodeHandle,
        ctx: &mut PassContext<'_>,
        creates: &mut PendingCreates,
        channel: &mut dyn AuthorityChannel,
    ) -> OutboundOutcome {
        let mut outcome = OutboundOutcome::default();
        let Some(parent_node) = ctx.store.get(parent) else {
            return outcome;
        };
        if parent_node.conflicting || !parent_node.lifecycle.is_live() {
            return outcome;
        }
        let Some(parent_id) = parent_node.id else {
            outcome.waiting = true;
            return outcome;
        };
        if ctx.locks.classify(&*ctx.store, parent) == LockClass::Full {
            self.force_inbound(parent);
            outcome.forced = true;
            return outcome;
        }

        let local: Vec<NodeHandle> = ctx
            .adapter
            .local_child_order(parent)
            .into_iter()
            .filter(|h| {
                ctx.store
                    .get(*h)
                    .is_some_and(|n| n.lifecycle.is_live() && !n.conflicting)
            })
            .collect();

        for child in &local {
            if ctx.store.parent(*child) != Some(parent) {
                if let Err(err) = ctx.store.add_child(parent, *child, usize::MAX) {
                    tracing::warn!(%err, "local re-parent not adopted");
                }
            }
        }
        if let Err(err) = ctx.store.reorder_children(parent, &local) {
            tracing::warn!(%err, "store reorder dropped");
        }

        let status: HashMap<NodeHandle, ChildStatus> = local
            .iter()
            .map(|h| (*h, child_status(&*ctx, creates, parent, *h)))
            .collect();

        let known: Vec<NodeHandle> = local
            .iter()
            .copied()
            .filter(|h| status[h] == ChildStatus::Known)
            .collect();
        let mut work = ctx.tree.children(parent).to_vec();
        let adapter = &*ctx.adapter;
        let moves = plan_moves(&mut work, &known, |h| adapter.is_selected(*h));

        let blocked = moves
            .iter()
            .map(|m| m.item)
            .chain(
                local
                    .iter()
                    .copied()
                    .filter(|h| status[h] == ChildStatus::Reparented),
            )
            .any(|h| ctx.locks.classify(&*ctx.store, h) != LockClass::Free);
        if blocked {
            tracing::debug!(parent = %parent, "locked child in the way, reverting to authority");
            self.force_inbound(parent);
            outcome.forced = true;
            return outcome;
        }

        for m in &moves {
            if let Some(id) = ctx.store.id_of(m.item) {
                channel.set_child_index(id, m.index);
            }
        }
        outcome.moves = moves.len();

        let mut placement = Placement {
            work,
            prev: None,
            batch: Vec::new(),
            batch_at: 0,
        };
        for child in &local {
            match status[child] {
                ChildStatus::Known => {
                    outcome.created += placement.flush(ctx, parent_id, creates, channel);
                    placement.prev = placement.work.iter().position(|h| h == child);
                }
                ChildStatus::New => {
                    if placement.batch.is_empty() {
                        placement.batch_at = placement.next_index();
                    }
                    placement.batch.push(*child);
                }
                ChildStatus::Reparented => {
                    outcome.created += placement.flush(ctx, parent_id, creates, channel);
                    let index = placement.next_index();
                    if let Some(id) = ctx.store.id_of(*child) {
                        channel.set_parent(id, Some(parent_id), index);
                        placement.work.insert(index, *child);
                        placement.prev = Some(index);
                        outcome.reparented += 1;
                    }
                }
                ChildStatus::InFlight => {}
            }
        }
        outcome.created += placement.flush(ctx, parent_id, creates, channel);

        if outcome.moves + outcome.created + outcome.reparented > 0 {
            tracing::debug!(
                parent = %parent,
                moves = outcome.moves,
                created = outcome.created,
                reparented = outcome.reparented,
                "sent local order"
            );
        }
        outcome
    }
}

fn child_status(
    ctx: &PassContext<'_>,
    creates: &PendingCreates,
    parent: NodeHandle,
    child: NodeHandle,
) -> ChildStatus {
    match ctx.tree.parent(child) {
        Some(Some(p)) if p == parent => ChildStatus::Known,
        Some(_) => ChildStatus::Reparented,
        None if creates.is_in_flight(child) => ChildStatus::InFlight,
        None => ChildStatus::New,
    }
}
