//! Creation Race Resolver.
//!
//! Nodes whose kind defines an entity key are indexed by that key. When a
//! key gathers more than one live node, the one confirmed first by the
//! authority survives and the rest lose. Confirmation order is the
//! authority's sequence number, so every participant picks the same
//! survivor. Between two unconfirmed nodes the handle order decides.

use crate::store::NodeStore;
use rnse_core::{EntityKey, NodeHandle, ReplicatedNode};
use std::collections::{BTreeSet, HashMap};

/// One duplicate collapsed into its survivor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub key: EntityKey,
    pub survivor: NodeHandle,
    pub loser: NodeHandle,
}

#[derive(Clone, Debug, Default)]
pub struct CreationRaceResolver {
    by_key: HashMap<EntityKey, BTreeSet<NodeHandle>>,
    dirty: BTreeSet<EntityKey>,
}

/// Smaller ranks survive.
fn rank(node: &ReplicatedNode) -> (bool, u64, u64, NodeHandle) {
    match (node.confirmed_seq, node.id) {
        (Some(seq), Some(id)) => (false, seq, id.0, node.handle),
        _ => (true, 0, 0, node.handle),
    }
}

impl CreationRaceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, key: EntityKey, handle: NodeHandle) {
        if self.by_key.entry(key.clone()).or_default().insert(handle) {
            self.dirty.insert(key);
        }
    }

    pub fn untrack(&mut self, key: &EntityKey, handle: NodeHandle) {
        if let Some(handles) = self.by_key.get_mut(key) {
            handles.remove(&handle);
            if handles.is_empty() {
                self.by_key.remove(key);
            }
        }
    }

    /// A tracked node was confirmed; its key needs another look.
    pub fn touch(&mut self, key: &EntityKey) {
        if self.by_key.contains_key(key) {
            self.dirty.insert(key.clone());
        }
    }

    pub fn contenders(&self, key: &EntityKey) -> Vec<NodeHandle> {
        self.by_key
            .get(key)
            .map(|h| h.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Resolve every key touched since the last call. Losers are removed
    /// from the index; deleting them is up to the caller.
    pub fn resolve(&mut self, store: &NodeStore) -> Vec<Resolution> {
        let mut resolutions = Vec::new();
        for key in std::mem::take(&mut self.dirty) {
            let Some(handles) = self.by_key.get_mut(&key) else {
                continue;
            };
            handles.retain(|h| store.get(*h).is_some_and(|n| n.lifecycle.is_live()));

            let Some(survivor) = handles
                .iter()
                .filter_map(|h| store.get(*h))
                .min_by_key(|n| rank(n))
                .map(|n| n.handle)
            else {
                self.by_key.remove(&key);
                continue;
            };

            for loser in handles.iter().copied().filter(|h| *h != survivor) {
                tracing::info!(
                    key = %key,
                    survivor = %survivor,
                    loser = %loser,
                    "duplicate creation resolved"
                );
                resolutions.push(Resolution {
                    key: key.clone(),
                    survivor,
                    loser,
                });
            }
            handles.retain(|h| *h == survivor);
        }
        resolutions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rnse_core::{Attributes, NodeFlags, NodeId, NodeKind};

    fn key() -> EntityKey {
        EntityKey::new("texture:rock.png")
    }

    fn pending(store: &mut NodeStore) -> NodeHandle {
        store
            .insert(ReplicatedNode::pending(
                NodeKind::new("texture"),
                Attributes::new(),
                NodeFlags::default(),
            ))
            .unwrap()
    }

    fn confirmed(store: &mut NodeStore, id: u64, seq: u64) -> NodeHandle {
        store
            .insert(ReplicatedNode::confirmed(
                NodeId(id),
                seq,
                NodeKind::new("texture"),
                Attributes::new(),
                NodeFlags::default(),
            ))
            .unwrap()
    }

    #[test]
    fn test_confirmed_first_survives() {
        let mut store = NodeStore::new();
        let late = confirmed(&mut store, 1, 9);
        let early = confirmed(&mut store, 2, 4);
        let local = pending(&mut store);

        let mut resolver = CreationRaceResolver::new();
        for h in [late, early, local] {
            resolver.track(key(), h);
        }
        let resolutions = resolver.resolve(&store);

        assert_eq!(resolutions.len(), 2);
        assert!(resolutions.iter().all(|r| r.survivor == early));
        assert_eq!(resolver.contenders(&key()), vec![early]);
    }

    #[test]
    fn test_two_pending_resolve_by_handle() {
        let mut store = NodeStore::new();
        let a = pending(&mut store);
        let b = pending(&mut store);

        let mut resolver = CreationRaceResolver::new();
        resolver.track(key(), b);
        resolver.track(key(), a);
        let resolutions = resolver.resolve(&store);

        assert_eq!(resolutions.len(), 1);
        assert_eq!(resolutions[0].survivor, a.min(b));
        assert_eq!(resolutions[0].loser, a.max(b));
    }

    #[test]
    fn test_single_contender_is_not_a_race() {
        let mut store = NodeStore::new();
        let a = pending(&mut store);
        let mut resolver = CreationRaceResolver::new();
        resolver.track(key(), a);
        assert!(resolver.resolve(&store).is_empty());
        assert!(resolver.resolve(&store).is_empty());
    }

    #[test]
    fn test_dead_contenders_are_dropped() {
        let mut store = NodeStore::new();
        let a = confirmed(&mut store, 1, 1);
        let b = confirmed(&mut store, 2, 2);
        store.discard(a);

        let mut resolver = CreationRaceResolver::new();
        resolver.track(key(), a);
        resolver.track(key(), b);
        assert!(resolver.resolve(&store).is_empty());
        assert_eq!(resolver.contenders(&key()), vec![b]);
    }
}
