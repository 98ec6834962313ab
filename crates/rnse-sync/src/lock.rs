//! Lock Coordinator - exclusive per-node editing claims.
//!
//! Only a node's own claim is stored (see [`DirectLock`]). Everything else
//! is derived on read from the store:
//! - a held lock propagates to every descendant
//! - a node with no claim but a locked descendant reads as partially locked
//!
//! Requests never block. A request on a node held by someone else is
//! queued and fires on its own once that lock is released.

use rnse_core::{DirectLock, Lifecycle, LockState, NodeHandle, ParticipantId, Result, SyncError};
use std::collections::{BTreeSet, HashSet};

use crate::store::NodeStore;

/// Write-gating classification of a node, considering only locks held by
/// other participants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockClass {
    /// No foreign lock on the node, its ancestors or its descendants.
    Free,
    /// A descendant is locked by someone else: attributes may be written,
    /// but the node must not be moved or deleted.
    Partial,
    /// The node or an ancestor is locked by someone else.
    Full,
}

/// Outcome of a lock request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockRequestOutcome {
    /// A request will be sent to the authority.
    Requested,
    /// Held elsewhere; the request fires once that lock is released.
    Queued,
    /// Already held locally.
    AlreadyHeld,
}

/// Lock traffic for the authority, drained in the outbound phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockCommand {
    Request(NodeHandle),
    Release(NodeHandle),
}

/// Lock owner as seen by the local participant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockOwner {
    Local,
    Other(ParticipantId),
}

#[derive(Clone, Debug, Default)]
pub struct LockCoordinator {
    /// Requests waiting for a foreign lock to be released.
    queued: BTreeSet<NodeHandle>,
    /// Commands not yet handed to the authority.
    outgoing: Vec<LockCommand>,
    /// Requests retracted after they were sent; released as soon as granted.
    release_on_grant: HashSet<NodeHandle>,
}

impl LockCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request an exclusive lock on `handle`.
    pub fn request_lock(
        &mut self,
        store: &mut NodeStore,
        handle: NodeHandle,
    ) -> Result<LockRequestOutcome> {
        let node = store.get(handle).ok_or(SyncError::NodeNotFound(handle))?;
        if matches!(node.lifecycle, Lifecycle::DeletePending | Lifecycle::Deleted) {
            tracing::warn!(node = %handle, lifecycle = ?node.lifecycle, "lock request on dead node dropped");
            return Err(SyncError::InvalidState {
                handle,
                lifecycle: node.lifecycle,
                operation: "request_lock",
            });
        }

        match node.lock.clone() {
            DirectLock::Local => Ok(LockRequestOutcome::AlreadyHeld),
            DirectLock::Requested => {
                self.release_on_grant.remove(&handle);
                Ok(LockRequestOutcome::Requested)
            }
            DirectLock::Other(_) => {
                self.queued.insert(handle);
                Ok(LockRequestOutcome::Queued)
            }
            DirectLock::Unlocked => {
                if self.classify(store, handle) == LockClass::Full {
                    self.queued.insert(handle);
                    return Ok(LockRequestOutcome::Queued);
                }
                self.send_request(store, handle);
                Ok(LockRequestOutcome::Requested)
            }
        }
    }

    fn send_request(&mut self, store: &mut NodeStore, handle: NodeHandle) {
        if let Some(node) = store.get_mut(handle) {
            node.lock = DirectLock::Requested;
        }
        self.outgoing.push(LockCommand::Request(handle));
    }

    /// Release a lock held locally, or retract a request that has not been
    /// granted yet.
    pub fn release_lock(&mut self, store: &mut NodeStore, handle: NodeHandle) -> Result<()> {
        let node = store.get(handle).ok_or(SyncError::NodeNotFound(handle))?;
        match node.lock.clone() {
            DirectLock::Local => {
                if let Some(node) = store.get_mut(handle) {
                    node.lock = DirectLock::Unlocked;
                }
                self.outgoing.push(LockCommand::Release(handle));
                Ok(())
            }
            DirectLock::Requested => {
                self.retract_request(store, handle);
                Ok(())
            }
            DirectLock::Other(owner) => {
                // Only our own queued intent can be cleared here.
                if self.queued.remove(&handle) {
                    Ok(())
                } else {
                    Err(SyncError::LockConflict { handle, owner })
                }
            }
            DirectLock::Unlocked => {
                self.queued.remove(&handle);
                Ok(())
            }
        }
    }

    /// Clear a pending request. Nothing was applied before the grant, so
    /// there is nothing to roll back.
    pub fn retract_request(&mut self, store: &mut NodeStore, handle: NodeHandle) {
        self.queued.remove(&handle);
        let Some(node) = store.get_mut(handle) else {
            return;
        };
        if node.lock != DirectLock::Requested {
            return;
        }
        node.lock = DirectLock::Unlocked;
        let before = self.outgoing.len();
        self.outgoing
            .retain(|c| *c != LockCommand::Request(handle));
        if self.outgoing.len() == before {
            // Already sent: give it back as soon as it arrives.
            self.release_on_grant.insert(handle);
        }
    }

    /// The authority granted the lock on `handle` to `owner`.
    pub fn on_granted(&mut self, store: &mut NodeStore, handle: NodeHandle, owner: LockOwner) {
        let Some(node) = store.get_mut(handle) else {
            return;
        };
        match owner {
            LockOwner::Local => {
                if self.release_on_grant.remove(&handle) {
                    node.lock = DirectLock::Unlocked;
                    self.outgoing.push(LockCommand::Release(handle));
                } else {
                    node.lock = DirectLock::Local;
                }
            }
            LockOwner::Other(participant) => {
                let lost_race = node.lock == DirectLock::Requested;
                node.lock = DirectLock::Other(participant);
                self.release_on_grant.remove(&handle);
                if lost_race {
                    self.queued.insert(handle);
                }
            }
        }
    }

    /// The authority released the lock on `handle`. Returns the queued
    /// requests that fired as a result.
    pub fn on_released(&mut self, store: &mut NodeStore, handle: NodeHandle) -> Vec<NodeHandle> {
        if let Some(node) = store.get_mut(handle) {
            if node.lock.is_held() {
                node.lock = DirectLock::Unlocked;
            }
        }
        self.fire_queued(store)
    }

    /// A participant left the session: drop every lock it held.
    pub fn on_participant_left(
        &mut self,
        store: &mut NodeStore,
        participant: &ParticipantId,
    ) -> Vec<NodeHandle> {
        let held: Vec<NodeHandle> = store
            .iter()
            .filter(|n| matches!(&n.lock, DirectLock::Other(p) if p == participant))
            .map(|n| n.handle)
            .collect();
        for handle in held {
            if let Some(node) = store.get_mut(handle) {
                node.lock = DirectLock::Unlocked;
            }
        }
        self.fire_queued(store)
    }

    fn fire_queued(&mut self, store: &mut NodeStore) -> Vec<NodeHandle> {
        let ready: Vec<NodeHandle> = self
            .queued
            .iter()
            .copied()
            .filter(|h| {
                store.get(*h).is_some_and(|n| {
                    n.lifecycle.is_live() && !n.lock.is_held()
                }) && self.classify(store, *h) != LockClass::Full
            })
            .collect();
        for handle in &ready {
            self.queued.remove(handle);
            self.send_request(store, *handle);
        }
        ready
    }

    /// Forget everything about a node that left the store.
    pub fn forget(&mut self, handle: NodeHandle) {
        self.queued.remove(&handle);
        self.release_on_grant.remove(&handle);
        self.outgoing.retain(|c| match c {
            LockCommand::Request(h) | LockCommand::Release(h) => *h != handle,
        });
    }

    pub fn is_queued(&self, handle: NodeHandle) -> bool {
        self.queued.contains(&handle)
    }

    pub fn has_commands(&self) -> bool {
        !self.outgoing.is_empty()
    }

    /// Hand over pending lock traffic.
    pub fn take_commands(&mut self) -> Vec<LockCommand> {
        std::mem::take(&mut self.outgoing)
    }

    /// Put back commands that could not be sent yet (node still pending).
    pub fn requeue(&mut self, commands: Vec<LockCommand>) {
        let mut commands = commands;
        commands.append(&mut self.outgoing);
        self.outgoing = commands;
    }

    /// Current lock state of a node, derived from its own claim and the
    /// claims of its descendants.
    pub fn lock_state(&self, store: &NodeStore, handle: NodeHandle) -> Option<LockState> {
        let node = store.get(handle)?;
        let state = match &node.lock {
            DirectLock::Local => LockState::LockedByLocal,
            DirectLock::Other(owner) => LockState::LockedByOther(owner.clone()),
            direct => {
                let descendant_locked = store
                    .descendants(handle)
                    .into_iter()
                    .any(|d| store.get(d).is_some_and(|n| n.lock.is_held()));
                if descendant_locked {
                    LockState::PartiallyLocked
                } else if *direct == DirectLock::Requested {
                    LockState::LockRequested
                } else {
                    LockState::Unlocked
                }
            }
        };
        Some(state)
    }

    /// Nearest held lock on the node or any ancestor.
    pub fn effective_owner(&self, store: &NodeStore, handle: NodeHandle) -> Option<LockOwner> {
        std::iter::once(handle)
            .chain(store.ancestors(handle))
            .find_map(|h| match store.get(h).map(|n| &n.lock) {
                Some(DirectLock::Local) => Some(LockOwner::Local),
                Some(DirectLock::Other(p)) => Some(LockOwner::Other(p.clone())),
                _ => None,
            })
    }

    pub fn classify(&self, store: &NodeStore, handle: NodeHandle) -> LockClass {
        if let Some(LockOwner::Other(_)) = self.effective_owner(store, handle) {
            return LockClass::Full;
        }
        let foreign_below = store
            .descendants(handle)
            .into_iter()
            .any(|d| matches!(store.get(d).map(|n| &n.lock), Some(DirectLock::Other(_))));
        if foreign_below {
            LockClass::Partial
        } else {
            LockClass::Free
        }
    }

    /// Gate a local attribute write.
    pub fn check_writable(&self, store: &NodeStore, handle: NodeHandle) -> Result<()> {
        match self.effective_owner(store, handle) {
            Some(LockOwner::Other(owner)) => Err(SyncError::LockConflict { handle, owner }),
            _ => Ok(()),
        }
    }
}
