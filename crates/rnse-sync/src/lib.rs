//! # rnse-sync
//!
//! Tick-driven synchronization of a replicated scene graph against a single
//! authority.
//!
//! This crate provides:
//! - The node store and lock coordinator
//! - Child-order reconciliation in both directions with minimal moves
//! - Creation race resolution by entity key
//! - Broken-reference and content-conflict notifications
//! - The [`SyncEngine`] tying them together
//!
//! ## Example
//!
//! ```rust
//! use rnse_core::{Attributes, NodeFlags, NodeKind};
//! use rnse_sync::{MemoryScene, NotificationLog, OpBuffer, SyncConfig, SyncEngine};
//!
//! let mut engine = SyncEngine::new(SyncConfig::builder("alice").build());
//! let mut scene = MemoryScene::new();
//! let mut ops = OpBuffer::new();
//!
//! let root = engine
//!     .create_local(NodeKind::new("group"), Attributes::new(), None, 0, NodeFlags::default())
//!     .unwrap();
//! scene.insert(root, None, 0);
//!
//! engine.tick(&mut scene, &mut ops, &mut NotificationLog::new());
//! assert_eq!(ops.len(), 1);
//! ```

pub mod channel;
pub mod config;
pub mod engine;
pub mod kinds;
pub mod lock;
pub mod memory;
pub mod notify;
pub mod order;
pub mod race;
pub mod store;

pub use channel::{
    AuthorityChannel, AuthorityEvent, AuthorityOp, CreateRequest, LocalAdapter, LocalContent,
    NotificationSink, NullSink, OpBuffer,
};
pub use config::{KindConfig, SyncConfig, SyncConfigBuilder};
pub use engine::{DeleteOutcome, SyncEngine, TickReport};
pub use kinds::{KindSpec, KindTable};
pub use lock::{LockClass, LockCommand, LockCoordinator, LockOwner, LockRequestOutcome};
pub use memory::{MemoryScene, NotificationLog};
pub use notify::{
    check_content, ContentVerdict, Notification, NotificationKind, ReferenceIndex,
    ReferenceNotifier,
};
pub use order::{
    plan_moves, AuthoritativeTree, InboundOutcome, Move, OrderReconciler, OutboundOutcome,
    PassContext, PendingCreates,
};
pub use race::{CreationRaceResolver, Resolution};
pub use store::NodeStore;
