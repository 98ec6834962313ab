//! # rnse-session
//!
//! Async driver for the replicated node synchronization engine.
//!
//! A [`Session`] owns one [`SyncEngine`](rnse_sync::SyncEngine) and its
//! local scene, feeds it authority events, ticks it and forwards what it
//! produces through an [`AuthorityTransport`]. [`MemoryAuthority`] is an
//! in-process authority for tests and simulation.
//!
//! ## Example
//!
//! ```rust
//! use rnse_core::{Attributes, NodeFlags, NodeKind};
//! use rnse_session::{settle, MemoryAuthority, Session};
//! use rnse_sync::{MemoryScene, SyncConfig};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let authority = Arc::new(MemoryAuthority::new());
//! let alice = Session::connect(SyncConfig::builder("alice").build(), MemoryScene::new(), authority.clone())
//!     .await
//!     .unwrap();
//!
//! alice.edit(|engine, scene| {
//!     let root = engine
//!         .create_local(NodeKind::new("group"), Attributes::new(), None, 0, NodeFlags::default())
//!         .unwrap();
//!     scene.insert(root, None, 0);
//! });
//! settle(&[&alice], 16).await.unwrap();
//! assert_eq!(authority.len(), 1);
//! # });
//! ```

pub mod authority;
pub mod error;
pub mod session;

pub use authority::{AuthorityTransport, MemoryAuthority};
pub use error::{Result, SessionError};
pub use session::{settle, Session, SessionEvent};
