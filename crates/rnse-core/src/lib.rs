//! # rnse-core
//!
//! Node model for the Replicated Node Synchronization Engine.
//!
//! This crate provides:
//! - Identifiers for nodes, participants, kinds and entities
//! - Attribute payloads with node references
//! - The replicated node and its lock / lifecycle states
//! - Content checksums
//! - The error taxonomy shared by the engine
//!
//! ## Example
//!
//! ```rust
//! use rnse_core::{Attributes, NodeFlags, NodeKind, ReferenceValue, ReplicatedNode};
//!
//! let material = ReplicatedNode::pending(NodeKind::new("material"), Attributes::new(), NodeFlags::default());
//!
//! let mut attrs = Attributes::new();
//! attrs.insert("material".into(), ReferenceValue::to(material.handle).into());
//! let mesh = ReplicatedNode::pending(NodeKind::new("mesh"), attrs, NodeFlags::default());
//!
//! assert!(rnse_core::referenced_targets(&mesh.attributes).contains(&material.handle));
//! ```

pub mod checksum;
pub mod error;
pub mod ids;
pub mod node;
pub mod value;

pub use checksum::ContentChecksum;
pub use error::{Result, SyncError};
pub use ids::{EntityKey, NodeHandle, NodeId, NodeKind, ParticipantId};
pub use node::{DirectLock, Lifecycle, LockState, NodeFlags, ReplicatedNode};
pub use value::{
    map_references, referenced_targets, remote_references, retarget_references, AttributeValue,
    Attributes, ReferenceValue,
};
