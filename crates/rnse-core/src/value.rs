//! Attribute payloads carried by replicated nodes.
//!
//! The engine treats attributes as opaque except for references to other
//! nodes, which it must be able to find and rewrite. Locally a reference
//! names a [`NodeHandle`]; between participants it names the target's
//! [`NodeId`].

use crate::ids::{NodeHandle, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Ordered mapping from attribute name to value.
pub type Attributes = BTreeMap<String, AttributeValue>;

/// A link from an attribute to another node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReferenceValue {
    pub target: NodeHandle,
}

impl ReferenceValue {
    pub fn to(target: NodeHandle) -> Self {
        Self { target }
    }
}

/// A single attribute value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    /// Null value.
    #[default]
    Null,
    /// Boolean value.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// Floating point value.
    Float(f64),
    /// String value.
    String(String),
    /// Ordered list of values.
    List(Vec<AttributeValue>),
    /// Nested mapping.
    Map(Attributes),
    /// Reference to another node.
    Reference(ReferenceValue),
    /// Reference to another node by authority id. This is how references
    /// travel between participants, and how a local copy holds one whose
    /// target has not arrived yet.
    RemoteReference(NodeId),
}

impl AttributeValue {
    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttributeValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<ReferenceValue> {
        match self {
            AttributeValue::Reference(r) => Some(*r),
            _ => None,
        }
    }

    /// Visit every reference nested anywhere inside this value.
    pub fn for_each_reference(&self, f: &mut impl FnMut(ReferenceValue)) {
        match self {
            AttributeValue::Reference(r) => f(*r),
            AttributeValue::List(items) => {
                for item in items {
                    item.for_each_reference(f);
                }
            }
            AttributeValue::Map(map) => {
                for value in map.values() {
                    value.for_each_reference(f);
                }
            }
            _ => {}
        }
    }

    /// Visit every id-form reference nested inside this value.
    pub fn for_each_remote_reference(&self, f: &mut impl FnMut(NodeId)) {
        match self {
            AttributeValue::RemoteReference(id) => f(*id),
            AttributeValue::List(items) => {
                for item in items {
                    item.for_each_remote_reference(f);
                }
            }
            AttributeValue::Map(map) => {
                for value in map.values() {
                    value.for_each_remote_reference(f);
                }
            }
            _ => {}
        }
    }

    /// Rebuild this value with every reference (either form) replaced by
    /// what `f` returns for it.
    pub fn map_references(&self, f: &mut impl FnMut(&AttributeValue) -> AttributeValue) -> AttributeValue {
        match self {
            AttributeValue::Reference(_) | AttributeValue::RemoteReference(_) => f(self),
            AttributeValue::List(items) => {
                AttributeValue::List(items.iter().map(|v| v.map_references(f)).collect())
            }
            AttributeValue::Map(map) => AttributeValue::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.map_references(f)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Rewrite every reference to `from` so it points at `to`.
    /// Returns the number of references rewritten.
    pub fn retarget(&mut self, from: NodeHandle, to: NodeHandle) -> usize {
        match self {
            AttributeValue::Reference(r) if r.target == from => {
                r.target = to;
                1
            }
            AttributeValue::List(items) => items.iter_mut().map(|v| v.retarget(from, to)).sum(),
            AttributeValue::Map(map) => map.values_mut().map(|v| v.retarget(from, to)).sum(),
            _ => 0,
        }
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> Self {
        AttributeValue::Bool(b)
    }
}

impl From<i64> for AttributeValue {
    fn from(i: i64) -> Self {
        AttributeValue::Int(i)
    }
}

impl From<f64> for AttributeValue {
    fn from(f: f64) -> Self {
        AttributeValue::Float(f)
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        AttributeValue::String(s.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        AttributeValue::String(s)
    }
}

impl From<ReferenceValue> for AttributeValue {
    fn from(r: ReferenceValue) -> Self {
        AttributeValue::Reference(r)
    }
}

/// Collect the distinct targets referenced by an attribute map.
pub fn referenced_targets(attributes: &Attributes) -> BTreeSet<NodeHandle> {
    let mut targets = BTreeSet::new();
    for value in attributes.values() {
        value.for_each_reference(&mut |r| {
            targets.insert(r.target);
        });
    }
    targets
}

/// Collect the distinct ids referenced in id form.
pub fn remote_references(attributes: &Attributes) -> BTreeSet<NodeId> {
    let mut ids = BTreeSet::new();
    for value in attributes.values() {
        value.for_each_remote_reference(&mut |id| {
            ids.insert(id);
        });
    }
    ids
}

/// Apply [`AttributeValue::map_references`] across a whole attribute map.
pub fn map_references(
    attributes: &Attributes,
    f: &mut impl FnMut(&AttributeValue) -> AttributeValue,
) -> Attributes {
    attributes
        .iter()
        .map(|(k, v)| (k.clone(), v.map_references(f)))
        .collect()
}

/// Rewrite references across a whole attribute map.
pub fn retarget_references(attributes: &mut Attributes, from: NodeHandle, to: NodeHandle) -> usize {
    attributes
        .values_mut()
        .map(|value| value.retarget(from, to))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(target: NodeHandle, other: NodeHandle) -> Attributes {
        let mut nested = Attributes::new();
        nested.insert("material".into(), ReferenceValue::to(target).into());
        let mut attrs = Attributes::new();
        attrs.insert("name".into(), "crate".into());
        attrs.insert("mesh".into(), ReferenceValue::to(target).into());
        attrs.insert(
            "slots".into(),
            AttributeValue::List(vec![AttributeValue::Map(nested), ReferenceValue::to(other).into()]),
        );
        attrs
    }

    #[test]
    fn test_referenced_targets_walks_nested_values() {
        let a = NodeHandle::new();
        let b = NodeHandle::new();
        let targets = referenced_targets(&sample(a, b));
        assert_eq!(targets.len(), 2);
        assert!(targets.contains(&a));
        assert!(targets.contains(&b));
    }

    #[test]
    fn test_retarget_rewrites_all_occurrences() {
        let a = NodeHandle::new();
        let b = NodeHandle::new();
        let c = NodeHandle::new();
        let mut attrs = sample(a, b);

        assert_eq!(retarget_references(&mut attrs, a, c), 2);
        let targets = referenced_targets(&attrs);
        assert!(!targets.contains(&a));
        assert!(targets.contains(&c));
        assert!(targets.contains(&b));
    }

    #[test]
    fn test_map_references_swaps_forms_in_place() {
        let a = NodeHandle::new();
        let b = NodeHandle::new();
        let attrs = sample(a, b);

        let remote = map_references(&attrs, &mut |r| match r.as_reference() {
            Some(r) if r.target == a => AttributeValue::RemoteReference(NodeId(1)),
            _ => r.clone(),
        });
        assert_eq!(remote["name"], AttributeValue::from("crate"));
        assert_eq!(remote["mesh"], AttributeValue::RemoteReference(NodeId(1)));
        assert_eq!(remote_references(&remote).into_iter().collect::<Vec<_>>(), vec![NodeId(1)]);
        assert_eq!(referenced_targets(&remote).into_iter().collect::<Vec<_>>(), vec![b]);

        let back = map_references(&remote, &mut |r| match r {
            AttributeValue::RemoteReference(NodeId(1)) => ReferenceValue::to(a).into(),
            other => other.clone(),
        });
        assert_eq!(back, attrs);
    }

    #[test]
    fn test_accessors() {
        assert_eq!(AttributeValue::from(3i64).as_int(), Some(3));
        assert_eq!(AttributeValue::from("x").as_str(), Some("x"));
        assert!(AttributeValue::default().is_null());
        assert_eq!(AttributeValue::from(true).as_bool(), Some(true));
    }
}
