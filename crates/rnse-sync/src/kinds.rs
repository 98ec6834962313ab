//! Kind dispatch table, resolved once from [`SyncConfig`].

use crate::config::SyncConfig;
use rnse_core::{AttributeValue, Attributes, EntityKey, NodeKind};
use std::collections::HashMap;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KindSpec {
    pub entity_key_attribute: Option<String>,
    pub checks_content: bool,
}

#[derive(Clone, Debug, Default)]
pub struct KindTable {
    specs: HashMap<NodeKind, KindSpec>,
    fallback: KindSpec,
}

impl KindTable {
    pub fn from_config(config: &SyncConfig) -> Self {
        let specs = config
            .kinds
            .iter()
            .map(|(kind, c)| {
                (
                    kind.clone(),
                    KindSpec {
                        entity_key_attribute: c.entity_key.clone(),
                        checks_content: c.checks_content,
                    },
                )
            })
            .collect();
        KindTable {
            specs,
            fallback: KindSpec::default(),
        }
    }

    pub fn spec(&self, kind: &NodeKind) -> &KindSpec {
        self.specs.get(kind).unwrap_or(&self.fallback)
    }

    /// Entity key of a node of `kind`, if the kind defines one and the
    /// attribute holds a scalar.
    pub fn entity_key(&self, kind: &NodeKind, attributes: &Attributes) -> Option<EntityKey> {
        let attribute = self.spec(kind).entity_key_attribute.as_ref()?;
        let value = match attributes.get(attribute)? {
            AttributeValue::String(s) => s.clone(),
            AttributeValue::Int(i) => i.to_string(),
            AttributeValue::Bool(b) => b.to_string(),
            _ => return None,
        };
        // Keys are scoped by kind so unrelated kinds never race.
        Some(EntityKey::new(format!("{}:{}", kind.as_str(), value)))
    }

    pub fn checks_content(&self, kind: &NodeKind) -> bool {
        self.spec(kind).checks_content
    }
}
