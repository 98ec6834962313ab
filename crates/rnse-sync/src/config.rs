//! Engine configuration.

use rnse_core::{NodeKind, ParticipantId, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Behaviour of one node kind.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindConfig {
    /// Attribute whose value identifies the logical entity a node stands
    /// for (e.g. an asset path). Nodes of this kind with equal values race.
    #[serde(default)]
    pub entity_key: Option<String>,

    /// Whether remote creates carry a content checksum to verify against
    /// pre-existing local content.
    #[serde(default)]
    pub checks_content: bool,
}

/// Configuration for a [`SyncEngine`](crate::SyncEngine).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// The local participant.
    pub participant: ParticipantId,

    /// Per-kind behaviour. Kinds not listed have no entity key and no
    /// content check.
    #[serde(default)]
    pub kinds: BTreeMap<NodeKind, KindConfig>,

    /// Interval between ticks when driven by a session loop.
    pub tick_interval_ms: u64,

    /// Clear a broken target once nothing references it any more.
    pub auto_clear_broken: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            participant: ParticipantId::new("local"),
            kinds: BTreeMap::new(),
            tick_interval_ms: 50,
            auto_clear_broken: true,
        }
    }
}

impl SyncConfig {
    pub fn builder(participant: impl Into<String>) -> SyncConfigBuilder {
        SyncConfigBuilder::new(participant)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Builder for [`SyncConfig`].
#[derive(Clone, Debug)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new(participant: impl Into<String>) -> Self {
        SyncConfigBuilder {
            config: SyncConfig {
                participant: ParticipantId::new(participant),
                ..Default::default()
            },
        }
    }

    /// Nodes of `kind` race on the value of `attribute`.
    pub fn with_entity_key(mut self, kind: impl Into<String>, attribute: impl Into<String>) -> Self {
        self.config
            .kinds
            .entry(NodeKind::new(kind))
            .or_default()
            .entity_key = Some(attribute.into());
        self
    }

    /// Verify content checksums for nodes of `kind`.
    pub fn with_content_check(mut self, kind: impl Into<String>) -> Self {
        self.config
            .kinds
            .entry(NodeKind::new(kind))
            .or_default()
            .checks_content = true;
        self
    }

    pub fn with_tick_interval_ms(mut self, ms: u64) -> Self {
        self.config.tick_interval_ms = ms;
        self
    }

    pub fn with_auto_clear_broken(mut self, enabled: bool) -> Self {
        self.config.auto_clear_broken = enabled;
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}
