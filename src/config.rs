//! Node configuration
//!
//! A node is configured from the compiled topology artifact produced by
//! the external config compiler: a JSON document naming this node, where
//! it listens, where its parent lives and which fallbacks to try when
//! the parent is permanently lost. Unknown fields are ignored; the
//! artifact schema belongs to the compiler, this module only consumes
//! the subset the core needs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::link::{BackoffPolicy, LinkSettings};
use crate::NodeId;

/// Tuning knobs with workable defaults. Operators override them through
/// the artifact's `tuning` table.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Tuning {
    pub heartbeat_interval_ms: u64,
    pub heartbeat_miss_limit: u32,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    /// Parent dial attempts before giving up and re-parenting.
    pub reconnect_attempts: u32,
    pub dedup_window_secs: u64,
    pub dedup_capacity: usize,
    pub link_queue_depth: usize,
    pub default_ttl: u32,
    pub exec_concurrency: usize,
}

impl Default for Tuning {
    fn default() -> Self {
        Tuning {
            heartbeat_interval_ms: 2_000,
            heartbeat_miss_limit: 3,
            reconnect_base_ms: 500,
            reconnect_max_ms: 30_000,
            reconnect_attempts: 8,
            dedup_window_secs: 120,
            dedup_capacity: 8_192,
            link_queue_depth: 64,
            default_ttl: 32,
            exec_concurrency: 4,
        }
    }
}

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub listen: String,
    /// Address other nodes dial; defaults to `listen`.
    pub advertise: Option<String>,
    /// None means this node is the root.
    pub parent_addr: Option<String>,
    /// Tried in order when the configured parent is lost for good.
    pub fallback_parents: Vec<String>,
    /// Children this node dials at startup instead of waiting for them.
    pub bootstrap_children: Vec<String>,
    /// Where to persist topology snapshots; None disables persistence.
    pub state_path: Option<PathBuf>,
    pub tuning: Tuning,
}

impl NodeConfig {
    /// Configuration for the tree root.
    pub fn root(node_id: impl Into<NodeId>, listen: impl Into<String>) -> Self {
        NodeConfig {
            node_id: node_id.into(),
            listen: listen.into(),
            advertise: None,
            parent_addr: None,
            fallback_parents: Vec::new(),
            bootstrap_children: Vec::new(),
            state_path: None,
            tuning: Tuning::default(),
        }
    }

    /// Configuration for a node joining under a parent.
    pub fn joining(
        node_id: impl Into<NodeId>,
        listen: impl Into<String>,
        parent_addr: impl Into<String>,
    ) -> Self {
        NodeConfig {
            parent_addr: Some(parent_addr.into()),
            ..NodeConfig::root(node_id, listen)
        }
    }

    pub fn with_advertise_address(mut self, advertise: impl Into<String>) -> Self {
        self.advertise = Some(advertise.into());
        self
    }

    pub fn with_fallback_parents(mut self, fallbacks: Vec<String>) -> Self {
        self.fallback_parents = fallbacks;
        self
    }

    pub fn with_bootstrap_children(mut self, children: Vec<String>) -> Self {
        self.bootstrap_children = children;
        self
    }

    pub fn with_state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_path = Some(path.into());
        self
    }

    pub fn with_tuning(mut self, tuning: Tuning) -> Self {
        self.tuning = tuning;
        self
    }

    /// Load the compiled topology artifact.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let artifact: TopologyArtifact =
            serde_json::from_slice(&bytes).map_err(|e| ConfigError::Parse {
                reason: e.to_string(),
            })?;
        artifact.into_config()
    }

    pub fn advertise_addr(&self) -> &str {
        self.advertise.as_deref().unwrap_or(&self.listen)
    }

    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            queue_depth: self.tuning.link_queue_depth,
            heartbeat_interval: Duration::from_millis(self.tuning.heartbeat_interval_ms),
            heartbeat_miss_limit: self.tuning.heartbeat_miss_limit,
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(self.tuning.reconnect_base_ms),
                max_delay: Duration::from_millis(self.tuning.reconnect_max_ms),
            },
            dial_attempts: self.tuning.reconnect_attempts,
        }
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.tuning.dedup_window_secs)
    }
}

/// The subset of the compiled artifact the core consumes.
#[derive(Debug, Deserialize)]
struct TopologyArtifact {
    node_id: String,
    listen: String,
    #[serde(default)]
    advertise: Option<String>,
    #[serde(default)]
    parent: Option<String>,
    #[serde(default)]
    fallback_parents: Vec<String>,
    #[serde(default)]
    children: Vec<String>,
    #[serde(default)]
    state_path: Option<PathBuf>,
    #[serde(default)]
    tuning: Tuning,
}

impl TopologyArtifact {
    fn into_config(self) -> Result<NodeConfig, ConfigError> {
        if self.node_id.is_empty() {
            return Err(ConfigError::Invalid {
                reason: "node_id must not be empty".to_string(),
            });
        }
        if self.listen.is_empty() {
            return Err(ConfigError::Invalid {
                reason: "listen address must not be empty".to_string(),
            });
        }
        Ok(NodeConfig {
            node_id: self.node_id,
            listen: self.listen,
            advertise: self.advertise,
            parent_addr: self.parent,
            fallback_parents: self.fallback_parents,
            bootstrap_children: self.children,
            state_path: self.state_path,
            tuning: self.tuning,
        })
    }
}
