//! Immutable topology snapshots and their persistence
//!
//! Snapshots are what every component outside the runtime control task
//! sees of the topology, and what gets persisted so a restarted node can
//! reconnect without a fresh config artifact.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::StateError;
use crate::NodeId;

/// A consistent, immutable view of the node's neighborhood.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub self_id: NodeId,
    pub parent: Option<NodeId>,
    /// Address the current parent was dialed at, kept for restart recovery.
    pub parent_addr: Option<String>,
    pub children: Vec<NodeId>,
    /// Per-child descendant cache (child included in its own set).
    /// May be missing entries for children that have not reported yet.
    pub descendants: BTreeMap<NodeId, Vec<NodeId>>,
}

impl TopologySnapshot {
    /// Placeholder view used before the runtime publishes the real one.
    pub fn empty(self_id: NodeId) -> Self {
        TopologySnapshot {
            self_id,
            parent: None,
            parent_addr: None,
            children: Vec::new(),
            descendants: BTreeMap::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Every node in this subtree, self included.
    pub fn subtree(&self) -> Vec<NodeId> {
        let mut all: Vec<NodeId> = vec![self.self_id.clone()];
        for child in &self.children {
            match self.descendants.get(child) {
                Some(set) => all.extend(set.iter().cloned()),
                None => all.push(child.clone()),
            }
        }
        all.sort();
        all.dedup();
        all
    }

    /// True when every child has reported its descendant set, i.e. the
    /// cache can be trusted for fan-out pruning.
    pub fn cache_complete(&self) -> bool {
        self.children
            .iter()
            .all(|c| self.descendants.contains_key(c))
    }

    /// Children a DOWN_SUBSET payload must be forwarded to.
    ///
    /// With a complete descendant cache only the children whose subtree
    /// intersects `targets` are returned; otherwise every child is, and
    /// each decides for itself further down.
    pub fn route_down_targets(&self, targets: &[NodeId]) -> Vec<NodeId> {
        if !self.cache_complete() {
            return self.children.clone();
        }
        self.children
            .iter()
            .filter(|child| {
                let set = &self.descendants[*child];
                targets.iter().any(|t| set.contains(t))
            })
            .cloned()
            .collect()
    }

    /// The child whose reported subtree contains `target`, if any.
    pub fn child_covering(&self, target: &NodeId) -> Option<&NodeId> {
        self.children.iter().find(|child| {
            if *child == target {
                return true;
            }
            self.descendants
                .get(*child)
                .map(|set| set.contains(target))
                .unwrap_or(false)
        })
    }
}

/// Boundary to the external database that persists runtime state.
///
/// The core only needs load/save of the latest snapshot; the storage
/// engine behind it is the collaborator's choice.
pub trait StateStore: Send + Sync {
    fn load(&self) -> Result<Option<TopologySnapshot>, StateError>;
    fn save(&self, snapshot: &TopologySnapshot) -> Result<(), StateError>;
}

/// File-backed store writing the snapshot as a JSON document.
pub struct JsonStateStore {
    path: PathBuf,
}

impl JsonStateStore {
    pub fn new(path: PathBuf) -> Self {
        JsonStateStore { path }
    }
}

impl StateStore for JsonStateStore {
    fn load(&self) -> Result<Option<TopologySnapshot>, StateError> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StateError::Io {
                    reason: format!("{}: {}", self.path.display(), e),
                })
            }
        };
        let snapshot = serde_json::from_slice(&bytes).map_err(|e| StateError::Corrupt {
            reason: e.to_string(),
        })?;
        Ok(Some(snapshot))
    }

    fn save(&self, snapshot: &TopologySnapshot) -> Result<(), StateError> {
        let bytes = serde_json::to_vec_pretty(snapshot).map_err(|e| StateError::Corrupt {
            reason: e.to_string(),
        })?;
        // Write to a sibling temp file first so a crash mid-write cannot
        // leave a truncated snapshot behind.
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &bytes).map_err(|e| StateError::Io {
            reason: format!("{}: {}", tmp.display(), e),
        })?;
        fs::rename(&tmp, &self.path).map_err(|e| StateError::Io {
            reason: format!("{}: {}", self.path.display(), e),
        })
    }
}

/// Store that keeps nothing; used when no state path is configured.
pub struct NullStateStore;

impl StateStore for NullStateStore {
    fn load(&self) -> Result<Option<TopologySnapshot>, StateError> {
        Ok(None)
    }

    fn save(&self, _snapshot: &TopologySnapshot) -> Result<(), StateError> {
        Ok(())
    }
}
