//! In-memory topology store
//!
//! Owned and mutated exclusively by the node runtime's control task.
//! Everything else reads immutable [`TopologySnapshot`] values published
//! through a watch channel, so the store itself needs no locking.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::error::TopologyError;
use crate::topology::snapshot::TopologySnapshot;
use crate::NodeId;

/// A node's view of its neighborhood in the tree.
///
/// The store tracks the parent, the direct children, and a per-child
/// descendant cache fed by membership reports. The cache is an
/// optimization: routing falls back to full fan-out when it is
/// incomplete, so a stale or missing entry is never a correctness
/// problem, only a wider broadcast.
#[derive(Debug)]
pub struct TopologyStore {
    self_id: NodeId,
    parent: Option<NodeId>,
    parent_addr: Option<String>,
    children: BTreeSet<NodeId>,
    descendants: BTreeMap<NodeId, HashSet<NodeId>>,
}

impl TopologyStore {
    pub fn new(self_id: NodeId) -> Self {
        TopologyStore {
            self_id,
            parent: None,
            parent_addr: None,
            children: BTreeSet::new(),
            descendants: BTreeMap::new(),
        }
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    pub fn parent(&self) -> Option<&NodeId> {
        self.parent.as_ref()
    }

    pub fn children(&self) -> Vec<NodeId> {
        self.children.iter().cloned().collect()
    }

    /// Set or clear the parent.
    ///
    /// Rejected with `TopologyError::Conflict` when the candidate is this
    /// node itself, an existing child, or any known descendant, since that
    /// edge would make the node its own ancestor. A rejected call leaves
    /// the store unchanged.
    pub fn set_parent(&mut self, parent: Option<NodeId>) -> Result<(), TopologyError> {
        if let Some(ref p) = parent {
            if *p == self.self_id {
                return Err(TopologyError::Conflict {
                    reason: format!("node {} cannot be its own parent", self.self_id),
                });
            }
            if self.is_descendant(p) {
                return Err(TopologyError::Conflict {
                    reason: format!(
                        "{} is in the subtree of {} and cannot become its parent",
                        p, self.self_id
                    ),
                });
            }
        }
        self.parent = parent;
        if self.parent.is_none() {
            self.parent_addr = None;
        }
        Ok(())
    }

    /// Remember where the current parent was dialed, for restart recovery.
    pub fn set_parent_addr(&mut self, addr: Option<String>) {
        self.parent_addr = addr;
    }

    pub fn add_child(&mut self, child: NodeId) -> Result<(), TopologyError> {
        if child == self.self_id {
            return Err(TopologyError::Conflict {
                reason: format!("node {} cannot be its own child", self.self_id),
            });
        }
        if Some(&child) == self.parent.as_ref() {
            return Err(TopologyError::Conflict {
                reason: format!("{} is already the parent of {}", child, self.self_id),
            });
        }
        self.children.insert(child);
        Ok(())
    }

    pub fn remove_child(&mut self, child: &NodeId) {
        self.children.remove(child);
        self.descendants.remove(child);
    }

    /// Replace the descendant set reported for a direct child.
    ///
    /// The set includes the child itself. Reports for unknown children are
    /// rejected so a late message from a detached subtree cannot poison
    /// the cache.
    pub fn set_descendants(
        &mut self,
        child: &NodeId,
        subtree: HashSet<NodeId>,
    ) -> Result<(), TopologyError> {
        if !self.children.contains(child) {
            return Err(TopologyError::UnknownChild {
                peer: child.clone(),
            });
        }
        self.descendants.insert(child.clone(), subtree);
        Ok(())
    }

    /// True when `id` is anywhere below this node: a direct child or in
    /// any child's reported descendant set.
    pub fn is_descendant(&self, id: &NodeId) -> bool {
        if self.children.contains(id) {
            return true;
        }
        self.descendants.values().any(|set| set.contains(id))
    }

    /// Every node in this node's subtree, itself included.
    pub fn subtree(&self) -> Vec<NodeId> {
        let mut all: BTreeSet<NodeId> = BTreeSet::new();
        all.insert(self.self_id.clone());
        for child in &self.children {
            all.insert(child.clone());
            if let Some(set) = self.descendants.get(child) {
                all.extend(set.iter().cloned());
            }
        }
        all.into_iter().collect()
    }

    pub fn snapshot(&self) -> TopologySnapshot {
        let mut descendants = BTreeMap::new();
        for (child, set) in &self.descendants {
            let mut sorted: Vec<NodeId> = set.iter().cloned().collect();
            sorted.sort();
            descendants.insert(child.clone(), sorted);
        }
        TopologySnapshot {
            self_id: self.self_id.clone(),
            parent: self.parent.clone(),
            parent_addr: self.parent_addr.clone(),
            children: self.children.iter().cloned().collect(),
            descendants,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> TopologyStore {
        TopologyStore::new("n1".to_string())
    }

    #[test]
    fn test_self_parent_rejected() {
        let mut s = store();
        let err = s.set_parent(Some("n1".to_string())).unwrap_err();
        assert!(matches!(err, TopologyError::Conflict { .. }));
        assert_eq!(s.parent(), None);
    }

    #[test]
    fn test_child_cannot_become_parent() {
        let mut s = store();
        s.add_child("n2".to_string()).unwrap();

        let err = s.set_parent(Some("n2".to_string())).unwrap_err();
        assert!(matches!(err, TopologyError::Conflict { .. }));
        assert_eq!(s.parent(), None);
        assert_eq!(s.children(), vec!["n2".to_string()]);
    }

    #[test]
    fn test_descendant_cannot_become_parent() {
        let mut s = store();
        s.add_child("n2".to_string()).unwrap();
        s.set_descendants(
            &"n2".to_string(),
            ["n2", "n3", "n4"].iter().map(|s| s.to_string()).collect(),
        )
        .unwrap();

        // n4 lives under n2, so parenting to it would close a cycle
        let err = s.set_parent(Some("n4".to_string())).unwrap_err();
        assert!(matches!(err, TopologyError::Conflict { .. }));
        assert_eq!(s.parent(), None);
    }

    #[test]
    fn test_parent_cannot_become_child() {
        let mut s = store();
        s.set_parent(Some("n0".to_string())).unwrap();

        let err = s.add_child("n0".to_string()).unwrap_err();
        assert!(matches!(err, TopologyError::Conflict { .. }));
        assert!(s.children().is_empty());
    }

    #[test]
    fn test_rejected_mutation_leaves_state_unchanged() {
        let mut s = store();
        s.set_parent(Some("n0".to_string())).unwrap();
        s.add_child("n2".to_string()).unwrap();
        let before = s.snapshot();

        assert!(s.set_parent(Some("n2".to_string())).is_err());
        assert!(s.add_child("n0".to_string()).is_err());
        assert_eq!(s.snapshot(), before);
    }

    #[test]
    fn test_descendants_require_known_child() {
        let mut s = store();
        let err = s
            .set_descendants(&"nx".to_string(), HashSet::new())
            .unwrap_err();
        assert!(matches!(err, TopologyError::UnknownChild { .. }));
    }

    #[test]
    fn test_subtree_includes_self_children_and_descendants() {
        let mut s = store();
        s.add_child("n2".to_string()).unwrap();
        s.add_child("n5".to_string()).unwrap();
        s.set_descendants(
            &"n2".to_string(),
            ["n2", "n3"].iter().map(|s| s.to_string()).collect(),
        )
        .unwrap();

        let subtree = s.subtree();
        assert_eq!(subtree, vec!["n1", "n2", "n3", "n5"]);
    }

    #[test]
    fn test_remove_child_drops_descendants() {
        let mut s = store();
        s.add_child("n2".to_string()).unwrap();
        s.set_descendants(
            &"n2".to_string(),
            ["n2", "n3"].iter().map(|s| s.to_string()).collect(),
        )
        .unwrap();

        s.remove_child(&"n2".to_string());
        assert!(!s.is_descendant(&"n3".to_string()));
        assert_eq!(s.subtree(), vec!["n1"]);
    }

    #[test]
    fn test_clearing_parent_clears_addr() {
        let mut s = store();
        s.set_parent(Some("n0".to_string())).unwrap();
        s.set_parent_addr(Some("10.0.0.1:4310".to_string()));

        s.set_parent(None).unwrap();
        assert_eq!(s.snapshot().parent_addr, None);
    }
}
