//! Merge forest for canonical entity resolution.
//!
//! Every merge records `source -> target`. Resolving an id walks parent
//! pointers to the root and compresses the path, so chains created by many
//! successive merges stay O(α(n)) to resolve.

use super::EntityId;
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct MergeForest {
    parent: HashMap<EntityId, EntityId>,
}

impl MergeForest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a forest from persisted `(from, to)` redirect rows.
    pub fn from_redirects(redirects: impl IntoIterator<Item = (EntityId, EntityId)>) -> Self {
        Self {
            parent: redirects.into_iter().collect(),
        }
    }

    /// Canonical root for `id`. Ids never merged resolve to themselves.
    pub fn find(&mut self, id: EntityId) -> EntityId {
        let root = self.peek(id);

        // Path compression
        let mut current = id;
        while current != root {
            match self.parent.insert(current, root) {
                Some(next) => current = next,
                None => break,
            }
        }

        root
    }

    /// Read-only lookup without compression.
    pub fn peek(&self, id: EntityId) -> EntityId {
        let mut root = id;
        while let Some(&next) = self.parent.get(&root) {
            if next == root {
                break;
            }
            root = next;
        }
        root
    }

    /// Merge `source` into `target`. The target's root stays canonical.
    /// Returns false if both already share a root.
    pub fn union(&mut self, source: EntityId, target: EntityId) -> bool {
        let source_root = self.find(source);
        let target_root = self.find(target);
        if source_root == target_root {
            return false;
        }
        self.parent.insert(source_root, target_root);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmerged_resolves_to_self() {
        let mut forest = MergeForest::new();
        assert_eq!(forest.find(7), 7);
        assert!(forest.parent.is_empty());
    }

    #[test]
    fn test_chain_resolves_to_last_target() {
        let mut forest = MergeForest::new();
        // 1 -> 2 -> 3 -> 4
        assert!(forest.union(1, 2));
        assert!(forest.union(2, 3));
        assert!(forest.union(3, 4));

        assert_eq!(forest.find(1), 4);
        // Path compressed: 1 now points straight at the root
        assert_eq!(forest.parent.get(&1), Some(&4));
    }

    #[test]
    fn test_union_same_root_is_noop() {
        let mut forest = MergeForest::new();
        forest.union(1, 2);
        assert!(!forest.union(1, 2));
        assert!(!forest.union(2, 1));
    }

    #[test]
    fn test_merging_target_into_other_moves_whole_tree() {
        let mut forest = MergeForest::new();
        forest.union(1, 2);
        forest.union(3, 2);
        forest.union(2, 9);

        assert_eq!(forest.peek(1), 9);
        assert_eq!(forest.peek(3), 9);
        assert_eq!(forest.peek(2), 9);
    }

    #[test]
    fn test_from_redirects() {
        let mut forest = MergeForest::from_redirects(vec![(5, 6), (6, 8)]);
        assert_eq!(forest.find(5), 8);
        assert_eq!(forest.parent.len(), 2);
    }
}
