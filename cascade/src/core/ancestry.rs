//! Same-run cache from work-item id to its top-level capability-group.

use std::collections::{BTreeSet, HashMap};

use crate::core::hierarchy::{id_depth, root_of, walk_to_root};
use crate::core::snapshot::{Delta, Snapshot};
use crate::core::types::ItemKind;

/// Id → top-level group id, built from one full snapshot.
///
/// Lives for a single supervisor run and is never persisted.
#[derive(Debug, Clone, Default)]
pub struct AncestorMap {
    roots: HashMap<String, String>,
    groups: BTreeSet<String>,
}

impl AncestorMap {
    pub fn build(snapshot: &Snapshot) -> Self {
        let mut roots = HashMap::with_capacity(snapshot.len());
        let mut groups = BTreeSet::new();
        for item in snapshot.items() {
            let root = walk_to_root(snapshot, &item.id);
            groups.insert(root.clone());
            roots.insert(item.id.clone(), root);
        }
        Self { roots, groups }
    }

    /// Group for `id`; ids unseen at build time fall back to their id-derived root.
    pub fn group_of<'a>(&'a self, id: &'a str) -> &'a str {
        self.roots
            .get(id)
            .map(String::as_str)
            .unwrap_or_else(|| root_of(id))
    }

    pub fn groups(&self) -> &BTreeSet<String> {
        &self.groups
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// True when `delta` may have introduced a group this map does not know.
    pub fn needs_rebuild(&self, delta: &Delta) -> bool {
        delta
            .created
            .iter()
            .any(|id| id_depth(id) == 0 || !self.groups.contains(root_of(id)))
    }
}

/// Top-level groups carrying any of `labels` (case-insensitive).
pub fn deferred_groups(snapshot: &Snapshot, labels: &[String]) -> BTreeSet<String> {
    snapshot
        .items()
        .iter()
        .filter(|item| item.kind == ItemKind::CapabilityGroup || item.parent_id().is_none())
        .filter(|item| labels.iter().any(|label| item.has_label(label)))
        .map(|item| item.id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{item, labeled};

    #[test]
    fn maps_every_item_to_its_group() {
        let snapshot = Snapshot::new(vec![item("1"), item("1.1"), item("1.1.1"), item("2.4")]);
        let map = AncestorMap::build(&snapshot);
        assert_eq!(map.group_of("1.1.1"), "1");
        assert_eq!(map.group_of("1"), "1");
        assert_eq!(map.group_of("2.4"), "2");
        assert_eq!(map.len(), 4);
    }

    #[test]
    fn unseen_ids_fall_back_to_id_root() {
        let map = AncestorMap::build(&Snapshot::new(vec![item("1")]));
        assert_eq!(map.group_of("5.2.1"), "5");
    }

    #[test]
    fn rebuild_needed_only_for_new_groups() {
        let map = AncestorMap::build(&Snapshot::new(vec![item("1"), item("1.1")]));

        let nested = Delta {
            created: vec!["1.2".to_string(), "1.1.3".to_string()],
            ..Delta::default()
        };
        assert!(!map.needs_rebuild(&nested));

        let top_level = Delta {
            created: vec!["2".to_string()],
            ..Delta::default()
        };
        assert!(map.needs_rebuild(&top_level));

        let unknown_root = Delta {
            created: vec!["3.1".to_string()],
            ..Delta::default()
        };
        assert!(map.needs_rebuild(&unknown_root));
    }

    #[test]
    fn deferred_groups_match_labels_case_insensitively() {
        let snapshot = Snapshot::new(vec![
            labeled("1", &["Backlog"]),
            item("2"),
            labeled("2.1", &["backlog"]),
        ]);
        let deferred = deferred_groups(&snapshot, &["backlog".to_string()]);
        assert_eq!(deferred.into_iter().collect::<Vec<_>>(), vec!["1"]);
    }
}
