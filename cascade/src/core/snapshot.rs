//! Point-in-time view of tracked work items and before/after differences.

use std::cell::OnceCell;
use std::collections::{BTreeSet, HashMap};

use crate::core::types::WorkItem;

/// Immutable capture of every tracked work item at one instant.
///
/// The id index is built on the first lookup rather than at capture time, so
/// a snapshot that is only iterated never pays for it.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    items: Vec<WorkItem>,
    index: OnceCell<HashMap<String, usize>>,
}

impl Snapshot {
    pub fn new(items: Vec<WorkItem>) -> Self {
        Self {
            items,
            index: OnceCell::new(),
        }
    }

    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// O(1) after the first call. Duplicate ids resolve to the first capture.
    pub fn get_by_id(&self, id: &str) -> Option<&WorkItem> {
        let index = self.index.get_or_init(|| {
            let mut index = HashMap::with_capacity(self.items.len());
            for (pos, item) in self.items.iter().enumerate() {
                index.entry(item.id.clone()).or_insert(pos);
            }
            index
        });
        index.get(id).map(|&pos| &self.items[pos])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get_by_id(id).is_some()
    }

    /// Whether the lazy index has been built yet.
    pub fn is_indexed(&self) -> bool {
        self.index.get().is_some()
    }
}

/// Difference between two snapshots. All id lists are sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delta {
    /// Present after, absent before.
    pub created: Vec<String>,
    /// Closed after and not closed (or absent) before.
    pub closed: Vec<String>,
    /// Present in both with a different status.
    pub status_changed: Vec<String>,
}

impl Delta {
    pub fn between(before: &Snapshot, after: &Snapshot) -> Self {
        let mut created = BTreeSet::new();
        let mut closed = BTreeSet::new();
        let mut status_changed = BTreeSet::new();

        for item in after.items() {
            match before.get_by_id(&item.id) {
                None => {
                    created.insert(item.id.clone());
                    if item.is_closed() {
                        closed.insert(item.id.clone());
                    }
                }
                Some(prev) => {
                    if prev.status != item.status {
                        status_changed.insert(item.id.clone());
                        if item.is_closed() {
                            closed.insert(item.id.clone());
                        }
                    }
                }
            }
        }

        Self {
            created: created.into_iter().collect(),
            closed: closed.into_iter().collect(),
            status_changed: status_changed.into_iter().collect(),
        }
    }

    /// Follow-up items filed during the cascade.
    pub fn findings_count(&self) -> usize {
        self.created.len()
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.closed.is_empty() && self.status_changed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ItemStatus;
    use crate::test_support::{closed, item};

    #[test]
    fn index_is_built_on_first_lookup() {
        let snapshot = Snapshot::new(vec![item("1"), item("1.1"), item("1.1.1")]);
        assert!(!snapshot.is_indexed());
        assert_eq!(snapshot.get_by_id("1.1").map(|i| i.id.as_str()), Some("1.1"));
        assert!(snapshot.is_indexed());
        assert!(snapshot.get_by_id("2").is_none());
    }

    #[test]
    fn large_snapshot_lookups_resolve_every_id() {
        let items: Vec<_> = (0..5_000).map(|n| item(&format!("1.{n}"))).collect();
        let snapshot = Snapshot::new(items);
        for n in (0..5_000).step_by(97) {
            assert!(snapshot.contains(&format!("1.{n}")));
        }
    }

    #[test]
    fn duplicate_ids_resolve_to_first_capture() {
        let snapshot = Snapshot::new(vec![item("3"), closed("3")]);
        assert_eq!(
            snapshot.get_by_id("3").map(|i| i.status),
            Some(ItemStatus::Open)
        );
    }

    #[test]
    fn delta_reports_created_closed_and_changed() {
        let before = Snapshot::new(vec![item("1"), item("1.1"), item("1.2")]);
        let mut in_progress = item("1.2");
        in_progress.status = ItemStatus::InProgress;
        let after = Snapshot::new(vec![
            item("1"),
            closed("1.1"),
            in_progress,
            item("1.3"),
            item("1.4"),
        ]);

        let delta = Delta::between(&before, &after);
        assert_eq!(delta.created, vec!["1.3", "1.4"]);
        assert_eq!(delta.closed, vec!["1.1"]);
        assert_eq!(delta.status_changed, vec!["1.1", "1.2"]);
        assert_eq!(delta.findings_count(), 2);
    }

    #[test]
    fn findings_ignore_items_that_disappeared() {
        let before = Snapshot::new(vec![item("1"), item("1.1")]);
        let after = Snapshot::new(vec![item("1"), item("1.9")]);
        let delta = Delta::between(&before, &after);
        assert_eq!(delta.findings_count(), 1);
    }

    #[test]
    fn identical_snapshots_have_empty_delta() {
        let before = Snapshot::new(vec![item("1"), closed("1.1")]);
        let delta = Delta::between(&before, &before.clone());
        assert!(delta.is_empty());
    }
}
