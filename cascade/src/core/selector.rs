//! Task selection over the tracker's ready set.

use std::collections::BTreeSet;

use crate::core::ancestry::AncestorMap;
use crate::core::hierarchy::compare_ids;
use crate::core::skip_list::SkipList;
use crate::core::types::{ItemKind, WorkItem};

/// Exclusion rules applied to the ready set.
#[derive(Debug, Clone, Copy)]
pub struct SelectionFilter<'a> {
    pub ancestors: &'a AncestorMap,
    pub deferred: &'a BTreeSet<String>,
    pub skip_list: &'a SkipList,
}

impl SelectionFilter<'_> {
    /// Ready in the tracker and not parked under a deferred group.
    ///
    /// Skip List members still count here; they are ready, just not picked.
    pub fn is_actionable(&self, item: &WorkItem) -> bool {
        item.kind != ItemKind::CapabilityGroup
            && !item.is_closed()
            && !self.deferred.contains(self.ancestors.group_of(&item.id))
    }

    pub fn is_eligible(&self, item: &WorkItem) -> bool {
        self.is_actionable(item) && !self.skip_list.is_skipped(&item.id)
    }
}

/// Highest-priority eligible item: lowest priority value, then id order.
///
/// With a pinned `target`, only that item can be chosen.
pub fn select_task<'a>(
    ready: &'a [WorkItem],
    filter: &SelectionFilter<'_>,
    target: Option<&str>,
) -> Option<&'a WorkItem> {
    ready
        .iter()
        .filter(|item| target.is_none_or(|target| item.id == target))
        .filter(|item| filter.is_eligible(item))
        .min_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| compare_ids(&a.id, &b.id))
                .then_with(|| a.id.cmp(&b.id))
        })
}

/// Ready items the run could still act on, Skip List members included.
pub fn remaining_ready(ready: &[WorkItem], filter: &SelectionFilter<'_>) -> usize {
    let mut seen = BTreeSet::new();
    ready
        .iter()
        .filter(|item| filter.is_actionable(item))
        .filter(|item| seen.insert(item.id.as_str()))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ancestry::deferred_groups;
    use crate::core::snapshot::Snapshot;
    use crate::test_support::{item, labeled, with_priority};

    fn fixture() -> (AncestorMap, BTreeSet<String>) {
        let snapshot = Snapshot::new(vec![
            item("1"),
            labeled("2", &["backlog"]),
            item("1.1"),
            item("1.2"),
            item("1.10"),
            item("2.1"),
        ]);
        let deferred = deferred_groups(&snapshot, &["backlog".to_string()]);
        (AncestorMap::build(&snapshot), deferred)
    }

    #[test]
    fn picks_lowest_priority_value_then_id_order() {
        let (ancestors, deferred) = fixture();
        let skip_list = SkipList::default();
        let filter = SelectionFilter {
            ancestors: &ancestors,
            deferred: &deferred,
            skip_list: &skip_list,
        };
        let ready = vec![with_priority("1.10", 1), with_priority("1.2", 1), with_priority("1.1", 3)];
        assert_eq!(select_task(&ready, &filter, None).map(|i| i.id.as_str()), Some("1.2"));
    }

    #[test]
    fn excludes_groups_deferred_items_and_skipped_tasks() {
        let (ancestors, deferred) = fixture();
        let mut skip_list = SkipList::default();
        for _ in 0..3 {
            skip_list.record_failure("1.1");
        }
        let filter = SelectionFilter {
            ancestors: &ancestors,
            deferred: &deferred,
            skip_list: &skip_list,
        };
        let ready = vec![
            with_priority("1", 0),
            with_priority("2.1", 0),
            with_priority("1.1", 0),
            with_priority("1.2", 4),
        ];
        assert_eq!(select_task(&ready, &filter, None).map(|i| i.id.as_str()), Some("1.2"));
        // 1.1 is skipped but still ready; 1 is a group; 2.1 is deferred.
        assert_eq!(remaining_ready(&ready, &filter), 2);
    }

    #[test]
    fn pinned_target_only_selects_that_task() {
        let (ancestors, deferred) = fixture();
        let skip_list = SkipList::default();
        let filter = SelectionFilter {
            ancestors: &ancestors,
            deferred: &deferred,
            skip_list: &skip_list,
        };
        let ready = vec![with_priority("1.1", 0), with_priority("1.10", 9)];
        assert_eq!(
            select_task(&ready, &filter, Some("1.10")).map(|i| i.id.as_str()),
            Some("1.10")
        );
        assert!(select_task(&ready, &filter, Some("1.2")).is_none());
    }

    #[test]
    fn empty_ready_set_selects_nothing() {
        let (ancestors, deferred) = fixture();
        let skip_list = SkipList::default();
        let filter = SelectionFilter {
            ancestors: &ancestors,
            deferred: &deferred,
            skip_list: &skip_list,
        };
        assert!(select_task(&[], &filter, None).is_none());
        assert_eq!(remaining_ready(&[], &filter), 0);
    }
}
