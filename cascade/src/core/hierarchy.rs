//! Hierarchical work-item id helpers.
//!
//! Ids encode ancestry with a `.` separator: `3` is a capability-group, `3.2`
//! a user-facing unit inside it, `3.2.7` an implementation step inside that
//! unit. Explicit parent links from the tracker take precedence over the
//! id-derived parent wherever both exist.

use std::cmp::Ordering;

use crate::core::snapshot::Snapshot;
use crate::core::types::{ItemKind, ItemStatus, WorkItem};

/// Separator between ancestry segments of an id.
pub const ID_SEPARATOR: char = '.';

/// Number of separators in `id` (0 for a top-level id).
pub fn id_depth(id: &str) -> usize {
    id.matches(ID_SEPARATOR).count()
}

/// First segment of `id`, i.e. the id-derived top-level group.
pub fn root_of(id: &str) -> &str {
    id.split(ID_SEPARATOR).next().unwrap_or(id)
}

/// Parent derived from the id alone (`a.b.c` -> `a.b`).
pub fn derived_parent(id: &str) -> Option<&str> {
    id.rfind(ID_SEPARATOR).map(|idx| &id[..idx])
}

/// Order ids by hierarchy: segment by segment, numeric segments numerically.
///
/// `2.10` sorts after `2.9`; `2` sorts before `2.1`.
pub fn compare_ids(a: &str, b: &str) -> Ordering {
    let mut left = a.split(ID_SEPARATOR);
    let mut right = b.split(ID_SEPARATOR);
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) => {
                let ord = match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(ln), Ok(rn)) => ln.cmp(&rn),
                    _ => l.cmp(r),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// Walk parent links up to the top-most ancestor recorded in `snapshot`.
///
/// When a referenced parent is missing from the snapshot, the id-derived root
/// of that parent is returned. Cycles are cut after `snapshot.len()` hops.
pub fn walk_to_root(snapshot: &Snapshot, id: &str) -> String {
    let mut current = id.to_string();
    for _ in 0..=snapshot.len() {
        let parent = match snapshot.get_by_id(&current) {
            Some(item) => item.parent_id().map(str::to_string),
            None => return root_of(&current).to_string(),
        };
        match parent {
            Some(parent) => current = parent,
            None => return current,
        }
    }
    root_of(id).to_string()
}

/// Whether `item` sits strictly below `ancestor_id`.
pub fn is_descendant(snapshot: &Snapshot, item: &WorkItem, ancestor_id: &str) -> bool {
    let mut parent = item.parent_id().map(str::to_string);
    for _ in 0..=snapshot.len() {
        let Some(current) = parent else {
            return false;
        };
        if current == ancestor_id {
            return true;
        }
        parent = match snapshot.get_by_id(&current) {
            Some(found) => found.parent_id().map(str::to_string),
            None => derived_parent(&current).map(str::to_string),
        };
    }
    false
}

/// Nearest user-facing unit at or above `id`, if any.
///
/// A unit task is its own unit. Capability-groups and items whose chain never
/// passes through a unit have none.
pub fn containing_unit(snapshot: &Snapshot, id: &str) -> Option<String> {
    let mut current = snapshot.get_by_id(id)?;
    for _ in 0..=snapshot.len() {
        match current.kind {
            ItemKind::UserFacingUnit => return Some(current.id.clone()),
            ItemKind::CapabilityGroup => return None,
            ItemKind::ImplementationStep => {}
        }
        current = snapshot.get_by_id(current.parent_id()?)?;
    }
    None
}

/// True when `container_id` has at least one descendant and every descendant
/// is closed. Intermediate units count, so a group stays incomplete while one
/// of its units is open even if all of that unit's steps are closed.
pub fn is_container_complete(snapshot: &Snapshot, container_id: &str) -> bool {
    let mut seen_any = false;
    for item in snapshot.items() {
        if item.id == container_id || !is_descendant(snapshot, item, container_id) {
            continue;
        }
        if item.status != ItemStatus::Closed {
            return false;
        }
        seen_any = true;
    }
    seen_any
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{closed, item};

    #[test]
    fn depth_counts_separators() {
        assert_eq!(id_depth("4"), 0);
        assert_eq!(id_depth("4.1"), 1);
        assert_eq!(id_depth("4.1.12"), 2);
    }

    #[test]
    fn compare_ids_is_numeric_per_segment() {
        let mut ids = vec!["2.10", "2.9", "10", "2", "2.9.1", "1.a"];
        ids.sort_by(|a, b| compare_ids(a, b));
        assert_eq!(ids, vec!["1.a", "2", "2.9", "2.9.1", "2.10", "10"]);
    }

    #[test]
    fn walk_to_root_follows_explicit_parents() {
        let mut step = item("bd-9");
        step.parent = Some("bd-4".to_string());
        let mut unit = item("bd-4");
        unit.parent = Some("bd-1".to_string());
        let snapshot = Snapshot::new(vec![item("bd-1"), unit, step]);
        assert_eq!(walk_to_root(&snapshot, "bd-9"), "bd-1");
    }

    #[test]
    fn walk_to_root_survives_parent_cycles() {
        let mut a = item("a");
        a.parent = Some("b".to_string());
        let mut b = item("b");
        b.parent = Some("a".to_string());
        let snapshot = Snapshot::new(vec![a, b]);
        assert_eq!(walk_to_root(&snapshot, "a"), "a");
    }

    #[test]
    fn container_complete_requires_every_descendant_closed() {
        let snapshot = Snapshot::new(vec![
            item("1"),
            item("1.1"),
            closed("1.1.1"),
            item("1.1.2"),
            closed("1.2.1"),
        ]);
        assert!(!is_container_complete(&snapshot, "1.1"));
        assert!(!is_container_complete(&snapshot, "1"));

        let snapshot = Snapshot::new(vec![item("1"), item("1.1"), closed("1.1.1"), closed("1.1.2")]);
        assert!(is_container_complete(&snapshot, "1.1"));
        // The open unit still holds its group back.
        assert!(!is_container_complete(&snapshot, "1"));

        let snapshot = Snapshot::new(vec![item("1"), closed("1.1"), closed("1.1.1"), closed("1.1.2")]);
        assert!(is_container_complete(&snapshot, "1"));
    }

    #[test]
    fn containing_unit_walks_up_to_the_unit() {
        let snapshot = Snapshot::new(vec![item("1"), item("1.1"), item("1.1.1"), item("1.1.1.1")]);
        assert_eq!(containing_unit(&snapshot, "1.1.1.1").as_deref(), Some("1.1"));
        assert_eq!(containing_unit(&snapshot, "1.1").as_deref(), Some("1.1"));
        assert_eq!(containing_unit(&snapshot, "1"), None);
        assert_eq!(containing_unit(&snapshot, "9.9"), None);
    }

    #[test]
    fn container_without_children_is_not_complete() {
        let snapshot = Snapshot::new(vec![item("7")]);
        assert!(!is_container_complete(&snapshot, "7"));
    }
}
