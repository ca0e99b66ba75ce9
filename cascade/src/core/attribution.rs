//! Decide which task an iteration's work belongs to.

use crate::core::hierarchy::{compare_ids, id_depth};
use crate::core::snapshot::Delta;

/// Task the iteration is attributed to.
///
/// An explicit `target` always wins. Otherwise the deepest id among items
/// whose status changed is used; ties go to `selected`, then id order. With no
/// status changes the work stays with `selected`.
pub fn attribute_work(target: Option<&str>, selected: &str, delta: &Delta) -> String {
    if let Some(target) = target {
        return target.to_string();
    }
    delta
        .status_changed
        .iter()
        .max_by(|a, b| {
            id_depth(a)
                .cmp(&id_depth(b))
                .then_with(|| (a.as_str() == selected).cmp(&(b.as_str() == selected)))
                .then_with(|| compare_ids(b, a))
        })
        .cloned()
        .unwrap_or_else(|| selected.to_string())
}
