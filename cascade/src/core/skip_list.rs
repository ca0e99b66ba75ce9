//! Per-task consecutive-failure counter that excludes a task from selection.

use std::collections::BTreeMap;

pub const DEFAULT_SKIP_AFTER: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipList {
    counts: BTreeMap<String, u32>,
    limit: u32,
}

impl Default for SkipList {
    fn default() -> Self {
        Self::new(DEFAULT_SKIP_AFTER)
    }
}

impl SkipList {
    pub fn new(limit: u32) -> Self {
        Self {
            counts: BTreeMap::new(),
            limit: limit.max(1),
        }
    }

    /// Bump the task's counter and return the new count.
    pub fn record_failure(&mut self, task_id: &str) -> u32 {
        let count = self.counts.entry(task_id.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    pub fn record_success(&mut self, task_id: &str) {
        self.counts.remove(task_id);
    }

    pub fn count(&self, task_id: &str) -> u32 {
        self.counts.get(task_id).copied().unwrap_or(0)
    }

    pub fn is_skipped(&self, task_id: &str) -> bool {
        self.count(task_id) >= self.limit
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Tasks currently excluded from selection.
    pub fn skipped(&self) -> Vec<String> {
        self.counts
            .iter()
            .filter(|(_, count)| **count >= self.limit)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn entries(&self) -> &BTreeMap<String, u32> {
        &self.counts
    }
}
