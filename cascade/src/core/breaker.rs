//! Sliding-window failure detector that halts the whole run.

use std::collections::VecDeque;

pub const DEFAULT_WINDOW: usize = 10;
pub const DEFAULT_THRESHOLD: usize = 5;

/// Fixed-size window of recent iteration outcomes (`true` = success).
///
/// Open once the failures inside the window reach the threshold. Outcomes
/// that have slid out of the window no longer count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreaker {
    window: VecDeque<bool>,
    capacity: usize,
    threshold: usize,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_THRESHOLD)
    }
}

impl CircuitBreaker {
    pub fn new(capacity: usize, threshold: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            threshold,
        }
    }

    pub fn record(&mut self, success: bool) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(success);
    }

    pub fn failures(&self) -> usize {
        self.window.iter().filter(|ok| !**ok).count()
    }

    pub fn is_open(&self) -> bool {
        self.failures() >= self.threshold
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Window contents, oldest first.
    pub fn window(&self) -> Vec<bool> {
        self.window.iter().copied().collect()
    }
}
