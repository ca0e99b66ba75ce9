//! Shared deterministic types for the cascade core.
//!
//! These types define stable contracts between core components and the
//! persisted status/history files. They must not depend on I/O.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::failure::FailureKind;
use crate::core::hierarchy::{derived_parent, id_depth};
use crate::core::signals::VerdictKind;

/// Tracked status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Open,
    InProgress,
    Closed,
}

impl ItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Closed => "closed",
        }
    }

    /// Map a tracker status label onto the three states the loop cares about.
    ///
    /// Anything that is neither closed nor in progress counts as open.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "closed" | "done" | "resolved" => Self::Closed,
            "in_progress" | "active" => Self::InProgress,
            _ => Self::Open,
        }
    }
}

/// Level of a work item in the containment hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    CapabilityGroup,
    UserFacingUnit,
    ImplementationStep,
}

impl ItemKind {
    /// Kind implied by the number of separators in an id.
    pub fn from_depth(depth: usize) -> Self {
        match depth {
            0 => Self::CapabilityGroup,
            1 => Self::UserFacingUnit,
            _ => Self::ImplementationStep,
        }
    }
}

/// A tracked unit of work as reported by the external tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub status: ItemStatus,
    pub kind: ItemKind,
    /// Lower is more urgent.
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl WorkItem {
    /// Explicit parent link, falling back to the id-derived parent.
    pub fn parent_id(&self) -> Option<&str> {
        self.parent.as_deref().or_else(|| derived_parent(&self.id))
    }

    pub fn depth(&self) -> usize {
        id_depth(&self.id)
    }

    pub fn is_closed(&self) -> bool {
        self.status == ItemStatus::Closed
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l.eq_ignore_ascii_case(label))
    }
}

/// Named step of the per-task cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseName {
    Implement,
    Review,
    Commit,
    Validate,
}

impl PhaseName {
    pub const ALL: [PhaseName; 4] = [
        PhaseName::Implement,
        PhaseName::Review,
        PhaseName::Commit,
        PhaseName::Validate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Implement => "implement",
            Self::Review => "review",
            Self::Commit => "commit",
            Self::Validate => "validate",
        }
    }
}

impl fmt::Display for PhaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a phase subprocess stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    /// Process exited successfully on its own.
    Completed,
    /// Hard timeout exceeded.
    Timeout,
    /// No tool action within the idle window.
    Idle,
    /// Spawn failure or non-zero exit.
    ProcessError,
    /// Shutdown was requested while the process ran.
    Cancelled,
}

impl TerminalReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Timeout => "timeout",
            Self::Idle => "idle",
            Self::ProcessError => "process_error",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Iteration-level outcome recorded in history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Completed,
    Timeout,
    Idle,
    Error,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Timeout => "timeout",
            Self::Idle => "idle",
            Self::Error => "error",
        }
    }
}

impl From<TerminalReason> for Outcome {
    fn from(reason: TerminalReason) -> Self {
        match reason {
            TerminalReason::Completed => Self::Completed,
            TerminalReason::Timeout => Self::Timeout,
            TerminalReason::Idle => Self::Idle,
            TerminalReason::ProcessError | TerminalReason::Cancelled => Self::Error,
        }
    }
}

/// One tool invocation observed while a phase ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRecord {
    pub tool: String,
    pub at: Instant,
}

impl ActionRecord {
    pub fn new(tool: impl Into<String>, at: Instant) -> Self {
        Self {
            tool: tool.into(),
            at,
        }
    }
}

/// Per-iteration rollup of [`ActionRecord`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSummary {
    pub total: u32,
    pub by_tool: BTreeMap<String, u32>,
}

impl ActionSummary {
    pub fn record(&mut self, tool: &str) {
        self.total += 1;
        *self.by_tool.entry(tool.to_string()).or_insert(0) += 1;
    }

    pub fn merge(&mut self, other: &ActionSummary) {
        self.total += other.total;
        for (tool, count) in &other.by_tool {
            *self.by_tool.entry(tool.clone()).or_insert(0) += count;
        }
    }
}

/// Compact record of one phase run inside an iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub phase: PhaseName,
    pub round: u32,
    pub reason: TerminalReason,
    pub duration_ms: u64,
    pub actions: u32,
}

/// Container a validate phase was run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidateScope {
    Unit,
    Group,
}

impl ValidateScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unit => "unit",
            Self::Group => "group",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub scope: ValidateScope,
    pub scope_id: String,
    pub reason: TerminalReason,
    pub passed: bool,
}

/// Immutable summary of one loop iteration, appended to history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationResult {
    pub run_id: String,
    pub iteration: u32,
    /// Task the work was attributed to; absent when nothing was selected.
    pub task_id: Option<String>,
    pub outcome: Outcome,
    pub success: bool,
    pub duration_ms: u64,
    pub actions: ActionSummary,
    pub findings_count: usize,
    pub verdict: Option<VerdictKind>,
    pub review_rounds: u32,
    pub failure: Option<FailureKind>,
    #[serde(default)]
    pub phases: Vec<PhaseSummary>,
    #[serde(default)]
    pub validations: Vec<ValidationRecord>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}
