//! Live status file for in-flight and finished runs (`.cascade/state/status.json`).

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::PhaseName;
use crate::io::atomic::write_atomic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Running,
    Finished,
}

/// Snapshot of supervisor state, rewritten after every iteration and at
/// every phase start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunStatus {
    pub run_id: String,
    pub state: RunPhase,
    /// Iteration in progress, or the last one run.
    pub iteration: u32,
    pub max_iterations: u32,
    pub phase: Option<PhaseName>,
    pub last_task_id: Option<String>,
    /// Circuit breaker outcomes, oldest first (`true` = success).
    pub breaker_window: Vec<bool>,
    /// Task id to consecutive failure count.
    pub skip_list: BTreeMap<String, u32>,
    /// Termination label once finished.
    pub stop: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl RunStatus {
    pub fn new(run_id: impl Into<String>, max_iterations: u32) -> Self {
        Self {
            run_id: run_id.into(),
            state: RunPhase::Running,
            iteration: 0,
            max_iterations,
            phase: None,
            last_task_id: None,
            breaker_window: Vec::new(),
            skip_list: BTreeMap::new(),
            stop: None,
            updated_at: Utc::now(),
        }
    }
}

/// Load the status file; `None` when no run has written one yet.
pub fn load_status(path: &Path) -> Result<Option<RunStatus>> {
    if !path.exists() {
        return Ok(None);
    }
    debug!(path = %path.display(), "loading status");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read status {}", path.display()))?;
    let status: RunStatus = serde_json::from_str(&contents)
        .with_context(|| format!("parse status {}", path.display()))?;
    Ok(Some(status))
}

/// Atomically write the status file (temp file + rename), stamping `updated_at`.
pub fn write_status(path: &Path, status: &mut RunStatus) -> Result<()> {
    status.updated_at = Utc::now();
    debug!(
        path = %path.display(),
        iteration = status.iteration,
        phase = ?status.phase,
        "writing status"
    );
    let mut buf = serde_json::to_string_pretty(status).context("serialize status")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}
