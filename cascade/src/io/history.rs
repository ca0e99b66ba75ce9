//! Append-only iteration history (`.cascade/state/history.jsonl`).

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::core::types::IterationResult;
use crate::io::atomic::append_atomic;

/// Append one record as a JSON line through [`append_atomic`], so a crash
/// never leaves a torn last line.
pub fn append_history(path: &Path, result: &IterationResult) -> Result<()> {
    let line = serde_json::to_vec(result).context("serialize iteration result")?;
    debug!(
        path = %path.display(),
        iteration = result.iteration,
        task_id = ?result.task_id,
        "appending history"
    );
    append_atomic(path, &line)
}

/// Load every parseable record; malformed lines are logged and skipped.
pub fn load_history(path: &Path) -> Result<Vec<IterationResult>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("read history {}", path.display())),
    };
    let mut records = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<IterationResult>(line) {
            Ok(record) => records.push(record),
            Err(e) => warn!(line = idx + 1, err = %e, "skipping malformed history line"),
        }
    }
    Ok(records)
}

/// Last `n` records, oldest first.
pub fn tail_history(path: &Path, n: usize) -> Result<Vec<IterationResult>> {
    let mut records = load_history(path)?;
    let start = records.len().saturating_sub(n);
    Ok(records.split_off(start))
}
