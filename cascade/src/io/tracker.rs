//! Tracker adapter for the `bd` work-item CLI.
//!
//! The loop only ever needs four calls: a full listing (Snapshot), the ready
//! set, a status transition, and a full synchronize. Every call runs with a
//! bounded timeout; callers decide whether a failure is fatal.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::core::hierarchy::id_depth;
use crate::core::snapshot::Snapshot;
use crate::core::types::{ItemKind, ItemStatus, WorkItem};
use crate::io::config::TrackerConfig;
use crate::io::process::run_command_with_timeout;

/// Tracker output is small; anything past this is noise.
const TRACKER_OUTPUT_LIMIT: usize = 16 * 1024 * 1024;

pub trait Tracker {
    /// Every item, open or closed.
    fn list_items(&self) -> Result<Snapshot>;
    /// Items the tracker considers ready (open, dependencies satisfied).
    fn ready_items(&self) -> Result<Vec<WorkItem>>;
    fn transition(&self, id: &str, status: ItemStatus) -> Result<()>;
    /// Full synchronize with the tracker's backing store.
    fn sync(&self) -> Result<()>;
}

/// Wrapper for executing `bd` commands in a working directory.
#[derive(Debug, Clone)]
pub struct BdTracker {
    command: Vec<String>,
    workdir: PathBuf,
    timeout: Duration,
}

impl BdTracker {
    pub fn new(config: &TrackerConfig, workdir: impl Into<PathBuf>) -> Self {
        Self {
            command: config.command.clone(),
            workdir: workdir.into(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let (program, leading) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("tracker.command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(leading).args(args).current_dir(&self.workdir);
        debug!(args = ?args, "running tracker");

        let output = run_command_with_timeout(cmd, None, self.timeout, TRACKER_OUTPUT_LIMIT)
            .with_context(|| format!("{program} {}", args.join(" ")))?;
        if output.terminated {
            return Err(anyhow!(
                "{program} {} timed out after {}s",
                args.join(" "),
                self.timeout.as_secs()
            ));
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "{program} {} failed with status {:?}: {}",
                args.join(" "),
                output.status.code(),
                stderr.trim()
            ));
        }
        String::from_utf8(output.stdout)
            .with_context(|| format!("{program} {} output is not utf-8", args.join(" ")))
    }
}

impl Tracker for BdTracker {
    #[instrument(skip_all)]
    fn list_items(&self) -> Result<Snapshot> {
        let out = self.run_capture(&["list", "--all", "--json"])?;
        let items = parse_items(&out).context("parse tracker listing")?;
        debug!(items = items.len(), "captured snapshot");
        Ok(Snapshot::new(items))
    }

    #[instrument(skip_all)]
    fn ready_items(&self) -> Result<Vec<WorkItem>> {
        let out = self.run_capture(&["ready", "--json"])?;
        let items = parse_items(&out).context("parse tracker ready set")?;
        debug!(ready = items.len(), "queried ready items");
        Ok(items)
    }

    #[instrument(skip_all, fields(id = %id, status = status.as_str()))]
    fn transition(&self, id: &str, status: ItemStatus) -> Result<()> {
        self.run_capture(&["update", id, "--status", status.as_str()])?;
        Ok(())
    }

    #[instrument(skip_all)]
    fn sync(&self) -> Result<()> {
        self.run_capture(&["sync"])?;
        Ok(())
    }
}

/// One record as printed by `bd ... --json`. Unknown fields are ignored.
#[derive(Debug, Deserialize)]
struct TrackerRecord {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    priority: Option<u32>,
    #[serde(default, alias = "type")]
    issue_type: Option<String>,
    #[serde(default)]
    parent: Option<String>,
    #[serde(default)]
    dependencies: Vec<DependencyRef>,
    #[serde(default)]
    labels: Vec<String>,
}

/// Dependencies arrive either as bare ids or as typed edges.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DependencyRef {
    Id(String),
    Edge {
        #[serde(alias = "depends_on_id")]
        id: String,
        #[serde(default, rename = "type", alias = "dependency_type")]
        kind: Option<String>,
    },
}

/// Priority assumed for records without one (bd's "medium").
const DEFAULT_PRIORITY: u32 = 2;

impl TrackerRecord {
    fn into_item(self) -> WorkItem {
        let mut parent = self.parent.filter(|p| !p.trim().is_empty());
        let mut dependencies = BTreeSet::new();
        for dep in self.dependencies {
            match dep {
                DependencyRef::Id(id) => {
                    dependencies.insert(id);
                }
                DependencyRef::Edge { id, kind } => {
                    if kind.as_deref() == Some("parent-child") {
                        parent.get_or_insert(id);
                    } else {
                        dependencies.insert(id);
                    }
                }
            }
        }
        let kind = match self.issue_type.as_deref() {
            Some("epic") => ItemKind::CapabilityGroup,
            Some("feature") => ItemKind::UserFacingUnit,
            Some(_) => ItemKind::ImplementationStep,
            None => ItemKind::from_depth(id_depth(&self.id)),
        };
        WorkItem {
            status: self
                .status
                .as_deref()
                .map_or(ItemStatus::Open, ItemStatus::from_label),
            priority: self.priority.unwrap_or(DEFAULT_PRIORITY),
            id: self.id,
            title: self.title,
            kind,
            parent,
            dependencies,
            labels: self.labels,
        }
    }
}

/// Parse a JSON array of tracker records; empty output or `null` is no items.
pub fn parse_items(raw: &str) -> Result<Vec<WorkItem>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    let records: Vec<TrackerRecord> =
        serde_json::from_str(trimmed).context("parse tracker json")?;
    let mut items = Vec::with_capacity(records.len());
    for record in records {
        if record.id.trim().is_empty() {
            warn!("skipping tracker record without id");
            continue;
        }
        items.push(record.into_item());
    }
    Ok(items)
}
