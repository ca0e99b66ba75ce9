//! Test-only helpers: work-item builders, an in-memory tracker and a scripted
//! phase executor.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::path::Path;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use chrono::Utc;

use crate::core::hierarchy::id_depth;
use crate::core::signals::{COMPLETION_MARKER, NO_WORK_MARKER};
use crate::core::snapshot::Snapshot;
use crate::core::types::{
    ActionRecord, ActionSummary, ItemKind, ItemStatus, IterationResult, Outcome, PhaseName,
    TerminalReason, WorkItem,
};
use crate::io::executor::{PhaseExecutor, PhaseRequest, PhaseResult};
use crate::io::paths::CascadePaths;
use crate::io::tracker::Tracker;
use crate::shutdown::ShutdownToken;

/// Open item with the kind implied by its id depth and medium priority.
pub fn item(id: &str) -> WorkItem {
    WorkItem {
        id: id.to_string(),
        title: format!("{id} title"),
        status: ItemStatus::Open,
        kind: ItemKind::from_depth(id_depth(id)),
        priority: 2,
        parent: None,
        dependencies: BTreeSet::new(),
        labels: Vec::new(),
    }
}

pub fn closed(id: &str) -> WorkItem {
    WorkItem {
        status: ItemStatus::Closed,
        ..item(id)
    }
}

pub fn labeled(id: &str, labels: &[&str]) -> WorkItem {
    WorkItem {
        labels: labels.iter().map(|l| l.to_string()).collect(),
        ..item(id)
    }
}

pub fn with_priority(id: &str, priority: u32) -> WorkItem {
    WorkItem {
        priority,
        ..item(id)
    }
}

/// Minimal history record for persistence tests.
pub fn iteration_result(iteration: u32, task_id: Option<&str>, success: bool) -> IterationResult {
    let now = Utc::now();
    IterationResult {
        run_id: "run-test".to_string(),
        iteration,
        task_id: task_id.map(str::to_string),
        outcome: Outcome::Completed,
        success,
        duration_ms: 10,
        actions: ActionSummary::default(),
        findings_count: 0,
        verdict: None,
        review_rounds: 0,
        failure: None,
        phases: Vec::new(),
        validations: Vec::new(),
        started_at: now,
        ended_at: now,
    }
}

/// Scratch project root with its `.cascade/` layout; removed on drop.
pub struct TestProject {
    dir: tempfile::TempDir,
    pub paths: CascadePaths,
}

impl TestProject {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let paths = CascadePaths::new(dir.path());
        Ok(Self { dir, paths })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    items: Vec<WorkItem>,
    list_calls: usize,
    ready_calls: usize,
    sync_calls: usize,
    transitions: Vec<(String, ItemStatus)>,
    fail_list: bool,
    fail_ready: bool,
    fail_sync: bool,
}

/// In-memory tracker. Clones share state, so scripted phases can close or
/// file items the way a real agent would through the tracker CLI.
#[derive(Debug, Clone, Default)]
pub struct FakeTracker {
    state: Rc<RefCell<TrackerState>>,
}

impl FakeTracker {
    pub fn new(items: Vec<WorkItem>) -> Self {
        Self {
            state: Rc::new(RefCell::new(TrackerState {
                items,
                ..TrackerState::default()
            })),
        }
    }

    pub fn add(&self, item: WorkItem) {
        self.state.borrow_mut().items.push(item);
    }

    pub fn close(&self, id: &str) {
        self.set_status(id, ItemStatus::Closed);
    }

    pub fn status_of(&self, id: &str) -> Option<ItemStatus> {
        self.state
            .borrow()
            .items
            .iter()
            .find(|item| item.id == id)
            .map(|item| item.status)
    }

    pub fn fail_list(&self, fail: bool) {
        self.state.borrow_mut().fail_list = fail;
    }

    pub fn fail_ready(&self, fail: bool) {
        self.state.borrow_mut().fail_ready = fail;
    }

    pub fn fail_sync(&self, fail: bool) {
        self.state.borrow_mut().fail_sync = fail;
    }

    pub fn list_calls(&self) -> usize {
        self.state.borrow().list_calls
    }

    pub fn ready_calls(&self) -> usize {
        self.state.borrow().ready_calls
    }

    pub fn sync_calls(&self) -> usize {
        self.state.borrow().sync_calls
    }

    pub fn transitions(&self) -> Vec<(String, ItemStatus)> {
        self.state.borrow().transitions.clone()
    }

    fn set_status(&self, id: &str, status: ItemStatus) {
        let mut state = self.state.borrow_mut();
        if let Some(item) = state.items.iter_mut().find(|item| item.id == id) {
            item.status = status;
        }
    }
}

impl Tracker for FakeTracker {
    fn list_items(&self) -> Result<Snapshot> {
        let mut state = self.state.borrow_mut();
        state.list_calls += 1;
        if state.fail_list {
            return Err(anyhow!("list failed"));
        }
        Ok(Snapshot::new(state.items.clone()))
    }

    /// Open items whose dependencies are all closed.
    fn ready_items(&self) -> Result<Vec<WorkItem>> {
        let mut state = self.state.borrow_mut();
        state.ready_calls += 1;
        if state.fail_ready {
            return Err(anyhow!("ready failed"));
        }
        let closed: BTreeSet<&str> = state
            .items
            .iter()
            .filter(|item| item.is_closed())
            .map(|item| item.id.as_str())
            .collect();
        Ok(state
            .items
            .iter()
            .filter(|item| item.status == ItemStatus::Open)
            .filter(|item| item.dependencies.iter().all(|dep| closed.contains(dep.as_str())))
            .cloned()
            .collect())
    }

    fn transition(&self, id: &str, status: ItemStatus) -> Result<()> {
        self.state
            .borrow_mut()
            .transitions
            .push((id.to_string(), status));
        self.set_status(id, status);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.sync_calls += 1;
        if state.fail_sync {
            return Err(anyhow!("sync failed"));
        }
        Ok(())
    }
}

/// What a scripted phase "printed" and how it ended.
#[derive(Debug, Clone)]
pub struct ScriptedPhase {
    pub output: String,
    pub reason: TerminalReason,
    pub tools: Vec<String>,
}

pub fn complete() -> ScriptedPhase {
    ScriptedPhase {
        output: format!("done\n{COMPLETION_MARKER}"),
        reason: TerminalReason::Completed,
        tools: vec!["Edit".to_string(), "Bash".to_string()],
    }
}

pub fn no_work() -> ScriptedPhase {
    ScriptedPhase {
        output: NO_WORK_MARKER.to_string(),
        ..complete()
    }
}

pub fn verdict(kind: &str, blocking_issues: u32) -> ScriptedPhase {
    ScriptedPhase {
        output: format!(
            "reviewed\n<review-verdict>\nverdict: {kind}\nblocking_issues: {blocking_issues}\n</review-verdict>"
        ),
        ..complete()
    }
}

pub fn approve() -> ScriptedPhase {
    verdict("APPROVED", 0)
}

pub fn needs_changes(blocking_issues: u32) -> ScriptedPhase {
    verdict("NEEDS_CHANGES", blocking_issues)
}

/// A phase killed or failed with `reason` before producing a signal.
pub fn ended(reason: TerminalReason) -> ScriptedPhase {
    ScriptedPhase {
        output: String::new(),
        reason,
        tools: Vec::new(),
    }
}

type Script = Box<dyn Fn(&PhaseRequest) -> ScriptedPhase>;

/// Executor that answers each phase from a closure instead of a subprocess.
pub struct ScriptedExecutor {
    script: Script,
    requests: RefCell<Vec<PhaseRequest>>,
}

impl ScriptedExecutor {
    pub fn from_fn(script: impl Fn(&PhaseRequest) -> ScriptedPhase + 'static) -> Self {
        Self {
            script: Box::new(script),
            requests: RefCell::new(Vec::new()),
        }
    }

    /// Review approves, commit closes the requested task, everything else completes.
    pub fn closing(tracker: &FakeTracker) -> Self {
        let tracker = tracker.clone();
        Self::from_fn(move |request| match request.phase {
            PhaseName::Review => approve(),
            PhaseName::Commit => {
                tracker.close(&request.task_id);
                complete()
            }
            _ => complete(),
        })
    }

    /// Prompts sent for `phase`, in order.
    pub fn prompts(&self, phase: PhaseName) -> Vec<String> {
        self.requests
            .borrow()
            .iter()
            .filter(|request| request.phase == phase)
            .map(|request| request.prompt.clone())
            .collect()
    }

    /// `(task_id, phase)` for every invocation, in order.
    pub fn calls(&self) -> Vec<(String, PhaseName)> {
        self.requests
            .borrow()
            .iter()
            .map(|request| (request.task_id.clone(), request.phase))
            .collect()
    }
}

impl PhaseExecutor for ScriptedExecutor {
    fn run_phase(
        &self,
        request: &PhaseRequest,
        _shutdown: &ShutdownToken,
        on_action: &mut dyn FnMut(&ActionRecord),
    ) -> Result<PhaseResult> {
        self.requests.borrow_mut().push(request.clone());
        let scripted = (self.script)(request);
        let actions: Vec<ActionRecord> = scripted
            .tools
            .iter()
            .map(|tool| ActionRecord::new(tool.as_str(), Instant::now()))
            .collect();
        for action in &actions {
            on_action(action);
        }
        let exit_code = match scripted.reason {
            TerminalReason::Completed => Some(0),
            TerminalReason::ProcessError => Some(1),
            _ => None,
        };
        Ok(PhaseResult {
            phase: request.phase,
            round: request.round,
            output: scripted.output,
            duration: Duration::from_millis(5),
            reason: scripted.reason,
            actions,
            exit_code,
        })
    }
}
