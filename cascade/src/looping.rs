//! Loop supervisor for `cascade run`.
//!
//! SELECT -> RUN_CASCADE -> UPDATE_FAILURE_STATE -> PERSIST -> termination
//! checks, repeated until the ready set is exhausted, the iteration limit is
//! hit, the circuit breaker opens, or shutdown is requested.

use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::ancestry::{AncestorMap, deferred_groups};
use crate::core::breaker::CircuitBreaker;
use crate::core::failure::FailureKind;
use crate::core::selector::{SelectionFilter, remaining_ready, select_task};
use crate::core::skip_list::SkipList;
use crate::core::snapshot::Snapshot;
use crate::core::types::{ActionSummary, ItemStatus, IterationResult, Outcome, WorkItem};
use crate::exit_codes;
use crate::io::atomic::write_atomic;
use crate::io::config::CascadeConfig;
use crate::io::executor::PhaseExecutor;
use crate::io::history::append_history;
use crate::io::paths::CascadePaths;
use crate::io::prompt::PromptBuilder;
use crate::io::run_state::{RunPhase, RunStatus, write_status};
use crate::io::tracker::Tracker;
use crate::iteration::{IterationController, IterationRequest, IterationSettings};
use crate::report::{LoopReport, render_escalation};
use crate::shutdown::ShutdownToken;

/// Why `run_loop` stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LoopStop {
    /// No eligible ready task remained at SELECT.
    Idle,
    /// `max_iterations` iterations ran.
    IterationLimit,
    /// Failures inside the breaker window reached the threshold.
    CircuitOpen {
        failures: usize,
        window: usize,
        threshold: usize,
    },
    /// A shutdown request was observed.
    Interrupted,
}

impl LoopStop {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle completion",
            Self::IterationLimit => "iteration limit reached",
            Self::CircuitOpen { .. } => "circuit breaker open",
            Self::Interrupted => "interrupted",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Idle => exit_codes::OK,
            Self::IterationLimit => exit_codes::ITERATION_LIMIT,
            Self::CircuitOpen { .. } => exit_codes::CIRCUIT_OPEN,
            Self::Interrupted => exit_codes::INTERRUPTED,
        }
    }
}

/// Per-invocation knobs that override the config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOptions {
    pub max_iterations: u32,
    /// Pins selection and attribution to one task.
    pub target: Option<String>,
    /// Idle timeout that beats every phase and global default.
    pub idle_override: Option<Duration>,
}

impl LoopOptions {
    pub fn from_config(config: &CascadeConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
            target: None,
            idle_override: None,
        }
    }
}

/// Ancestor Map plus the deferred groups derived from the same snapshot.
struct Ancestry {
    map: AncestorMap,
    deferred: BTreeSet<String>,
}

impl Ancestry {
    fn build(snapshot: &Snapshot, labels: &[String]) -> Self {
        let map = AncestorMap::build(snapshot);
        let deferred = deferred_groups(snapshot, labels);
        debug!(
            items = map.len(),
            groups = map.groups().len(),
            deferred = deferred.len(),
            "ancestor map built"
        );
        Self { map, deferred }
    }

    fn filter<'a>(&'a self, skip_list: &'a SkipList) -> SelectionFilter<'a> {
        SelectionFilter {
            ancestors: &self.map,
            deferred: &self.deferred,
            skip_list,
        }
    }
}

/// Drive iterations until a termination condition holds.
///
/// Only setup problems (initial snapshot, unwritable state files) return
/// `Err`; every phase or tracker failure inside an iteration is folded into
/// that iteration's result.
#[instrument(skip_all, fields(max_iterations = options.max_iterations, target = ?options.target))]
pub fn run_loop<E: PhaseExecutor, T: Tracker>(
    paths: &CascadePaths,
    config: &CascadeConfig,
    options: &LoopOptions,
    executor: &E,
    tracker: &T,
    shutdown: &ShutdownToken,
    mut on_iteration: impl FnMut(&IterationResult),
) -> Result<LoopReport> {
    let run_id = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
    info!(run_id = %run_id, "starting run");

    let initial = tracker
        .list_items()
        .context("capture initial snapshot")?;
    let mut ancestry = Ancestry::build(&initial, &config.deferred_labels);
    drop(initial);

    let mut breaker = CircuitBreaker::new(config.breaker.window, config.breaker.threshold);
    let mut skip_list = SkipList::new(config.skip_after_failures);
    let prompts = PromptBuilder::new(Some(paths.resolve_prompts_dir(config)));
    let settings = IterationSettings::from_config(config, &paths.root, options.idle_override);
    let controller = IterationController::new(executor, tracker, &prompts, &settings, shutdown);

    let mut status = RunStatus::new(&run_id, options.max_iterations);
    write_status(&paths.status_path, &mut status)
        .with_context(|| format!("write {}", paths.status_path.display()))?;

    let mut recent: VecDeque<IterationResult> = VecDeque::with_capacity(breaker.capacity());
    let mut iterations_run = 0u32;
    let mut successes = 0u32;
    let mut failures = 0u32;
    let mut remaining: Option<usize> = None;

    let stop = loop {
        if shutdown.is_cancelled() {
            info!("shutdown requested; not starting another iteration");
            break LoopStop::Interrupted;
        }
        if iterations_run >= options.max_iterations {
            break LoopStop::IterationLimit;
        }
        let iteration = iterations_run + 1;

        let (result, selected) = match tracker.ready_items() {
            Err(err) => {
                warn!(iteration, err = %format!("{err:#}"), "ready query failed");
                (ready_failure(&run_id, iteration, &err), None)
            }
            Ok(ready) => {
                let filter = ancestry.filter(&skip_list);
                let Some(task) = select_task(&ready, &filter, options.target.as_deref()) else {
                    remaining = Some(remaining_ready(&ready, &filter));
                    info!(remaining = ?remaining, "no eligible ready task");
                    break LoopStop::Idle;
                };
                let task = task.clone();
                info!(iteration, task_id = %task.id, priority = task.priority, "selected task");

                status.iteration = iteration;
                status.last_task_id = Some(task.id.clone());
                status.phase = None;
                write_status(&paths.status_path, &mut status)
                    .with_context(|| format!("write {}", paths.status_path.display()))?;

                if let Err(err) = tracker.transition(&task.id, ItemStatus::InProgress) {
                    warn!(task_id = %task.id, err = %format!("{err:#}"), "in_progress transition failed");
                }

                let request = IterationRequest {
                    run_id: &run_id,
                    iteration,
                    task: &task,
                    target: options.target.as_deref(),
                    logs: paths.iteration(&run_id, iteration),
                };
                let report = controller.run(&request, &mut |phase| {
                    status.phase = Some(phase);
                    if let Err(err) = write_status(&paths.status_path, &mut status) {
                        warn!(phase = %phase, err = %format!("{err:#}"), "status write failed");
                    }
                });

                let closed_after = report
                    .after
                    .as_ref()
                    .map(|after| after.get_by_id(&task.id).is_some_and(WorkItem::is_closed));
                let reopen = match closed_after {
                    Some(closed) => !closed,
                    None => !report.result.success,
                };
                if reopen && let Err(err) = tracker.transition(&task.id, ItemStatus::Open) {
                    warn!(task_id = %task.id, err = %format!("{err:#}"), "reopen transition failed");
                }

                if let (Some(after), Some(delta)) = (&report.after, &report.delta)
                    && ancestry.map.needs_rebuild(delta)
                {
                    info!("new top-level work appeared; rebuilding ancestor map");
                    ancestry = Ancestry::build(after, &config.deferred_labels);
                }

                (report.result, Some(task.id))
            }
        };
        iterations_run = iteration;

        breaker.record(result.success);
        if result.success {
            successes += 1;
        } else {
            failures += 1;
        }
        if let Some(task_id) = &selected {
            if result.success {
                skip_list.record_success(task_id);
            } else {
                let count = skip_list.record_failure(task_id);
                if skip_list.is_skipped(task_id) {
                    warn!(task_id = %task_id, count, "task reached the failure limit; skipping it");
                }
            }
        }

        append_history(&paths.history_path, &result)
            .with_context(|| format!("append {}", paths.history_path.display()))?;
        status.iteration = iteration;
        if result.task_id.is_some() {
            status.last_task_id.clone_from(&result.task_id);
        }
        status.breaker_window = breaker.window();
        status.skip_list = skip_list.entries().clone();
        write_status(&paths.status_path, &mut status)
            .with_context(|| format!("write {}", paths.status_path.display()))?;
        on_iteration(&result);

        if iteration % config.sync_interval.max(1) == 0 {
            info!(iteration, "periodic tracker sync");
            if let Err(err) = tracker.sync() {
                warn!(iteration, err = %format!("{err:#}"), "tracker sync failed; continuing");
            }
        }

        if recent.len() == breaker.capacity() {
            recent.pop_front();
        }
        recent.push_back(result);

        if shutdown.is_cancelled() {
            info!(iteration, "shutdown requested; stopping after persisted iteration");
            break LoopStop::Interrupted;
        }
        if breaker.is_open() {
            let stop = LoopStop::CircuitOpen {
                failures: breaker.failures(),
                window: breaker.window().len(),
                threshold: breaker.threshold(),
            };
            warn!(failures = breaker.failures(), threshold = breaker.threshold(), "circuit breaker open; halting");
            let escalation = render_escalation(&run_id, &breaker, recent.make_contiguous(), &skip_list);
            write_atomic(&paths.escalation_path, escalation.as_bytes())
                .with_context(|| format!("write {}", paths.escalation_path.display()))?;
            break stop;
        }
        if iterations_run >= options.max_iterations {
            break LoopStop::IterationLimit;
        }
    };

    if remaining.is_none() {
        remaining = match tracker.ready_items() {
            Ok(ready) => Some(remaining_ready(&ready, &ancestry.filter(&skip_list))),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "final ready query failed");
                None
            }
        };
    }

    status.state = RunPhase::Finished;
    status.stop = Some(stop.label().to_string());
    write_status(&paths.status_path, &mut status)
        .with_context(|| format!("write {}", paths.status_path.display()))?;
    info!(stop = stop.label(), iterations_run, remaining = ?remaining, "run finished");

    Ok(LoopReport {
        run_id,
        stop,
        iterations_run,
        max_iterations: options.max_iterations,
        remaining_ready: remaining,
        successes,
        failures,
        skipped: skip_list.skipped(),
    })
}

/// Iteration record for a ready query that failed before anything was selected.
fn ready_failure(run_id: &str, iteration: u32, err: &anyhow::Error) -> IterationResult {
    let now = Utc::now();
    IterationResult {
        run_id: run_id.to_string(),
        iteration,
        task_id: None,
        outcome: Outcome::Error,
        success: false,
        duration_ms: 0,
        actions: ActionSummary::default(),
        findings_count: 0,
        verdict: None,
        review_rounds: 0,
        failure: Some(FailureKind::ExternalCallFailure {
            call: "ready".to_string(),
            message: format!("{err:#}"),
        }),
        phases: Vec::new(),
        validations: Vec::new(),
        started_at: now,
        ended_at: now,
    }
}
