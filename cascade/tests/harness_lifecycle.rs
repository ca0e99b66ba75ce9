//! Loop-level harness tests for full cascade run scenarios.
//!
//! These tests drive `run_loop` through many iterations with the scripted
//! executor and the in-memory tracker to verify end-to-end behavior:
//! selection order, validation triggers, failure tracking, persistence, and
//! every termination condition.

use std::collections::BTreeSet;
use std::fs;

use cascade::core::failure::FailureKind;
use cascade::core::types::{ItemStatus, IterationResult, PhaseName, TerminalReason, ValidateScope, WorkItem};
use cascade::exit_codes;
use cascade::io::config::CascadeConfig;
use cascade::io::history::load_history;
use cascade::io::run_state::{RunPhase, load_status};
use cascade::looping::{LoopOptions, LoopStop, run_loop};
use cascade::report::LoopReport;
use cascade::shutdown::ShutdownToken;
use cascade::test_support::{
    FakeTracker, ScriptedExecutor, TestProject, approve, complete, ended, item, labeled, verdict,
};

fn options(max_iterations: u32) -> LoopOptions {
    LoopOptions {
        max_iterations,
        target: None,
        idle_override: None,
    }
}

fn depends_on(id: &str, deps: &[&str]) -> WorkItem {
    WorkItem {
        dependencies: deps.iter().map(|dep| dep.to_string()).collect::<BTreeSet<_>>(),
        ..item(id)
    }
}

fn drive(
    project: &TestProject,
    config: &CascadeConfig,
    options: &LoopOptions,
    executor: &ScriptedExecutor,
    tracker: &FakeTracker,
    shutdown: &ShutdownToken,
) -> (LoopReport, Vec<IterationResult>) {
    let mut seen = Vec::new();
    let report = run_loop(
        &project.paths,
        config,
        options,
        executor,
        tracker,
        shutdown,
        |result| seen.push(result.clone()),
    )
    .expect("run loop");
    (report, seen)
}

/// Hierarchy walk-through:
///
/// ```text
/// 1        capability-group
/// └── 1.1  user-facing unit (depends on its steps)
///     ├── 1.1.1
///     └── 1.1.2
/// ```
///
/// 1. Iter 1: 1.1.1 closes; unit still has an open step, no validation.
/// 2. Iter 2: 1.1.2 closes; the unit's children are done, unit validated.
/// 3. Iter 3: 1.1 becomes ready and closes; the group is done, group validated.
/// 4. SELECT finds only the group: idle completion.
#[test]
fn hierarchy_runs_to_idle_with_validations() {
    let project = TestProject::new().expect("project");
    let tracker = FakeTracker::new(vec![
        item("1"),
        depends_on("1.1", &["1.1.1", "1.1.2"]),
        item("1.1.1"),
        item("1.1.2"),
    ]);
    let executor = ScriptedExecutor::closing(&tracker);

    let (report, seen) = drive(
        &project,
        &CascadeConfig::default(),
        &options(25),
        &executor,
        &tracker,
        &ShutdownToken::new(),
    );

    assert_eq!(report.stop, LoopStop::Idle);
    assert_eq!(report.exit_code(), exit_codes::OK);
    assert_eq!(report.remaining_ready, Some(0));
    let tasks: Vec<_> = seen.iter().filter_map(|r| r.task_id.as_deref()).collect();
    assert_eq!(tasks, vec!["1.1.1", "1.1.2", "1.1"]);
    assert!(seen.iter().all(|r| r.success));

    // The last step completes unit 1.1; closing the unit item then completes
    // group 1. Each container is validated exactly once.
    let scopes: Vec<Vec<_>> = seen
        .iter()
        .map(|r| {
            r.validations
                .iter()
                .map(|v| (v.scope, v.scope_id.as_str(), v.passed))
                .collect()
        })
        .collect();
    assert_eq!(
        scopes,
        vec![
            vec![],
            vec![(ValidateScope::Unit, "1.1", true)],
            vec![(ValidateScope::Group, "1", true)],
        ]
    );

    let history = load_history(&project.paths.history_path).expect("history");
    assert_eq!(history, seen);
    assert_eq!(tracker.sync_calls(), 0);
}

#[test]
fn ten_ready_tasks_with_limit_three() {
    let project = TestProject::new().expect("project");
    let items: Vec<_> = (1..=10).map(|n| item(&format!("3.{n}"))).collect();
    let tracker = FakeTracker::new(items);
    let executor = ScriptedExecutor::closing(&tracker);

    let (report, seen) = drive(
        &project,
        &CascadeConfig::default(),
        &options(3),
        &executor,
        &tracker,
        &ShutdownToken::new(),
    );

    assert_eq!(seen.len(), 3);
    assert_eq!(report.remaining_ready, Some(7));
    assert_eq!(report.exit_code(), exit_codes::ITERATION_LIMIT);
    assert!(
        report
            .to_string()
            .starts_with("iteration limit reached: 3 / 3 iterations, 7 ready task(s) remaining")
    );
}

/// Commit files follow-up work, including a new parked capability-group.
/// The new group forces an ancestor map rebuild, after which its child is
/// never selected.
#[test]
fn filed_follow_ups_count_as_findings() {
    let project = TestProject::new().expect("project");
    let tracker = FakeTracker::new(vec![item("1.1")]);
    let filer = tracker.clone();
    let executor = ScriptedExecutor::from_fn(move |request| match request.phase {
        PhaseName::Review => approve(),
        PhaseName::Commit => {
            filer.close(&request.task_id);
            if request.task_id == "1.1" {
                filer.add(item("1.2"));
                filer.add(labeled("2", &["backlog"]));
                filer.add(item("2.1"));
            }
            complete()
        }
        _ => complete(),
    });

    let (report, seen) = drive(
        &project,
        &CascadeConfig::default(),
        &options(25),
        &executor,
        &tracker,
        &ShutdownToken::new(),
    );

    let findings: Vec<_> = seen.iter().map(|r| r.findings_count).collect();
    assert_eq!(findings, vec![3, 0]);
    assert_eq!(seen[1].task_id.as_deref(), Some("1.2"));
    assert_eq!(report.stop, LoopStop::Idle);
    assert_eq!(report.remaining_ready, Some(0));
    assert_eq!(tracker.status_of("2.1"), Some(ItemStatus::Open));
}

/// Six early successes fall out of the window; five failures inside the
/// last ten iterations still trip the breaker.
#[test]
fn breaker_trips_on_failures_inside_the_window() {
    let project = TestProject::new().expect("project");
    let items: Vec<_> = (1..=9).map(|n| item(&format!("1.{n}"))).collect();
    let tracker = FakeTracker::new(items);
    let closer = tracker.clone();
    let executor = ScriptedExecutor::from_fn(move |request| {
        let failing = request.task_id.as_str() > "1.6";
        match request.phase {
            PhaseName::Review if failing => verdict("BLOCKED", 1),
            PhaseName::Review => approve(),
            PhaseName::Commit => {
                closer.close(&request.task_id);
                complete()
            }
            _ => complete(),
        }
    });

    let (report, seen) = drive(
        &project,
        &CascadeConfig::default(),
        &options(25),
        &executor,
        &tracker,
        &ShutdownToken::new(),
    );

    assert_eq!(seen.len(), 11);
    assert_eq!(
        report.stop,
        LoopStop::CircuitOpen {
            failures: 5,
            window: 10,
            threshold: 5
        }
    );
    assert_eq!(report.exit_code(), exit_codes::CIRCUIT_OPEN);
    assert_eq!(report.skipped, vec!["1.7".to_string()]);
    let failed: Vec<_> = seen[6..]
        .iter()
        .filter_map(|r| r.task_id.as_deref())
        .collect();
    assert_eq!(failed, vec!["1.7", "1.7", "1.7", "1.8", "1.8"]);
    assert!(
        seen[6..]
            .iter()
            .all(|r| r.failure == Some(FailureKind::ReviewBlocked))
    );

    let escalation = fs::read_to_string(&project.paths.escalation_path).expect("escalation");
    assert!(escalation.contains("5 failures in the last 10 iteration(s) (threshold 5)"));
    assert!(escalation.contains("- `1.7`: 3 consecutive failure(s) (skipped)"));
    assert!(escalation.contains("- `1.8`: 2 consecutive failure(s)\n"));

    let status = load_status(&project.paths.status_path)
        .expect("load")
        .expect("status");
    assert_eq!(status.state, RunPhase::Finished);
    assert_eq!(status.stop.as_deref(), Some("circuit breaker open"));
    assert_eq!(status.breaker_window.iter().filter(|ok| !**ok).count(), 5);
}

#[test]
fn sync_fires_floor_n_over_k_times() {
    let project = TestProject::new().expect("project");
    let items: Vec<_> = (1..=9).map(|n| item(&format!("1.{n}"))).collect();
    let tracker = FakeTracker::new(items);
    let executor = ScriptedExecutor::closing(&tracker);
    let config = CascadeConfig {
        sync_interval: 3,
        ..CascadeConfig::default()
    };

    let (report, _) = drive(
        &project,
        &config,
        &options(7),
        &executor,
        &tracker,
        &ShutdownToken::new(),
    );

    assert_eq!(report.iterations_run, 7);
    assert_eq!(tracker.sync_calls(), 2);
}

/// A shutdown observed mid-phase ends the run after that iteration is
/// persisted; the interrupted task goes back to open.
#[test]
fn shutdown_mid_phase_persists_and_stops() {
    let project = TestProject::new().expect("project");
    let tracker = FakeTracker::new(vec![item("1.1"), item("1.2")]);
    let closer = tracker.clone();
    let shutdown = ShutdownToken::new();
    let signal = shutdown.clone();
    let executor = ScriptedExecutor::from_fn(move |request| match request.phase {
        PhaseName::Implement if request.task_id == "1.2" => {
            signal.cancel();
            ended(TerminalReason::Cancelled)
        }
        PhaseName::Review => approve(),
        PhaseName::Commit => {
            closer.close(&request.task_id);
            complete()
        }
        _ => complete(),
    });

    let (report, seen) = drive(
        &project,
        &CascadeConfig::default(),
        &options(25),
        &executor,
        &tracker,
        &shutdown,
    );

    assert_eq!(report.stop, LoopStop::Interrupted);
    assert_eq!(report.exit_code(), exit_codes::INTERRUPTED);
    assert_eq!(report.iterations_run, 2);
    assert_eq!(
        seen[1].failure,
        Some(FailureKind::Interrupted {
            phase: Some(PhaseName::Implement)
        })
    );
    assert!(
        !executor
            .calls()
            .iter()
            .any(|(task, phase)| task == "1.2" && *phase == PhaseName::Review)
    );
    assert_eq!(tracker.status_of("1.2"), Some(ItemStatus::Open));
    assert_eq!(load_history(&project.paths.history_path).expect("history").len(), 2);
}
