//! Iteration controller: one selected task through the phase cascade.
//!
//! `implement -> review` repeats while review asks for changes (bounded by
//! `max_review_retries`), then `commit`, then a second snapshot, then the
//! conditional `validate` phases. Every phase- and call-level failure is
//! folded into the returned [`IterationResult`]; nothing here returns `Err`.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::attribution::attribute_work;
use crate::core::clock::resolve_idle_timeout;
use crate::core::failure::FailureKind;
use crate::core::hierarchy::{containing_unit, is_container_complete, walk_to_root};
use crate::core::signals::{Signal, VerdictKind, has_completion_marker, parse_signal};
use crate::core::snapshot::{Delta, Snapshot};
use crate::core::types::{
    ActionRecord, ActionSummary, IterationResult, Outcome, PhaseName, PhaseSummary,
    TerminalReason, ValidateScope, ValidationRecord, WorkItem,
};
use crate::io::config::{CascadeConfig, PhasesConfig};
use crate::io::executor::{PhaseExecutor, PhaseRequest, PhaseResult};
use crate::io::paths::IterationPaths;
use crate::io::prompt::{PromptBuilder, PromptInputs};
use crate::io::tracker::Tracker;
use crate::shutdown::ShutdownToken;

/// How often a running phase checks its deadlines and the shutdown flag.
pub const DEFAULT_TICK: Duration = Duration::from_millis(250);

/// Per-run knobs for the cascade.
#[derive(Debug, Clone)]
pub struct IterationSettings {
    pub phases: PhasesConfig,
    pub global_idle_timeout: Duration,
    /// Explicit idle timeout; beats every configured default.
    pub idle_override: Option<Duration>,
    pub max_review_retries: u32,
    pub output_limit_bytes: usize,
    pub tick: Duration,
    pub workdir: PathBuf,
}

impl IterationSettings {
    pub fn from_config(
        config: &CascadeConfig,
        workdir: impl Into<PathBuf>,
        idle_override: Option<Duration>,
    ) -> Self {
        Self {
            phases: config.phases.clone(),
            global_idle_timeout: config.global_idle_timeout(),
            idle_override,
            max_review_retries: config.max_review_retries,
            output_limit_bytes: config.agent.output_limit_bytes,
            tick: DEFAULT_TICK,
            workdir: workdir.into(),
        }
    }

    /// Hard and idle timeout for `phase`.
    pub fn timeouts(&self, phase: PhaseName) -> (Duration, Duration) {
        let cfg = self.phases.get(phase);
        let idle = resolve_idle_timeout(
            self.idle_override,
            cfg.idle_timeout(),
            self.global_idle_timeout,
        );
        (cfg.hard_timeout(), idle)
    }
}

/// One iteration's inputs.
#[derive(Debug, Clone)]
pub struct IterationRequest<'a> {
    pub run_id: &'a str,
    pub iteration: u32,
    pub task: &'a WorkItem,
    /// Pinned task id; wins attribution outright.
    pub target: Option<&'a str>,
    pub logs: IterationPaths,
}

/// The iteration's result plus what the supervisor needs for bookkeeping.
#[derive(Debug, Clone)]
pub struct IterationReport {
    pub result: IterationResult,
    /// Post-cascade snapshot, when it could be captured.
    pub after: Option<Snapshot>,
    pub delta: Option<Delta>,
}

/// Phase bookkeeping shared by every phase of one iteration.
#[derive(Debug, Default)]
struct CascadeLog {
    phases: Vec<PhaseSummary>,
    actions: ActionSummary,
    /// First cascade phase that did not complete; validate phases excluded.
    first_abnormal: Option<TerminalReason>,
}

impl CascadeLog {
    fn record(&mut self, result: &PhaseResult) {
        self.phases.push(PhaseSummary {
            phase: result.phase,
            round: result.round,
            reason: result.reason,
            duration_ms: millis(result.duration),
            actions: u32::try_from(result.actions.len()).unwrap_or(u32::MAX),
        });
        if result.phase != PhaseName::Validate && !result.completed() {
            self.first_abnormal.get_or_insert(result.reason);
        }
    }
}

pub struct IterationController<'a, E, T> {
    executor: &'a E,
    tracker: &'a T,
    prompts: &'a PromptBuilder,
    settings: &'a IterationSettings,
    shutdown: &'a ShutdownToken,
}

impl<'a, E: PhaseExecutor, T: Tracker> IterationController<'a, E, T> {
    pub fn new(
        executor: &'a E,
        tracker: &'a T,
        prompts: &'a PromptBuilder,
        settings: &'a IterationSettings,
        shutdown: &'a ShutdownToken,
    ) -> Self {
        Self {
            executor,
            tracker,
            prompts,
            settings,
            shutdown,
        }
    }

    /// Run the cascade for `request.task`. `on_phase` fires as each phase starts.
    #[instrument(skip_all, fields(iteration = request.iteration, task_id = %request.task.id))]
    pub fn run(
        &self,
        request: &IterationRequest<'_>,
        on_phase: &mut dyn FnMut(PhaseName),
    ) -> IterationReport {
        let started_at = Utc::now();
        let start = Instant::now();
        let task_id = request.task.id.as_str();
        let mut log = CascadeLog::default();

        let before = self.capture("before");

        let mut failure: Option<FailureKind> = None;
        let mut verdict: Option<VerdictKind> = None;
        let mut review_rounds = 0u32;
        let mut no_work = false;
        let mut commit_marker = false;

        'cascade: {
            let max_rounds = self.settings.max_review_retries.saturating_add(1);
            let mut feedback: Option<String> = None;
            let mut approved = false;

            for round in 1..=max_rounds {
                let implement = match self.cascade_phase(
                    request,
                    PhaseName::Implement,
                    round,
                    feedback.as_deref(),
                    &mut log,
                    on_phase,
                ) {
                    Ok(result) => result,
                    Err(err) => {
                        failure = Some(err);
                        break 'cascade;
                    }
                };
                if parse_signal(&implement.output) == Signal::NoWork {
                    info!(round, "implement reported no actionable work");
                    no_work = true;
                    break 'cascade;
                }

                let review = match self.cascade_phase(
                    request,
                    PhaseName::Review,
                    round,
                    None,
                    &mut log,
                    on_phase,
                ) {
                    Ok(result) => result,
                    Err(err) => {
                        failure = Some(err);
                        break 'cascade;
                    }
                };
                review_rounds = round;

                let Signal::Verdict(found) = parse_signal(&review.output) else {
                    warn!(round, "review produced no verdict");
                    failure = Some(FailureKind::SignalIndeterminate {
                        phase: PhaseName::Review,
                    });
                    break 'cascade;
                };
                let effective = found.effective();
                verdict = Some(effective);
                match effective {
                    VerdictKind::Approved | VerdictKind::Skipped => {
                        debug!(round, verdict = effective.as_str(), "review approved");
                        approved = true;
                        break;
                    }
                    VerdictKind::Blocked => {
                        warn!(round, "review blocked the task");
                        failure = Some(FailureKind::ReviewBlocked);
                        break 'cascade;
                    }
                    VerdictKind::NeedsChanges => {
                        info!(
                            round,
                            blocking_issues = found.blocking_issues,
                            "review requested changes"
                        );
                        feedback = Some(review.output);
                    }
                }
            }

            if !approved {
                warn!(rounds = review_rounds, "review retries exhausted");
                failure = Some(FailureKind::ReviewRetriesExhausted {
                    rounds: review_rounds,
                });
                break 'cascade;
            }

            match self.cascade_phase(request, PhaseName::Commit, 1, None, &mut log, on_phase) {
                Ok(commit) => commit_marker = has_completion_marker(&commit.output),
                Err(err) => failure = Some(err),
            }
        }

        let interrupted = matches!(failure, Some(FailureKind::Interrupted { .. }));
        let after = if interrupted {
            None
        } else {
            self.capture("after")
        };
        let delta = before
            .as_ref()
            .zip(after.as_ref())
            .map(|(before, after)| Delta::between(before, after));

        let no_change = Delta::default();
        let attributed = attribute_work(request.target, task_id, delta.as_ref().unwrap_or(&no_change));
        if attributed != task_id {
            info!(attributed = %attributed, "work attributed to a different task");
        }

        // Without a post-snapshot the commit phase's completion marker stands in
        // for the tracker's closed status.
        let closed = match &after {
            Some(after) => after.get_by_id(&attributed).is_some_and(WorkItem::is_closed),
            None => !no_work && commit_marker,
        };
        if failure.is_none() && !closed {
            failure = Some(FailureKind::NotClosed {
                task_id: attributed.clone(),
            });
        }
        let success = failure.is_none();

        let mut validations = Vec::new();
        if success && let Some(after) = &after {
            let targets = validate_targets(before.as_ref(), after, &attributed);
            for (index, (scope, scope_id)) in targets.into_iter().enumerate() {
                if self.shutdown.is_cancelled() {
                    info!("shutdown requested; skipping remaining validation");
                    break;
                }
                let round = u32::try_from(index + 1).unwrap_or(u32::MAX);
                validations.push(self.validate(request, scope, scope_id, round, &mut log, on_phase));
            }
        }

        let outcome = match (log.first_abnormal, &failure) {
            (Some(reason), _) => Outcome::from(reason),
            (None, Some(FailureKind::ProcessError { .. } | FailureKind::Interrupted { .. })) => {
                Outcome::Error
            }
            _ => Outcome::Completed,
        };
        let findings_count = delta.as_ref().map_or(0, Delta::findings_count);

        let result = IterationResult {
            run_id: request.run_id.to_string(),
            iteration: request.iteration,
            task_id: Some(attributed),
            outcome,
            success,
            duration_ms: millis(start.elapsed()),
            actions: log.actions,
            findings_count,
            verdict,
            review_rounds,
            failure,
            phases: log.phases,
            validations,
            started_at,
            ended_at: Utc::now(),
        };
        match &result.failure {
            None => info!(findings_count, "iteration succeeded"),
            Some(failure) => warn!(failure = %failure, "iteration failed"),
        }
        IterationReport {
            result,
            after,
            delta,
        }
    }

    /// Run a cascade phase; anything short of completion becomes the failure.
    fn cascade_phase(
        &self,
        request: &IterationRequest<'_>,
        phase: PhaseName,
        round: u32,
        feedback: Option<&str>,
        log: &mut CascadeLog,
        on_phase: &mut dyn FnMut(PhaseName),
    ) -> Result<PhaseResult, FailureKind> {
        if self.shutdown.is_cancelled() {
            info!(phase = %phase, "shutdown requested; stopping cascade");
            return Err(FailureKind::Interrupted { phase: Some(phase) });
        }
        let result = self.run_phase(request, phase, round, feedback, None, log, on_phase)?;
        match FailureKind::from_terminal(phase, result.reason, result.exit_code) {
            Some(failure) => Err(failure),
            None => Ok(result),
        }
    }

    fn validate(
        &self,
        request: &IterationRequest<'_>,
        scope: ValidateScope,
        scope_id: String,
        round: u32,
        log: &mut CascadeLog,
        on_phase: &mut dyn FnMut(PhaseName),
    ) -> ValidationRecord {
        info!(scope = scope.as_str(), scope_id = %scope_id, "container complete; validating");
        let outcome = self.run_phase(
            request,
            PhaseName::Validate,
            round,
            None,
            Some((scope, &scope_id)),
            log,
            on_phase,
        );
        let (reason, passed) = match outcome {
            Ok(result) => (
                result.reason,
                result.completed() && has_completion_marker(&result.output),
            ),
            Err(_) => (TerminalReason::ProcessError, false),
        };
        if !passed {
            warn!(scope = scope.as_str(), scope_id = %scope_id, reason = reason.as_str(), "validation did not pass");
        }
        ValidationRecord {
            scope,
            scope_id,
            reason,
            passed,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_phase(
        &self,
        request: &IterationRequest<'_>,
        phase: PhaseName,
        round: u32,
        feedback: Option<&str>,
        validate: Option<(ValidateScope, &str)>,
        log: &mut CascadeLog,
        on_phase: &mut dyn FnMut(PhaseName),
    ) -> Result<PhaseResult, FailureKind> {
        on_phase(phase);
        let prompt = self
            .prompts
            .render(&PromptInputs {
                phase,
                task: request.task,
                iteration: request.iteration,
                round,
                feedback,
                validate,
            })
            .map_err(|err| FailureKind::ProcessError {
                phase,
                message: format!("render prompt: {err:#}"),
            })?;

        let (hard_timeout, idle_timeout) = self.settings.timeouts(phase);
        let phase_request = PhaseRequest {
            phase,
            round,
            iteration: request.iteration,
            task_id: request.task.id.clone(),
            workdir: self.settings.workdir.clone(),
            prompt,
            hard_timeout,
            idle_timeout,
            log_path: request.logs.phase_log(phase, round),
            output_limit_bytes: self.settings.output_limit_bytes,
            tick: self.settings.tick,
        };

        let actions = &mut log.actions;
        let result = self
            .executor
            .run_phase(&phase_request, self.shutdown, &mut |action: &ActionRecord| {
                actions.record(&action.tool);
            })
            .map_err(|err| {
                warn!(phase = %phase, err = %format!("{err:#}"), "phase runner failed");
                FailureKind::ProcessError {
                    phase,
                    message: format!("{err:#}"),
                }
            })?;
        debug!(
            phase = %phase,
            round,
            reason = result.reason.as_str(),
            duration_ms = millis(result.duration),
            "phase finished"
        );
        log.record(&result);
        Ok(result)
    }

    fn capture(&self, label: &str) -> Option<Snapshot> {
        match self.tracker.list_items() {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                warn!(snapshot = label, err = %format!("{err:#}"), "snapshot capture failed");
                None
            }
        }
    }
}

/// Containers that became complete with `task_id`'s work, unit before group.
///
/// A container already complete in `before` was validated by an earlier
/// iteration and is not repeated. Without a pre-snapshot every complete
/// container qualifies.
pub fn validate_targets(
    before: Option<&Snapshot>,
    after: &Snapshot,
    task_id: &str,
) -> Vec<(ValidateScope, String)> {
    let newly_complete = |container: &str| {
        is_container_complete(after, container)
            && !before.is_some_and(|before| is_container_complete(before, container))
    };
    let mut targets = Vec::new();
    let unit = containing_unit(after, task_id);
    if let Some(unit) = &unit
        && newly_complete(unit)
    {
        targets.push((ValidateScope::Unit, unit.clone()));
    }
    let group = walk_to_root(after, task_id);
    if group != task_id && unit.as_deref() != Some(group.as_str()) && newly_complete(&group) {
        targets.push((ValidateScope::Group, group));
    }
    targets
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
