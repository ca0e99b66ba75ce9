//! Final run report and the escalation document written on a breaker trip.

use std::fmt;

use serde::Serialize;

use crate::core::breaker::CircuitBreaker;
use crate::core::skip_list::SkipList;
use crate::core::types::IterationResult;
use crate::looping::LoopStop;

/// Summary of one `run_loop` invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoopReport {
    pub run_id: String,
    pub stop: LoopStop,
    pub iterations_run: u32,
    pub max_iterations: u32,
    /// Ready tasks left when the run stopped; `None` if the tracker could not say.
    pub remaining_ready: Option<usize>,
    pub successes: u32,
    pub failures: u32,
    /// Tasks excluded after repeated failures.
    pub skipped: Vec<String>,
}

impl LoopReport {
    pub fn exit_code(&self) -> i32 {
        self.stop.exit_code()
    }

    fn remaining_text(&self) -> String {
        match self.remaining_ready {
            Some(count) => format!("{count} ready task(s) remaining"),
            None => "ready task count unavailable".to_string(),
        }
    }
}

impl fmt::Display for LoopReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let remaining = self.remaining_text();
        match &self.stop {
            LoopStop::IterationLimit => writeln!(
                f,
                "iteration limit reached: {} / {} iterations, {remaining}",
                self.iterations_run, self.max_iterations
            )?,
            LoopStop::CircuitOpen {
                failures,
                window,
                threshold,
            } => writeln!(
                f,
                "circuit breaker open ({failures} failures in last {window}, threshold {threshold}): \
                 halted after {} iteration(s), {remaining}; see escalation report",
                self.iterations_run
            )?,
            stop => writeln!(
                f,
                "{}: {} / {} iterations, {remaining}",
                stop.label(),
                self.iterations_run,
                self.max_iterations
            )?,
        }
        writeln!(f, "successes: {}, failures: {}", self.successes, self.failures)?;
        if !self.skipped.is_empty() {
            writeln!(f, "skipped after repeated failures: {}", self.skipped.join(", "))?;
        }
        Ok(())
    }
}

/// Markdown escalation report for an operator after the breaker opens.
pub fn render_escalation(
    run_id: &str,
    breaker: &CircuitBreaker,
    recent: &[IterationResult],
    skip_list: &SkipList,
) -> String {
    let window = breaker.window();
    let mut out = String::from("# Circuit breaker open\n\n");
    out.push_str(&format!(
        "Run `{run_id}` halted: {} failures in the last {} iteration(s) (threshold {}).\n\n",
        breaker.failures(),
        window.len(),
        breaker.threshold()
    ));

    out.push_str("## Window (oldest first)\n\n");
    let marks: Vec<&str> = window
        .iter()
        .map(|ok| if *ok { "S" } else { "F" })
        .collect();
    out.push_str(&format!("`{}`\n\n", marks.join(" ")));

    out.push_str("## Failed iterations\n\n");
    out.push_str("| iteration | task | outcome | failure |\n");
    out.push_str("|---|---|---|---|\n");
    for result in recent.iter().filter(|result| !result.success) {
        let failure = result
            .failure
            .as_ref()
            .map(|failure| format!("`{}` {failure}", failure.code()))
            .unwrap_or_default();
        out.push_str(&format!(
            "| {} | {} | {} | {} |\n",
            result.iteration,
            result.task_id.as_deref().unwrap_or("-"),
            result.outcome.as_str(),
            failure.replace('|', "\\|")
        ));
    }

    out.push_str("\n## Skip list\n\n");
    if skip_list.entries().is_empty() {
        out.push_str("(empty)\n");
    }
    for (task_id, count) in skip_list.entries() {
        let note = if skip_list.is_skipped(task_id) {
            " (skipped)"
        } else {
            ""
        };
        out.push_str(&format!("- `{task_id}`: {count} consecutive failure(s){note}\n"));
    }
    out
}
