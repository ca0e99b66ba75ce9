//! Failure taxonomy folded into every Iteration Result.
//!
//! Phase- and call-level failures never unwind past the iteration boundary;
//! they are recorded here instead. Breaker trips and idle exhaustion are loop
//! stops, not failures, and live in [`crate::looping::LoopStop`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::types::{PhaseName, TerminalReason};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// Hard timeout exceeded; the phase was killed.
    PhaseTimeout { phase: PhaseName },
    /// No tool action inside the idle window; the phase was killed.
    PhaseIdle { phase: PhaseName },
    /// The phase output carried no recognizable signal.
    SignalIndeterminate { phase: PhaseName },
    /// A tracker query, transition or sync failed.
    ExternalCallFailure { call: String, message: String },
    ReviewBlocked,
    ReviewRetriesExhausted { rounds: u32 },
    /// Spawn failure, non-zero exit, or a cancelled child.
    ProcessError { phase: PhaseName, message: String },
    /// The cascade ran to the end but the task is still open.
    NotClosed { task_id: String },
    /// Shutdown was requested before the cascade finished.
    Interrupted { phase: Option<PhaseName> },
}

impl FailureKind {
    /// Failure implied by a phase that did not complete, if any.
    pub fn from_terminal(phase: PhaseName, reason: TerminalReason, exit_code: Option<i32>) -> Option<Self> {
        match reason {
            TerminalReason::Completed => None,
            TerminalReason::Timeout => Some(Self::PhaseTimeout { phase }),
            TerminalReason::Idle => Some(Self::PhaseIdle { phase }),
            TerminalReason::Cancelled => Some(Self::Interrupted { phase: Some(phase) }),
            TerminalReason::ProcessError => Some(Self::ProcessError {
                phase,
                message: match exit_code {
                    Some(code) => format!("exited with status {code}"),
                    None => "terminated without exit status".to_string(),
                },
            }),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::PhaseTimeout { .. } => "phase_timeout",
            Self::PhaseIdle { .. } => "phase_idle",
            Self::SignalIndeterminate { .. } => "signal_indeterminate",
            Self::ExternalCallFailure { .. } => "external_call_failure",
            Self::ReviewBlocked => "review_blocked",
            Self::ReviewRetriesExhausted { .. } => "review_retries_exhausted",
            Self::ProcessError { .. } => "process_error",
            Self::NotClosed { .. } => "not_closed",
            Self::Interrupted { .. } => "interrupted",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PhaseTimeout { phase } => write!(f, "{phase} phase exceeded its hard timeout"),
            Self::PhaseIdle { phase } => write!(f, "{phase} phase went idle"),
            Self::SignalIndeterminate { phase } => {
                write!(f, "{phase} phase produced no recognizable signal")
            }
            Self::ExternalCallFailure { call, message } => {
                write!(f, "tracker {call} failed: {message}")
            }
            Self::ReviewBlocked => f.write_str("review blocked the task"),
            Self::ReviewRetriesExhausted { rounds } => {
                write!(f, "review still requested changes after {rounds} round(s)")
            }
            Self::ProcessError { phase, message } => write!(f, "{phase} phase failed: {message}"),
            Self::NotClosed { task_id } => write!(f, "task {task_id} was not closed"),
            Self::Interrupted { phase: Some(phase) } => {
                write!(f, "interrupted during {phase} phase")
            }
            Self::Interrupted { phase: None } => f.write_str("interrupted"),
        }
    }
}
