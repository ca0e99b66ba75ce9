//! Elapsed-time arithmetic for phase idle and hard timeouts.
//!
//! The phase runner polls [`PhaseClock::check`] with the current instant; the
//! clock itself never reads time, which keeps it deterministic under test.

use std::time::{Duration, Instant};

/// Which limit ended a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    Timeout,
    Idle,
}

#[derive(Debug, Clone)]
pub struct PhaseClock {
    started: Instant,
    last_action: Instant,
    hard_timeout: Duration,
    idle_timeout: Duration,
}

impl PhaseClock {
    /// Start a clock; the phase start counts as the first activity.
    pub fn start(at: Instant, hard_timeout: Duration, idle_timeout: Duration) -> Self {
        Self {
            started: at,
            last_action: at,
            hard_timeout,
            idle_timeout,
        }
    }

    pub fn record_action(&mut self, at: Instant) {
        if at > self.last_action {
            self.last_action = at;
        }
    }

    pub fn last_action(&self) -> Instant {
        self.last_action
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }

    /// Expiry at `now`, if any. When both limits have passed, the one whose
    /// deadline came first wins; a tie goes to the hard timeout.
    pub fn check(&self, now: Instant) -> Option<Expiry> {
        let timed_out = self.elapsed(now) > self.hard_timeout;
        let idle = is_idle(self.last_action, now, self.idle_timeout);
        match (timed_out, idle) {
            (false, false) => None,
            (true, false) => Some(Expiry::Timeout),
            (false, true) => Some(Expiry::Idle),
            (true, true) => {
                let hard_deadline = self.started.checked_add(self.hard_timeout);
                let idle_deadline = self.last_action.checked_add(self.idle_timeout);
                match (hard_deadline, idle_deadline) {
                    (Some(hard), Some(idle)) if idle < hard => Some(Expiry::Idle),
                    _ => Some(Expiry::Timeout),
                }
            }
        }
    }
}

/// Idle once `now - last_action >= idle_timeout` (inclusive boundary).
pub fn is_idle(last_action: Instant, now: Instant, idle_timeout: Duration) -> bool {
    now.saturating_duration_since(last_action) >= idle_timeout
}

/// Explicit override, then the phase default, then the global default.
pub fn resolve_idle_timeout(
    explicit: Option<Duration>,
    phase_default: Option<Duration>,
    global_default: Duration,
) -> Duration {
    explicit.or(phase_default).unwrap_or(global_default)
}
