//! Stable exit codes for cascade CLI commands.

/// Run ended in idle completion, or a non-run command succeeded.
pub const OK: i32 = 0;
/// Fatal setup error: bad config, unreadable state, tracker unavailable at start.
pub const INVALID: i32 = 1;
/// `cascade run` stopped at `max_iterations`.
pub const ITERATION_LIMIT: i32 = 2;
/// `cascade run` halted because the circuit breaker opened.
pub const CIRCUIT_OPEN: i32 = 3;
/// `cascade run` stopped on a shutdown request (128 + SIGINT).
pub const INTERRUPTED: i32 = 130;
