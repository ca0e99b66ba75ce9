//! Autonomous implement/review/commit/validate loop over an external tracker.
//!
//! The crate drives an AI coding assistant through a fixed phase cascade for
//! one tracked task at a time, until the ready work runs out, an iteration
//! cap is hit, or too many recent iterations fail. The architecture keeps a
//! strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (signals, selection, breaker,
//!   snapshots). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (subprocesses, tracker CLI,
//!   `.cascade/` files). Behind traits so tests can script them.
//!
//! Orchestration modules ([`iteration`], [`looping`]) coordinate core logic
//! with I/O to implement `cascade run`.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod iteration;
pub mod logging;
pub mod looping;
pub mod report;
pub mod shutdown;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
