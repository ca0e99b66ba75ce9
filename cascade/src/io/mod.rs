//! Side-effecting adapters: subprocesses, the tracker, and `.cascade/` files.

pub mod atomic;
pub mod config;
pub mod executor;
pub mod history;
pub mod paths;
pub mod process;
pub mod prompt;
pub mod run_state;
pub mod tracker;
pub mod transcript;
