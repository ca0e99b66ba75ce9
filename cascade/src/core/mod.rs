//! Deterministic, pure logic shared by the cascade loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and take time as an argument, so every rule here is
//! testable without a tracker or a subprocess.

pub mod ancestry;
pub mod attribution;
pub mod breaker;
pub mod clock;
pub mod failure;
pub mod hierarchy;
pub mod selector;
pub mod signals;
pub mod skip_list;
pub mod snapshot;
pub mod types;
