//! Cooperative cancellation shared by the supervisor and the phase runner.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tracing::warn;

/// Cloneable flag; every clone observes the same request.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    requested: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Route SIGINT, SIGTERM and SIGHUP into this token.
    ///
    /// Can only be installed once per process.
    pub fn install_signal_handler(&self) -> Result<()> {
        let token = self.clone();
        ctrlc::set_handler(move || {
            if !token.is_cancelled() {
                warn!("shutdown requested; stopping the active phase");
            }
            token.cancel();
        })
        .context("install signal handler")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_cancellation() {
        let token = ShutdownToken::new();
        let observer = token.clone();
        assert!(!observer.is_cancelled());
        token.cancel();
        assert!(observer.is_cancelled());
    }
}
