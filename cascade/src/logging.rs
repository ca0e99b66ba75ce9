//! Tracing setup for the CLI.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: operator diagnostics on stderr, filtered by
//!   `RUST_LOG` or the `-v` count. Not persisted.
//!
//! - **Run artifacts (`io/run_state`, `io/history`, phase logs)**: product
//!   output under `.cascade/`. Always written, unaffected by log filters.

use clap::ValueEnum;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Default filter for a `-v` count when `RUST_LOG` is unset.
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn,cascade=info",
        1 => "info,cascade=debug",
        _ => "debug",
    }
}

/// Initialize the global subscriber. `RUST_LOG` wins over `verbosity`.
///
/// # Example
/// ```bash
/// RUST_LOG=cascade::io::process=trace cascade run
/// ```
pub fn init(verbosity: u8, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Compact => registry
            .with(fmt::layer().with_writer(std::io::stderr).compact())
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().with_writer(std::io::stderr).json())
            .init(),
    }
}
