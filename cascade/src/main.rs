//! `cascade` CLI: run the loop, inspect its state, scaffold `.cascade/`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use cascade::core::types::IterationResult;
use cascade::exit_codes;
use cascade::io::config::load_config;
use cascade::io::executor::ClaudeExecutor;
use cascade::io::history::tail_history;
use cascade::io::paths::{CascadePaths, init_layout};
use cascade::io::run_state::{RunStatus, load_status};
use cascade::io::tracker::BdTracker;
use cascade::logging::{self, LogFormat};
use cascade::looping::{LoopOptions, run_loop};
use cascade::shutdown::ShutdownToken;

#[derive(Parser)]
#[command(
    name = "cascade",
    version,
    about = "Autonomous implement/review/commit/validate loop over tracked work"
)]
struct Cli {
    /// Increase log verbosity (-v, -vv). `RUST_LOG` takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Log line format on stderr.
    #[arg(long, value_enum, default_value_t = LogFormat::Compact, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run iterations until idle, the iteration limit, or a breaker trip.
    Run(RunArgs),
    /// Print the live status file and recent history.
    Status(StatusArgs),
    /// Create `.cascade/` with a default config.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,

        /// Project root (contains .cascade/).
        #[arg(long, default_value = ".")]
        root: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Iterations before stopping (overrides config).
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    max_iterations: Option<u32>,

    /// Idle timeout in seconds for every phase (overrides config).
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    idle_timeout: Option<u64>,

    /// Pin selection and attribution to one task id.
    #[arg(long, value_name = "ID")]
    task: Option<String>,

    /// Print the final report as JSON.
    #[arg(long)]
    json: bool,

    /// Project root (contains .cascade/).
    #[arg(long, default_value = ".")]
    root: PathBuf,
}

#[derive(Args)]
struct StatusArgs {
    /// Number of history records to show.
    #[arg(long, default_value_t = 5)]
    history: usize,

    /// Print status and history as JSON.
    #[arg(long)]
    json: bool,

    /// Project root (contains .cascade/).
    #[arg(long, default_value = ".")]
    root: PathBuf,
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.log_format);
    let code = match run(cli.command) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run(command: Command) -> Result<i32> {
    match command {
        Command::Run(args) => cmd_run(args),
        Command::Status(args) => cmd_status(&args),
        Command::Init { force, root } => cmd_init(&root, force),
    }
}

fn cmd_run(args: RunArgs) -> Result<i32> {
    let paths = CascadePaths::new(&args.root);
    let mut config = load_config(&paths.config_path)?;
    if let Some(max_iterations) = args.max_iterations {
        config.max_iterations = max_iterations;
    }
    let options = LoopOptions {
        target: args.task,
        idle_override: args.idle_timeout.map(Duration::from_secs),
        ..LoopOptions::from_config(&config)
    };

    let shutdown = ShutdownToken::new();
    shutdown.install_signal_handler()?;
    let executor = ClaudeExecutor::new(&config.agent);
    let tracker = BdTracker::new(&config.tracker, &paths.root);

    let json = args.json;
    let report = run_loop(
        &paths,
        &config,
        &options,
        &executor,
        &tracker,
        &shutdown,
        |result| {
            if !json {
                println!("{}", iteration_line(result));
            }
        },
    )?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize report")?
        );
    } else {
        print!("{report}");
    }
    Ok(report.exit_code())
}

#[derive(Serialize)]
struct StatusView<'a> {
    status: &'a RunStatus,
    history: &'a [IterationResult],
}

fn cmd_status(args: &StatusArgs) -> Result<i32> {
    let paths = CascadePaths::new(&args.root);
    let Some(status) = load_status(&paths.status_path)? else {
        eprintln!("no run status at {}", paths.status_path.display());
        return Ok(exit_codes::INVALID);
    };
    let history = tail_history(&paths.history_path, args.history)?;

    if args.json {
        let view = StatusView {
            status: &status,
            history: &history,
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&view).context("serialize status")?
        );
        return Ok(exit_codes::OK);
    }

    let state = match status.stop.as_deref() {
        Some(stop) => format!("finished: {stop}"),
        None => "running".to_string(),
    };
    println!("run {} ({state})", status.run_id);
    println!(
        "iteration {} / {}, phase {}, last task {}",
        status.iteration,
        status.max_iterations,
        status.phase.map_or("-", |phase| phase.as_str()),
        status.last_task_id.as_deref().unwrap_or("-")
    );
    let window: Vec<&str> = status
        .breaker_window
        .iter()
        .map(|ok| if *ok { "S" } else { "F" })
        .collect();
    println!("breaker window: [{}]", window.join(" "));
    if !status.skip_list.is_empty() {
        let entries: Vec<String> = status
            .skip_list
            .iter()
            .map(|(id, count)| format!("{id}={count}"))
            .collect();
        println!("skip list: {}", entries.join(", "));
    }
    println!("updated {}", status.updated_at.to_rfc3339());
    for result in &history {
        println!("  {}", iteration_line(result));
    }
    Ok(exit_codes::OK)
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_layout(root, force)?;
    println!("initialized {}", paths.cascade_dir.display());
    Ok(exit_codes::OK)
}

fn iteration_line(result: &IterationResult) -> String {
    let verdict = if result.success { "ok" } else { "failed" };
    let mut line = format!(
        "iteration {} {} {} ({}, {} action(s), {} finding(s), {}ms)",
        result.iteration,
        result.task_id.as_deref().unwrap_or("-"),
        verdict,
        result.outcome.as_str(),
        result.actions.total,
        result.findings_count,
        result.duration_ms
    );
    if let Some(failure) = &result.failure {
        line.push_str(&format!(": {failure}"));
    }
    line
}
