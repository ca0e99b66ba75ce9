//! Phase runner: one supervised AI-assistant invocation per phase.
//!
//! The [`PhaseExecutor`] trait decouples the iteration controller from the
//! actual agent backend (currently the `claude` CLI). Tests use scripted
//! executors that return predetermined outputs without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::clock::{Expiry, PhaseClock};
use crate::core::types::{ActionRecord, PhaseName, TerminalReason};
use crate::io::config::AgentConfig;
use crate::io::process::{CommandOutput, Supervision, SupervisorEvent, run_command_supervised};
use crate::io::transcript::Transcript;
use crate::shutdown::ShutdownToken;

/// Flags that switch the assistant into non-interactive streaming mode.
const STREAM_ARGS: [&str; 4] = ["-p", "--output-format", "stream-json", "--verbose"];

/// Parameters for one phase invocation.
#[derive(Debug, Clone)]
pub struct PhaseRequest {
    pub phase: PhaseName,
    /// 1-based implement/review round within the iteration.
    pub round: u32,
    pub iteration: u32,
    pub task_id: String,
    /// Working directory for the assistant process.
    pub workdir: PathBuf,
    pub prompt: String,
    pub hard_timeout: Duration,
    pub idle_timeout: Duration,
    /// Path to write the phase's stdout/stderr log.
    pub log_path: PathBuf,
    pub output_limit_bytes: usize,
    /// How often deadlines and shutdown are checked while the child runs.
    pub tick: Duration,
}

/// Outcome of one phase invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseResult {
    pub phase: PhaseName,
    pub round: u32,
    /// Assistant text used for signal parsing.
    pub output: String,
    pub duration: Duration,
    pub reason: TerminalReason,
    pub actions: Vec<ActionRecord>,
    pub exit_code: Option<i32>,
}

impl PhaseResult {
    pub fn completed(&self) -> bool {
        self.reason == TerminalReason::Completed
    }
}

/// Abstraction over agent execution backends.
pub trait PhaseExecutor {
    /// Run one phase to a terminal reason, reporting each tool action through
    /// `on_action` as it happens.
    ///
    /// Process-level failures (spawn errors, non-zero exits, deadlines) are
    /// reported through [`PhaseResult::reason`]; `Err` is reserved for
    /// failures of the runner itself.
    fn run_phase(
        &self,
        request: &PhaseRequest,
        shutdown: &ShutdownToken,
        on_action: &mut dyn FnMut(&ActionRecord),
    ) -> Result<PhaseResult>;
}

/// Executor that spawns the `claude` CLI in stream-json mode.
#[derive(Debug, Clone)]
pub struct ClaudeExecutor {
    command: Vec<String>,
    args: Vec<String>,
}

impl ClaudeExecutor {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
        }
    }

    fn build_command(&self, workdir: &Path) -> Result<Command> {
        let (program, leading) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("agent.command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(leading)
            .args(&self.args)
            .args(STREAM_ARGS)
            .current_dir(workdir);
        Ok(cmd)
    }
}

impl PhaseExecutor for ClaudeExecutor {
    #[instrument(
        skip_all,
        fields(
            phase = %request.phase,
            round = request.round,
            iteration = request.iteration,
            task_id = %request.task_id,
            timeout_secs = request.hard_timeout.as_secs(),
            idle_secs = request.idle_timeout.as_secs(),
        )
    )]
    fn run_phase(
        &self,
        request: &PhaseRequest,
        shutdown: &ShutdownToken,
        on_action: &mut dyn FnMut(&ActionRecord),
    ) -> Result<PhaseResult> {
        info!(workdir = %request.workdir.display(), "starting phase");
        let cmd = self.build_command(&request.workdir)?;

        let started = Instant::now();
        let mut clock = PhaseClock::start(started, request.hard_timeout, request.idle_timeout);
        let mut transcript = Transcript::new(request.output_limit_bytes);
        let mut actions = Vec::new();
        let mut stopped_by: Option<TerminalReason> = None;

        let run = run_command_supervised(
            cmd,
            Some(request.prompt.as_bytes()),
            request.tick,
            request.output_limit_bytes,
            |event| match event {
                SupervisorEvent::Line(line) => {
                    for action in transcript.push_line(line, Instant::now()) {
                        debug!(tool = %action.tool, "tool action");
                        clock.record_action(action.at);
                        on_action(&action);
                        actions.push(action);
                    }
                    Supervision::Continue
                }
                SupervisorEvent::Tick => {
                    if shutdown.is_cancelled() {
                        stopped_by = Some(TerminalReason::Cancelled);
                        return Supervision::Terminate;
                    }
                    match clock.check(Instant::now()) {
                        Some(Expiry::Timeout) => {
                            stopped_by = Some(TerminalReason::Timeout);
                            Supervision::Terminate
                        }
                        Some(Expiry::Idle) => {
                            stopped_by = Some(TerminalReason::Idle);
                            Supervision::Terminate
                        }
                        None => Supervision::Continue,
                    }
                }
            },
        );
        let duration = started.elapsed();

        let output = match run {
            Ok(output) => output,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "phase process failed");
                write_failure_log(&request.log_path, &err);
                return Ok(PhaseResult {
                    phase: request.phase,
                    round: request.round,
                    output: String::new(),
                    duration,
                    reason: TerminalReason::ProcessError,
                    actions,
                    exit_code: None,
                });
            }
        };

        let reason = match stopped_by {
            Some(reason) => reason,
            None if output.status.success() => TerminalReason::Completed,
            None => TerminalReason::ProcessError,
        };
        match reason {
            TerminalReason::Completed => debug!("phase completed"),
            TerminalReason::Timeout => warn!("phase exceeded hard timeout, killed"),
            TerminalReason::Idle => warn!(actions = actions.len(), "phase idle, killed"),
            TerminalReason::Cancelled => warn!("phase cancelled by shutdown request"),
            TerminalReason::ProcessError => {
                warn!(exit_code = ?output.status.code(), "phase process exited with failure")
            }
        }

        if let Err(err) = write_phase_log(&request.log_path, &output, reason, request.output_limit_bytes) {
            warn!(err = %format!("{err:#}"), "failed to write phase log");
        }

        Ok(PhaseResult {
            phase: request.phase,
            round: request.round,
            output: transcript.into_text(),
            duration,
            reason,
            actions,
            exit_code: output.status.code(),
        })
    }
}

fn write_phase_log(
    path: &Path,
    output: &CommandOutput,
    reason: TerminalReason,
    output_limit: usize,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create phase log dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stdout));
    buf.push_str(&output.stdout_truncated_notice("agent"));
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stderr));
    buf.push_str(&output.stderr_truncated_notice("agent"));
    buf.push_str(&format!(
        "\n=== terminal ===\nreason: {}\nexit_code: {}\n",
        reason.as_str(),
        output
            .status
            .code()
            .map_or_else(|| "none".to_string(), |code| code.to_string())
    ));

    if buf.len() > output_limit {
        let mut cut = output_limit;
        while !buf.is_char_boundary(cut) {
            cut -= 1;
        }
        let truncated = format!("{}\n[truncated {} bytes]\n", &buf[..cut], buf.len() - cut);
        return fs::write(path, truncated)
            .with_context(|| format!("write phase log {}", path.display()));
    }

    fs::write(path, buf).with_context(|| format!("write phase log {}", path.display()))
}

fn write_failure_log(path: &Path, err: &anyhow::Error) {
    let result = path
        .parent()
        .map_or(Ok(()), fs::create_dir_all)
        .and_then(|()| fs::write(path, format!("=== error ===\n{err:#}\n")));
    if let Err(e) = result {
        warn!(err = %e, path = %path.display(), "failed to write phase log");
    }
}
