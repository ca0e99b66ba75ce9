//! Helpers for running child processes under supervision with bounded output.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Shortest supervision interval honoured; smaller values are raised to it.
const MIN_TICK: Duration = Duration::from_millis(10);
/// Default interval for [`run_command_with_timeout`].
const DEFAULT_TICK: Duration = Duration::from_millis(100);
/// How long to wait for stderr to drain once the child is gone. Grandchildren
/// that inherited the pipe can keep it open indefinitely.
const STDERR_GRACE: Duration = Duration::from_secs(2);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    /// The supervisor killed the child before it exited on its own.
    pub terminated: bool,
}

impl CommandOutput {
    pub fn stdout_truncated_notice(&self, label: &str) -> String {
        if self.stdout_truncated > 0 {
            format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            )
        } else {
            String::new()
        }
    }

    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        if self.stderr_truncated > 0 {
            format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            )
        } else {
            String::new()
        }
    }
}

/// What the supervisor observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorEvent<'a> {
    /// One stdout line, without its terminator.
    Line(&'a str),
    /// At least one tick interval passed since the previous tick.
    Tick,
}

/// Supervisor's answer to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Supervision {
    Continue,
    Terminate,
}

/// Run a command, streaming stdout lines to `on_event` and ticking at least
/// every `tick` so the caller can enforce deadlines.
///
/// Returning [`Supervision::Terminate`] kills the child. Ticks are delivered
/// from spawn onward, even while stdin is still being written or output flows
/// continuously. `output_limit_bytes` bounds stored stdout and stderr and the
/// length of a single line; bytes beyond it are discarded while the pipes
/// drain.
///
/// On unix the child leads its own process group, and the whole group is
/// killed once the child is done, so nothing it spawned outlives it.
#[instrument(skip_all, fields(tick_ms = tick.as_millis() as u64, output_limit_bytes = output_limit_bytes))]
pub fn run_command_supervised<F>(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    tick: Duration,
    output_limit_bytes: usize,
    mut on_event: F,
) -> Result<CommandOutput>
where
    F: FnMut(SupervisorEvent<'_>) -> Supervision,
{
    let tick = tick.max(MIN_TICK);
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (line_tx, line_rx) = mpsc::channel::<CappedLine>();
    let line_cap = output_limit_bytes.max(1);
    thread::spawn(move || forward_lines(stdout, line_cap, line_tx));
    let (stderr_tx, stderr_rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = stderr_tx.send(read_stream_limited(stderr, output_limit_bytes));
    });

    if let Some(input) = stdin {
        let Some(mut child_stdin) = child.stdin.take() else {
            kill_and_reap(&mut child)?;
            return Err(anyhow!("stdin was not piped"));
        };
        let input = input.to_vec();
        thread::spawn(move || {
            // A child that exits without reading its input is not an error
            // here; its exit status tells the caller what happened.
            if let Err(e) = child_stdin.write_all(&input) {
                debug!(err = %e, "child stdin closed before the prompt was written");
            }
        });
    }

    let mut collected = Vec::new();
    let mut stdout_truncated = 0usize;
    let mut terminated = false;
    let mut last_tick = Instant::now();

    loop {
        match line_rx.recv_timeout(tick) {
            Ok(CappedLine { mut line, dropped }) => {
                let len = line.len();
                let remaining = output_limit_bytes.saturating_sub(collected.len());
                let keep = len.min(remaining);
                collected.extend_from_slice(&line[..keep]);
                stdout_truncated += len - keep + dropped;

                while matches!(line.last(), Some(b'\n' | b'\r')) {
                    line.pop();
                }
                let text = String::from_utf8_lossy(&line);
                if on_event(SupervisorEvent::Line(&text)) == Supervision::Terminate {
                    terminated = true;
                    break;
                }
                if last_tick.elapsed() >= tick {
                    last_tick = Instant::now();
                    if on_event(SupervisorEvent::Tick) == Supervision::Terminate {
                        terminated = true;
                        break;
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                last_tick = Instant::now();
                if on_event(SupervisorEvent::Tick) == Supervision::Terminate {
                    terminated = true;
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let status = if terminated {
        kill_and_reap(&mut child)?
    } else {
        // stdout closed; the child may still be running.
        loop {
            if let Some(status) = child.wait_timeout(tick).context("wait for command")? {
                // The group id stays reserved while any member is alive, so
                // this reaches leftovers of the reaped child and nothing else.
                kill_process_group(&child);
                break status;
            }
            if on_event(SupervisorEvent::Tick) == Supervision::Terminate {
                terminated = true;
                break kill_and_reap(&mut child)?;
            }
        }
    };

    let (stderr, stderr_truncated) = match stderr_rx.recv_timeout(STDERR_GRACE) {
        Ok(result) => result.context("read stderr")?,
        Err(_) => {
            warn!("stderr still open after child exit; dropping it");
            (Vec::new(), 0)
        }
    };

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), terminated, "command finished");
    Ok(CommandOutput {
        status,
        stdout: collected,
        stderr,
        stdout_truncated,
        stderr_truncated,
        terminated,
    })
}

/// Run a command with a wall-clock timeout and capture its output.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes = output_limit_bytes))]
pub fn run_command_with_timeout(
    cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    let started = Instant::now();
    let output = run_command_supervised(
        cmd,
        stdin,
        DEFAULT_TICK.min(timeout),
        output_limit_bytes,
        |event| match event {
            SupervisorEvent::Tick if started.elapsed() >= timeout => Supervision::Terminate,
            _ => Supervision::Continue,
        },
    )?;
    if output.terminated {
        warn!(timeout_secs = timeout.as_secs(), "command timed out, killed");
    }
    Ok(output)
}

fn kill_and_reap(child: &mut Child) -> Result<ExitStatus> {
    kill_process_group(child);
    if let Err(e) = child.kill() {
        // Already exited between the last poll and the kill.
        debug!(err = %e, "kill failed");
    }
    child.wait().context("wait command after kill")
}

/// SIGKILL every process in the child's group.
#[cfg(unix)]
fn kill_process_group(child: &Child) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(pgid) = i32::try_from(child.id()) else {
        return;
    };
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => debug!(err = %e, pgid, "kill process group failed"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}

/// One stdout line cut to the line cap, with the count of bytes cut off.
struct CappedLine {
    line: Vec<u8>,
    dropped: usize,
}

fn forward_lines<R: Read>(reader: R, cap: usize, tx: mpsc::Sender<CappedLine>) {
    let mut reader = BufReader::new(reader);
    loop {
        match read_capped_line(&mut reader, cap) {
            Ok(None) => break,
            Ok(Some(line)) => {
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(err = %e, "failed to read child stdout");
                break;
            }
        }
    }
}

/// Read through the next `\n`, keeping at most `cap` bytes of it.
fn read_capped_line<R: BufRead>(
    reader: &mut R,
    cap: usize,
) -> std::io::Result<Option<CappedLine>> {
    let mut line = Vec::new();
    let mut dropped = 0usize;
    let mut read_any = false;
    loop {
        let buf = match reader.fill_buf() {
            Ok(buf) => buf,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if buf.is_empty() {
            break;
        }
        read_any = true;
        let (chunk, done) = match buf.iter().position(|b| *b == b'\n') {
            Some(pos) => (&buf[..=pos], true),
            None => (buf, false),
        };
        let keep = chunk.len().min(cap.saturating_sub(line.len()));
        line.extend_from_slice(&chunk[..keep]);
        dropped += chunk.len() - keep;
        let used = chunk.len();
        reader.consume(used);
        if done {
            break;
        }
    }
    Ok(read_any.then_some(CappedLine { line, dropped }))
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    /// Every stdout line reaches the callback, in order, without terminators.
    #[test]
    fn streams_lines_in_order() {
        let mut lines = Vec::new();
        let output = run_command_supervised(
            sh("printf 'one\\ntwo\\nthree'"),
            None,
            Duration::from_millis(50),
            1024,
            |event| {
                if let SupervisorEvent::Line(line) = event {
                    lines.push(line.to_string());
                }
                Supervision::Continue
            },
        )
        .expect("run");
        assert!(output.status.success());
        assert!(!output.terminated);
        assert_eq!(lines, vec!["one", "two", "three"]);
        assert_eq!(output.stdout, b"one\ntwo\nthree");
    }

    /// Terminating from a tick kills a child that would otherwise sleep.
    #[test]
    fn terminate_kills_child() {
        let started = Instant::now();
        let output = run_command_supervised(
            sh("sleep 5"),
            None,
            Duration::from_millis(20),
            1024,
            |event| match event {
                SupervisorEvent::Tick if started.elapsed() > Duration::from_millis(100) => {
                    Supervision::Terminate
                }
                _ => Supervision::Continue,
            },
        )
        .expect("run");
        assert!(output.terminated);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    /// Stdin is delivered and stderr is captured separately.
    #[test]
    fn passes_stdin_and_captures_stderr() {
        let output = run_command_with_timeout(
            sh("cat; echo oops >&2"),
            Some(b"hello\n"),
            Duration::from_secs(5),
            1024,
        )
        .expect("run");
        assert_eq!(output.stdout, b"hello\n");
        assert_eq!(String::from_utf8_lossy(&output.stderr).trim(), "oops");
    }

    /// Output beyond the limit is counted, not stored.
    #[test]
    fn truncates_stdout_beyond_limit() {
        let output = run_command_with_timeout(
            sh("printf 'abcdefghij\\n'"),
            None,
            Duration::from_secs(5),
            4,
        )
        .expect("run");
        assert_eq!(output.stdout, b"abcd");
        assert_eq!(output.stdout_truncated, 7);
        assert!(output.stdout_truncated_notice("agent").contains("7 bytes"));
    }

    /// A child that never reads its stdin cannot hold the deadline off.
    #[test]
    fn undrained_stdin_does_not_delay_the_deadline() {
        let input = vec![b'x'; 1 << 20];
        let started = Instant::now();
        let output = run_command_with_timeout(
            sh("sleep 5"),
            Some(&input),
            Duration::from_millis(200),
            1024,
        )
        .expect("run");
        assert!(output.terminated);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    /// One line far beyond the limit is delivered cut, and counted.
    #[test]
    fn long_line_is_cut_to_the_limit() {
        let mut lines = Vec::new();
        let output = run_command_supervised(
            sh("head -c 200000 /dev/zero | tr '\\0' a; echo; echo done"),
            None,
            Duration::from_millis(50),
            1024,
            |event| {
                if let SupervisorEvent::Line(line) = event {
                    lines.push(line.len());
                }
                Supervision::Continue
            },
        )
        .expect("run");
        assert_eq!(lines, vec![1024, 4]);
        assert_eq!(output.stdout.len(), 1024);
        assert_eq!(output.stdout_truncated, 200_000 - 1024 + 1 + 5);
    }

    #[test]
    fn timeout_kills_slow_command() {
        let output =
            run_command_with_timeout(sh("sleep 5"), None, Duration::from_millis(150), 1024)
                .expect("run");
        assert!(output.terminated);
        assert!(!output.status.success());
    }

    #[cfg(target_os = "linux")]
    mod process_group {
        use super::*;

        /// Live and not a zombie waiting for its reaper.
        fn running(pid: &str) -> bool {
            std::fs::read_to_string(format!("/proc/{pid}/stat")).is_ok_and(|stat| {
                stat.rsplit(')')
                    .next()
                    .is_some_and(|rest| !rest.trim_start().starts_with('Z'))
            })
        }

        fn gone_soon(pid: &str) -> bool {
            let deadline = Instant::now() + Duration::from_secs(2);
            while Instant::now() < deadline {
                if !running(pid) {
                    return true;
                }
                thread::sleep(Duration::from_millis(20));
            }
            false
        }

        #[test]
        fn terminate_takes_down_background_children() {
            let mut pid = String::new();
            let started = Instant::now();
            let output = run_command_supervised(
                sh("sleep 30 & echo $!; wait"),
                None,
                Duration::from_millis(20),
                1024,
                |event| match event {
                    SupervisorEvent::Line(line) => {
                        pid = line.trim().to_string();
                        Supervision::Continue
                    }
                    SupervisorEvent::Tick if started.elapsed() > Duration::from_millis(200) => {
                        Supervision::Terminate
                    }
                    SupervisorEvent::Tick => Supervision::Continue,
                },
            )
            .expect("run");
            assert!(output.terminated);
            assert!(!pid.is_empty());
            assert!(gone_soon(&pid), "background child {pid} survived");
        }

        /// Children that let go of the pipes are swept when the child exits.
        #[test]
        fn clean_exit_sweeps_detached_children() {
            let mut pid = String::new();
            let output = run_command_supervised(
                sh("sleep 30 >/dev/null 2>&1 & echo $!"),
                None,
                Duration::from_millis(20),
                1024,
                |event| {
                    if let SupervisorEvent::Line(line) = event {
                        pid = line.trim().to_string();
                    }
                    Supervision::Continue
                },
            )
            .expect("run");
            assert!(output.status.success());
            assert!(!output.terminated);
            assert!(gone_soon(&pid), "detached child {pid} survived");
        }
    }
}
