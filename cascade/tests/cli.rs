//! CLI tests for `cascade init`, `cascade status` and `cascade run`.
//!
//! Spawns the cascade binary and verifies exit codes and printed summaries.

use std::process::Command;

use cascade::exit_codes;
use cascade::io::history::append_history;
use cascade::io::paths::CascadePaths;
use cascade::io::run_state::{RunStatus, write_status};
use cascade::test_support::iteration_result;

fn cascade(root: &std::path::Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_cascade"));
    cmd.current_dir(root).env_remove("RUST_LOG");
    cmd
}

#[test]
fn status_without_a_run_exits_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = cascade(temp.path())
        .arg("status")
        .output()
        .expect("cascade status");

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("no run status"));
}

#[test]
fn init_refuses_to_overwrite_without_force() {
    let temp = tempfile::tempdir().expect("tempdir");
    let first = cascade(temp.path()).arg("init").status().expect("init");
    assert_eq!(first.code(), Some(exit_codes::OK));
    assert!(temp.path().join(".cascade/config.toml").is_file());

    let second = cascade(temp.path()).arg("init").status().expect("init again");
    assert_eq!(second.code(), Some(exit_codes::INVALID));

    let forced = cascade(temp.path())
        .args(["init", "--force"])
        .status()
        .expect("init --force");
    assert_eq!(forced.code(), Some(exit_codes::OK));
}

#[test]
fn status_prints_live_state_and_history() {
    let temp = tempfile::tempdir().expect("tempdir");
    let paths = CascadePaths::new(temp.path());
    let mut status = RunStatus::new("20260101T000000Z", 25);
    status.iteration = 2;
    status.last_task_id = Some("1.2".to_string());
    status.breaker_window = vec![true, false];
    status.skip_list.insert("1.2".to_string(), 1);
    write_status(&paths.status_path, &mut status).expect("write status");
    append_history(&paths.history_path, &iteration_result(1, Some("1.1"), true)).expect("append");
    append_history(&paths.history_path, &iteration_result(2, Some("1.2"), false)).expect("append");

    let output = cascade(temp.path())
        .args(["status", "--history", "1"])
        .output()
        .expect("cascade status");
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("run 20260101T000000Z (running)"), "{stdout}");
    assert!(stdout.contains("iteration 2 / 25"));
    assert!(stdout.contains("breaker window: [S F]"));
    assert!(stdout.contains("skip list: 1.2=1"));
    assert!(stdout.contains("iteration 2 1.2 failed"));
    assert!(!stdout.contains("iteration 1 1.1"));

    let output = cascade(temp.path())
        .args(["status", "--json"])
        .output()
        .expect("cascade status --json");
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(value["status"]["run_id"], "20260101T000000Z");
    assert_eq!(value["history"].as_array().map(Vec::len), Some(2));
}

#[cfg(unix)]
mod run {
    use std::fs;

    use cascade::io::config::{CascadeConfig, write_config};
    use cascade::io::paths::init_layout;

    use super::*;

    fn project_with_tracker(script: &str) -> tempfile::TempDir {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_layout(temp.path(), false).expect("init");
        let tracker = temp.path().join("bd.sh");
        fs::write(&tracker, script).expect("write tracker");
        let mut config = CascadeConfig::default();
        config.tracker.command = vec!["sh".to_string(), tracker.display().to_string()];
        config.agent.command = vec!["false".to_string()];
        write_config(&paths.config_path, &config).expect("write config");
        temp
    }

    #[test]
    fn empty_ready_set_is_idle_completion() {
        let temp = project_with_tracker("echo '[]'\n");
        let output = cascade(temp.path())
            .args(["run", "--max-iterations", "3"])
            .output()
            .expect("cascade run");

        assert_eq!(output.status.code(), Some(exit_codes::OK));
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(
            stdout.contains("idle completion: 0 / 3 iterations, 0 ready task(s) remaining"),
            "{stdout}"
        );
        let status = fs::read_to_string(temp.path().join(".cascade/state/status.json"))
            .expect("status written");
        assert!(status.contains("\"finished\""));
    }

    #[test]
    fn unreachable_tracker_is_a_setup_error() {
        let temp = project_with_tracker("echo 'tracker down' >&2\nexit 1\n");
        let output = cascade(temp.path())
            .args(["run", "--json"])
            .output()
            .expect("cascade run");

        assert_eq!(output.status.code(), Some(exit_codes::INVALID));
        assert!(String::from_utf8_lossy(&output.stderr).contains("initial snapshot"));
    }
}
