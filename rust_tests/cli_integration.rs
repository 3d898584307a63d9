//! End-to-end tests against the built binary in batch mode.

use std::process::{Command, Output, Stdio};
use std::time::Duration;
use wait_timeout::ChildExt;

const BIN: &str = env!("CARGO_BIN_EXE_assay");
const TIMEOUT: Duration = Duration::from_secs(30);

fn run_assay(args: &[&str]) -> Output {
    let mut child = Command::new(BIN)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn assay");
    match child.wait_timeout(TIMEOUT).expect("wait failed") {
        Some(_) => child.wait_with_output().expect("collect failed"),
        None => {
            let _ = child.kill();
            panic!("assay did not exit within {TIMEOUT:?}");
        }
    }
}

fn stdout_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

#[test]
fn all_passing_batch_run_exits_zero() {
    let output = run_assay(&["--batch", "quartz", "omega"]);
    assert_eq!(output.status.code(), Some(0));
    assert!(stdout_of(&output).contains("All 2 tests passed"));
}

#[test]
fn failures_drive_exit_code_one() {
    let output = run_assay(&["--batch", "quartz", "failing"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stdout_of(&output).contains("1 of 2 tests failed"));
}

#[test]
fn broken_import_counts_as_a_failure() {
    let output = run_assay(&["--batch", "broken_import"]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn verbose_batch_prints_test_names() {
    let output = run_assay(&["--batch", "--verbose", "quartz"]);
    assert_eq!(output.status.code(), Some(0));
    assert!(stdout_of(&output).contains("test_clock"));
}

#[test]
fn verbose_without_batch_is_usage_error() {
    let output = run_assay(&["--verbose", "quartz"]);
    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn missing_names_are_usage_errors() {
    let output = run_assay(&[]);
    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn unresolvable_argument_is_a_usage_error() {
    let output = run_assay(&["--batch", "no-such-thing!"]);
    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn reexecs_once_to_suppress_bytecode_caching() {
    let mut child = Command::new(BIN)
        .args(["--batch", "quartz"])
        .env_remove("PYTHONDONTWRITEBYTECODE")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn assay");
    let output = match child.wait_timeout(TIMEOUT).expect("wait failed") {
        Some(_) => child.wait_with_output().expect("collect failed"),
        None => {
            let _ = child.kill();
            panic!("assay did not exit after its re-exec");
        }
    };
    assert_eq!(output.status.code(), Some(0));
    assert!(stdout_of(&output).contains("All 1 tests passed"));
}
