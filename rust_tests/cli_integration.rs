//! CLI Integration Tests
//!
//! Runs the real binary against a throwaway project whose suite agent is a
//! shell one-liner replaying recorded NDJSON events.

use std::fs;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::time::Duration;
use tempfile::TempDir;
use wait_timeout::ChildExt;

const EVENTS: &str = r#"{"event":"started","id":"billing.tests.TotalTest.test_sum"}
{"event":"succeeded"}
{"event":"stopped","elapsed":0.01}
{"event":"started","id":"billing.tests.TotalTest.test_tax","description":"Tax <rounding>"}
{"event":"failed","kind":"AssertionError","trace":"0.2 != 0.25"}
{"event":"stopped","elapsed":0.02}
"#;

/// A project whose agent prints `EVENTS` and ignores its arguments.
fn project() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("events.ndjson"), EVENTS).unwrap();
    fs::write(
        dir.path().join("pyproject.toml"),
        r#"
[tool.runtester]
installed_components = ["billing"]
suite_command = ["sh", "-c", "cat events.ndjson", "agent"]
"#,
    )
    .unwrap();
    dir
}

/// Run the binary with a hard timeout.
fn runtester(root: &Path, args: &[&str]) -> Output {
    let mut child = Command::new(env!("CARGO_BIN_EXE_runtester"))
        .arg("--project-root")
        .arg(root)
        .args(args)
        .env_remove("RUNTESTER_COVERAGE")
        .env_remove("RUNTESTER_FORMAT")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to start runtester");

    let status = match child.wait_timeout(Duration::from_secs(30)).unwrap() {
        Some(status) => status,
        None => {
            child.kill().unwrap();
            panic!("runtester did not finish within 30s");
        }
    };

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    child.stdout.take().unwrap().read_to_end(&mut stdout).unwrap();
    child.stderr.take().unwrap().read_to_end(&mut stderr).unwrap();
    Output { status, stdout, stderr }
}

#[test]
fn test_help_lists_subcommands() {
    let output = runtester(Path::new("."), &["--help"]);
    assert!(output.status.success());
    let help = String::from_utf8_lossy(&output.stdout);
    assert!(help.contains("test"));
    assert!(help.contains("watch"));
}

#[test]
fn test_exit_status_is_failure_count() {
    let dir = project();
    let output = runtester(dir.path(), &["test", "--noinput", "billing"]);
    assert_eq!(output.status.code(), Some(1), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(!dir.path().join("testing.inprogress").exists());
}

#[test]
fn test_json_format_keeps_stdout_pure() {
    let dir = project();
    let output = runtester(dir.path(), &["test", "--noinput", "--format", "json", "billing"]);
    assert_eq!(output.status.code(), Some(1));

    let stdout = String::from_utf8(output.stdout).unwrap();
    let records: Vec<serde_json::Value> = stdout
        .lines()
        .map(|line| serde_json::from_str(line).expect("stdout must be NDJSON only"))
        .collect();
    assert_eq!(records.first().unwrap()["event"], "run_start");
    assert_eq!(records.last().unwrap()["event"], "run_finished");
    assert_eq!(records.last().unwrap()["failures"], 1);
    assert_eq!(records.iter().filter(|r| r["event"] == "started").count(), 2);
}

#[test]
fn test_xml_flag_writes_results_file() {
    let dir = project();
    let output = runtester(dir.path(), &["test", "--noinput", "--xml", "billing"]);
    assert_eq!(output.status.code(), Some(1));

    let report = fs::read_to_string(dir.path().join("temp/xml/test_output.xml")).unwrap();
    assert_eq!(report.matches("<testcase ").count(), 2);
    assert!(report.contains("desc=\"Tax &lt;rounding&gt;\""));
    assert!(report.contains("<failure type=\"AssertionError\">0.2 != 0.25</failure>"));
}

#[test]
fn test_invalid_coverage_mode_is_a_usage_error() {
    let dir = project();
    let output = runtester(dir.path(), &["test", "--coverage", "sometimes"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_crashing_agent_is_reported() {
    let dir = project();
    fs::write(
        dir.path().join("pyproject.toml"),
        r#"
[tool.runtester]
suite_command = ["sh", "-c", "echo 'no such setting' >&2; exit 4", "agent"]
"#,
    )
    .unwrap();

    let output = runtester(dir.path(), &["test", "--noinput"]);
    assert!(!output.status.success());
    assert!(!dir.path().join("testing.inprogress").exists());
}
