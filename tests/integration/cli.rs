#[path = "common/mod.rs"]
mod common;

use std::fs;

use assert_cmd::Command;
use common::Harness;
use predicates::prelude::*;
use tempfile::tempdir;
use warden::process::{ProcessSnapshot, ProcessStatus, RestartPolicy};

#[test]
fn register_start_status_stop_round_trip() {
    let harness = Harness::start();

    harness
        .daemon
        .warden()
        .args(["register", "web", "--restart", "always", "-e", "PORT=8080", "--"])
        .args(["sleep", "30"])
        .assert()
        .success()
        .stdout(predicate::str::contains("● web - stopped"));

    harness
        .daemon
        .warden()
        .args(["start", "web"])
        .assert()
        .success()
        .stdout(predicate::str::contains("active (running)"))
        .stdout(predicate::str::contains("Main PID:"));

    let output = harness
        .daemon
        .warden()
        .args(["--json", "status", "web"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let snapshot: ProcessSnapshot = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(snapshot.state.status, ProcessStatus::Running);
    assert_eq!(snapshot.spec.args, vec!["30".to_string()]);
    assert_eq!(snapshot.spec.restart_policy, RestartPolicy::Always);
    assert_eq!(snapshot.spec.env.get("PORT").map(String::as_str), Some("8080"));

    harness
        .daemon
        .warden()
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("NAME"))
        .stdout(predicate::str::contains("running"));

    harness
        .daemon
        .warden()
        .args(["stop", "web"])
        .assert()
        .success()
        .stdout(predicate::str::contains("● web - stopped"));
}

#[test]
fn register_from_file() {
    let harness = Harness::start();
    let file = harness.dir.path().join("worker.yaml");
    fs::write(
        &file,
        r#"name: worker
command: sh
args: ["-c", "echo hi; sleep 30"]
restart_policy: never
backoff:
  base: 500ms
"#,
    )
    .unwrap();

    harness
        .daemon
        .warden()
        .args(["--json", "register", "--file"])
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"restart_policy\": \"never\""))
        .stdout(predicate::str::contains("\"base\": \"500ms\""));
}

#[test]
fn daemon_errors_exit_with_two() {
    let harness = Harness::start();

    harness
        .daemon
        .warden()
        .args(["status", "ghost"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("not_found"));

    harness
        .daemon
        .warden()
        .args(["stop", "ghost"])
        .assert()
        .code(2);
}

#[test]
fn unreachable_daemon_exits_with_one() {
    let dir = tempdir().unwrap();
    Command::new(assert_cmd::cargo::cargo_bin!("warden"))
        .arg("--socket")
        .arg(dir.path().join("missing.sock"))
        .arg("list")
        .env_remove("WARDEN_SOCKET")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("not reachable"));
}

#[test]
fn invalid_spec_is_rejected_before_sending() {
    let dir = tempdir().unwrap();
    Command::new(assert_cmd::cargo::cargo_bin!("warden"))
        .arg("--socket")
        .arg(dir.path().join("missing.sock"))
        .args(["register", "bad/name", "true"])
        .env_remove("WARDEN_SOCKET")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("error:"));
}

#[test]
fn tail_prints_log_lines() {
    let harness = Harness::start();
    harness
        .daemon
        .warden()
        .args(["register", "echoer", "--", "sh", "-c", "echo alpha; echo beta; sleep 30"])
        .assert()
        .success();
    harness.daemon.warden().args(["start", "echoer"]).assert().success();
    common::wait_for_lines(&harness.dir.path().join("logs/echoer.log"), 2);

    harness
        .daemon
        .warden()
        .args(["tail", "echoer", "-n", "1"])
        .assert()
        .success()
        .stdout("beta\n");
}

#[test]
fn register_file_loads_a_whole_directory() {
    let harness = Harness::start();
    let specs = harness.dir.path().join("specs");
    fs::create_dir_all(specs.join("workers")).unwrap();
    fs::write(
        specs.join("api.yaml"),
        "- name: api-1\n  command: sleep\n  args: [\"30\"]\n- name: api-2\n  command: sleep\n  args: [\"30\"]\n",
    )
    .unwrap();
    fs::write(
        specs.join("workers/queue.yml"),
        "name: queue\ncommand: sleep\nargs: [\"30\"]\n",
    )
    .unwrap();

    harness
        .daemon
        .warden()
        .args(["register", "--file"])
        .arg(&specs)
        .assert()
        .success()
        .stdout(predicate::str::contains("● api-1 - stopped"))
        .stdout(predicate::str::contains("● queue - stopped"));

    // Re-registering keeps going past each conflict and reports them all.
    harness
        .daemon
        .warden()
        .args(["register", "--file"])
        .arg(&specs)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("api-1"))
        .stderr(predicate::str::contains("queue"));

    harness.daemon.warden().args(["start", "api-2"]).assert().success();

    let output = harness
        .daemon
        .warden()
        .args(["--json", "list", "^api-"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let listed: Vec<ProcessSnapshot> = serde_json::from_slice(&output.stdout).unwrap();
    let names: Vec<_> = listed.iter().map(|s| s.spec.name.as_str()).collect();
    assert_eq!(names, vec!["api-1", "api-2"]);

    let output = harness
        .daemon
        .warden()
        .args(["--json", "list", "--status", "running"])
        .output()
        .unwrap();
    let listed: Vec<ProcessSnapshot> = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].spec.name, "api-2");

    harness
        .daemon
        .warden()
        .args(["list", "("])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("bad_request"));
}

#[test]
fn write_sends_a_line_to_stdin() {
    let harness = Harness::start();
    harness
        .daemon
        .warden()
        .args(["register", "--stdin", "repl", "--", "sh", "-c"])
        .arg("while read line; do echo \"> $line\"; done")
        .assert()
        .success();
    harness.daemon.warden().args(["start", "repl"]).assert().success();

    harness
        .daemon
        .warden()
        .args(["write", "repl", "status please"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote 14 byte(s) to 'repl'"));

    let lines = common::wait_for_lines(&harness.dir.path().join("logs/repl.log"), 1);
    assert_eq!(lines, vec!["> status please"]);
}

#[test]
fn zero_timeout_is_a_usage_error() {
    let harness = Harness::start();
    harness
        .daemon
        .warden()
        .args(["--timeout", "0s", "list"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("greater than zero"));
}
