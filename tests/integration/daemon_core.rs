#[path = "common/mod.rs"]
mod common;

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use common::{Harness, is_process_alive, shell, wait_for_process_exit};
use warden::{
    error::ErrorKind,
    ipc::{CommandKind, ControlError, RemoveArgs, Request},
    process::{ProcessSnapshot, ProcessSpec, ProcessStatus, RestartPolicy},
};

fn kind_of(err: ControlError) -> ErrorKind {
    match err {
        ControlError::Command { kind, .. } => kind,
        other => panic!("expected a daemon error, got {other}"),
    }
}

#[test]
fn registered_spec_is_returned_unchanged() {
    let harness = Harness::start();
    let mut spec = ProcessSpec::new("web", "sleep");
    spec.args = vec!["30".into()];
    spec.working_dir = Some(PathBuf::from("/tmp"));
    spec.env = BTreeMap::from([("PORT".to_string(), "8080".to_string())]);
    spec.restart_policy = RestartPolicy::Always;
    spec.max_restarts = Some(4);
    spec.restart_window = Duration::from_secs(120);
    spec.backoff.base = Duration::from_millis(250);

    let registered = harness.daemon.register(&spec);
    assert_eq!(registered.state.status, ProcessStatus::Stopped);
    assert_eq!(registered.state.pid, None);

    let status = harness.daemon.status("web");
    assert_eq!(status.spec, spec);
    assert_eq!(status.state.status, ProcessStatus::Stopped);
}

#[test]
fn unknown_names_report_not_found() {
    let harness = Harness::start();
    for kind in [
        CommandKind::Start,
        CommandKind::Stop,
        CommandKind::Restart,
        CommandKind::Status,
        CommandKind::Remove,
    ] {
        let err = harness.daemon.command(kind, "ghost").unwrap_err();
        assert_eq!(kind_of(err), ErrorKind::NotFound, "{kind}");
    }
}

#[test]
fn duplicate_registration_conflicts() {
    let harness = Harness::start();
    let spec = shell("dup", "sleep 30");
    harness.daemon.register(&spec);

    let request = Request::named(CommandKind::Register, "dup")
        .with_payload(&spec)
        .unwrap();
    let err = harness.daemon.client().call(&request).unwrap_err();
    assert_eq!(kind_of(err), ErrorKind::Conflict);
}

#[test]
fn concurrent_starts_run_one_process() {
    let harness = Arc::new(Harness::start());
    harness.daemon.register(&shell("single", "sleep 30"));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let harness = Arc::clone(&harness);
            thread::spawn(move || harness.daemon.command(CommandKind::Start, "single"))
        })
        .collect();

    let mut started = Vec::new();
    let mut rejected = 0;
    for handle in handles {
        match handle.join().unwrap() {
            Ok(snapshot) => started.push(snapshot),
            Err(err) => {
                assert_eq!(kind_of(err), ErrorKind::AlreadyRunning);
                rejected += 1;
            }
        }
    }

    assert_eq!(started.len(), 1);
    assert_eq!(rejected, 7);
    let pid = started[0].state.pid.expect("running process has a pid");
    assert!(is_process_alive(pid));
    assert_eq!(harness.daemon.status("single").state.pid, Some(pid));
}

#[test]
fn stopped_process_is_never_restarted() {
    let harness = Harness::start();
    let mut spec = shell("steady", "sleep 30");
    spec.restart_policy = RestartPolicy::Always;
    spec.backoff.base = Duration::from_millis(100);
    harness.daemon.register(&spec);

    let running = harness.daemon.command(CommandKind::Start, "steady").unwrap();
    let pid = running.state.pid.unwrap();

    let stopped = harness.daemon.command(CommandKind::Stop, "steady").unwrap();
    assert_eq!(stopped.state.status, ProcessStatus::Stopped);
    assert_eq!(stopped.state.pid, None);
    wait_for_process_exit(pid);

    thread::sleep(Duration::from_millis(800));
    let later = harness.daemon.status("steady");
    assert_eq!(later.state.status, ProcessStatus::Stopped);
    assert_eq!(later.state.pid, None);

    let err = harness.daemon.command(CommandKind::Stop, "steady").unwrap_err();
    assert_eq!(kind_of(err), ErrorKind::NotRunning);
}

#[test]
fn stop_escalates_to_sigkill_after_grace() {
    let harness = Harness::with_config("stop_grace_period: 500ms\n");
    let spec = shell("stubborn", "trap '' TERM; while true; do sleep 0.1; done");
    harness.daemon.register(&spec);
    let pid = harness
        .daemon
        .command(CommandKind::Start, "stubborn")
        .unwrap()
        .state
        .pid
        .unwrap();

    let begun = Instant::now();
    let stopped = harness.daemon.command(CommandKind::Stop, "stubborn").unwrap();
    assert!(begun.elapsed() >= Duration::from_millis(450));
    assert_eq!(stopped.state.status, ProcessStatus::Stopped);
    wait_for_process_exit(pid);
}

#[test]
fn removing_a_running_process_requires_force() {
    let harness = Harness::start();
    harness.daemon.register(&shell("busy", "sleep 30"));
    let pid = harness
        .daemon
        .command(CommandKind::Start, "busy")
        .unwrap()
        .state
        .pid
        .unwrap();

    let err = harness.daemon.command(CommandKind::Remove, "busy").unwrap_err();
    assert_eq!(kind_of(err), ErrorKind::Conflict);
    assert_eq!(harness.daemon.status("busy").state.status, ProcessStatus::Running);

    let forced = Request::named(CommandKind::Remove, "busy")
        .with_payload(&RemoveArgs { force: true })
        .unwrap();
    let removed: ProcessSnapshot = harness.daemon.client().call_as(&forced).unwrap();
    assert_eq!(removed.spec.name, "busy");
    wait_for_process_exit(pid);

    let err = harness.daemon.command(CommandKind::Status, "busy").unwrap_err();
    assert_eq!(kind_of(err), ErrorKind::NotFound);
}

#[test]
fn update_is_refused_while_running() {
    let harness = Harness::start();
    let spec = shell("svc", "sleep 30");
    harness.daemon.register(&spec);
    harness.daemon.command(CommandKind::Start, "svc").unwrap();

    let mut changed = spec.clone();
    changed.args = vec!["-c".into(), "sleep 60".into()];
    let update = Request::named(CommandKind::Update, "svc")
        .with_payload(&changed)
        .unwrap();
    let err = harness.daemon.client().call(&update).unwrap_err();
    assert_eq!(kind_of(err), ErrorKind::Conflict);

    harness.daemon.command(CommandKind::Stop, "svc").unwrap();
    let updated: ProcessSnapshot = harness.daemon.client().call_as(&update).unwrap();
    assert_eq!(updated.spec, changed);
}

#[test]
fn restart_replaces_the_child() {
    let harness = Harness::start();
    harness.daemon.register(&shell("cycle", "sleep 30"));
    let first = harness
        .daemon
        .command(CommandKind::Start, "cycle")
        .unwrap()
        .state
        .pid
        .unwrap();

    let restarted = harness.daemon.command(CommandKind::Restart, "cycle").unwrap();
    let second = restarted.state.pid.unwrap();
    assert_eq!(restarted.state.status, ProcessStatus::Running);
    assert_ne!(first, second);
    wait_for_process_exit(first);
    assert!(is_process_alive(second));
}

#[test]
fn two_processes_cannot_share_a_log_file() {
    let harness = Harness::start();
    let shared = harness.dir.path().join("shared.log");

    let mut first = shell("a", "echo from-a; sleep 30");
    first.log_path = Some(shared.clone());
    harness.daemon.register(&first);

    let mut second = shell("b", "echo from-b; sleep 30");
    second.log_path = Some(shared.clone());
    let request = Request::named(CommandKind::Register, "b")
        .with_payload(&second)
        .unwrap();
    let err = harness.daemon.client().call(&request).unwrap_err();
    assert_eq!(kind_of(err), ErrorKind::Conflict);
    assert_eq!(
        kind_of(harness.daemon.command(CommandKind::Status, "b").unwrap_err()),
        ErrorKind::NotFound
    );

    // Pointing at another process's default log is the same clash.
    let mut squatter = shell("c", "sleep 30");
    harness.daemon.register(&shell("plain", "sleep 30"));
    squatter.log_path = Some(harness.daemon.home().join("logs/plain.log"));
    let request = Request::named(CommandKind::Register, "c")
        .with_payload(&squatter)
        .unwrap();
    let err = harness.daemon.client().call(&request).unwrap_err();
    assert_eq!(kind_of(err), ErrorKind::Conflict);
}

#[test]
fn write_feeds_the_stdin_of_a_running_process() {
    let harness = Harness::start();
    let mut spec = shell("echoer", "while read line; do echo \"echo: $line\"; done");
    spec.stdin = true;
    harness.daemon.register(&spec);
    harness.daemon.command(CommandKind::Start, "echoer").unwrap();

    let request = Request::named(CommandKind::Write, "echoer")
        .with_payload(&serde_json::json!({"data": "hello\n"}))
        .unwrap();
    harness.daemon.client().call(&request).unwrap();

    let lines = common::wait_for_lines(&harness.daemon.home().join("logs/echoer.log"), 1);
    assert_eq!(lines, vec!["echo: hello"]);

    harness.daemon.command(CommandKind::Stop, "echoer").unwrap();
    let err = harness.daemon.client().call(&request).unwrap_err();
    assert_eq!(kind_of(err), ErrorKind::NotRunning);
}
