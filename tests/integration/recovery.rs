#[path = "common/mod.rs"]
mod common;

use std::fs;

use common::{TestDaemon, is_process_alive, shell, wait_for_process_exit};
use tempfile::tempdir;
use warden::{
    ipc::{CommandKind, Request},
    process::{ProcessSnapshot, ProcessStatus},
};

#[test]
fn crashed_daemon_leaves_records_stopped_on_restart() {
    let home = tempdir().unwrap();
    let daemon = TestDaemon::start_in(home.path(), &[]);
    daemon.register(&shell("web", "sleep 30"));
    daemon.register(&shell("idle", "sleep 30"));
    let pid = daemon
        .command(CommandKind::Start, "web")
        .unwrap()
        .state
        .pid
        .unwrap();
    daemon.crash();

    let daemon = TestDaemon::start_in(home.path(), &[]);
    let snapshots: Vec<ProcessSnapshot> = daemon
        .client()
        .call_as(&Request::new(CommandKind::List))
        .unwrap();
    assert_eq!(snapshots.len(), 2);
    for snapshot in &snapshots {
        assert_eq!(snapshot.state.status, ProcessStatus::Stopped, "{}", snapshot.spec.name);
        assert_eq!(snapshot.state.pid, None);
    }

    // The orphaned child is not adopted; on Linux it dies with the daemon.
    #[cfg(target_os = "linux")]
    wait_for_process_exit(pid);
    #[cfg(not(target_os = "linux"))]
    let _ = pid;

    let restarted = daemon.command(CommandKind::Start, "web").unwrap();
    assert_eq!(restarted.state.status, ProcessStatus::Running);
}

#[test]
fn graceful_shutdown_stops_children_and_autostart_resumes_them() {
    let home = tempdir().unwrap();
    let daemon = TestDaemon::start_in(home.path(), &[]);
    daemon.register(&shell("api", "sleep 30"));
    daemon.register(&shell("batch", "sleep 30"));
    let pid = daemon
        .command(CommandKind::Start, "api")
        .unwrap()
        .state
        .pid
        .unwrap();
    daemon.shutdown();

    wait_for_process_exit(pid);
    assert!(!home.path().join("warden.sock").exists());
    assert!(!home.path().join("wardend.pid").exists());

    let state = fs::read_to_string(home.path().join("state.json")).unwrap();
    assert!(state.contains("\"api\""));

    let daemon = TestDaemon::start_in(home.path(), &["--recovery", "autostart"]);
    let api = daemon.wait_for_status("api", ProcessStatus::Running);
    let new_pid = api.state.pid.unwrap();
    assert_ne!(new_pid, pid);
    assert!(is_process_alive(new_pid));
    assert_eq!(daemon.status("batch").state.status, ProcessStatus::Stopped);
}

#[test]
fn second_daemon_on_the_same_home_is_refused() {
    let home = tempdir().unwrap();
    let _first = TestDaemon::start_in(home.path(), &[]);

    let output = std::process::Command::new(assert_cmd::cargo::cargo_bin!("wardend"))
        .arg("--home")
        .arg(home.path())
        .env_remove("WARDEN_SOCKET")
        .output()
        .unwrap();
    assert!(!output.status.success());
}
