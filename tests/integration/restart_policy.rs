#[path = "common/mod.rs"]
mod common;

use std::{
    thread,
    time::{Duration, Instant},
};

use common::{Harness, shell, wait_for_lines};
use warden::{
    ipc::CommandKind,
    process::{ProcessStatus, RestartPolicy},
};

#[test]
fn crashing_process_backs_off_exponentially() {
    let harness = Harness::start();
    let mut spec = shell("crashy", "exit 1");
    spec.restart_policy = RestartPolicy::OnFailure;
    spec.backoff.base = Duration::from_secs(1);
    spec.backoff.max = Duration::from_secs(30);
    spec.backoff.multiplier = 2.0;
    harness.daemon.register(&spec);
    harness.daemon.command(CommandKind::Start, "crashy").unwrap();

    // Record when each restart count first shows up.
    let mut seen: Vec<(u32, Instant)> = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(12);
    while seen.len() < 3 && Instant::now() < deadline {
        let snapshot = harness.daemon.status("crashy");
        let count = snapshot.state.restart_count;
        if count > 0 && seen.last().map(|(last, _)| *last) != Some(count) {
            assert_eq!(count, seen.len() as u32 + 1, "restart counts are consecutive");
            assert_eq!(snapshot.state.last_exit_code, Some(1));
            seen.push((count, Instant::now()));
        }
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(seen.len(), 3, "expected three restarts, saw {seen:?}");

    let first_gap = seen[1].1 - seen[0].1;
    let second_gap = seen[2].1 - seen[1].1;
    assert!(first_gap >= Duration::from_millis(900), "first gap {first_gap:?}");
    assert!(first_gap < Duration::from_millis(1900), "first gap {first_gap:?}");
    assert!(second_gap >= Duration::from_millis(1900), "second gap {second_gap:?}");
    assert!(second_gap < Duration::from_millis(3500), "second gap {second_gap:?}");
}

#[test]
fn restart_limit_marks_process_failed() {
    let harness = Harness::start();
    let mut spec = shell("limited", "exit 4");
    spec.restart_policy = RestartPolicy::Always;
    spec.backoff.base = Duration::from_millis(50);
    spec.backoff.max = Duration::from_millis(100);
    spec.max_restarts = Some(2);
    spec.restart_window = Duration::from_secs(60);
    harness.daemon.register(&spec);
    harness.daemon.command(CommandKind::Start, "limited").unwrap();

    let failed = harness.daemon.wait_for_status("limited", ProcessStatus::Failed);
    assert_eq!(failed.state.restart_count, 2);
    assert_eq!(failed.state.pid, None);
    assert_eq!(failed.state.last_exit_code, Some(4));
    let error = failed.state.last_error.unwrap();
    assert!(error.contains("restart limit"), "{error}");
}

#[test]
fn never_policy_settles_by_exit_code() {
    let harness = Harness::start();

    let mut clean = shell("clean", "exit 0");
    clean.restart_policy = RestartPolicy::Never;
    harness.daemon.register(&clean);

    let mut broken = shell("broken", "exit 3");
    broken.restart_policy = RestartPolicy::Never;
    harness.daemon.register(&broken);

    harness.daemon.command(CommandKind::Start, "clean").unwrap();
    harness.daemon.command(CommandKind::Start, "broken").unwrap();

    let clean = harness.daemon.wait_for("clean", "settled", |snapshot| {
        snapshot.state.last_exit_code.is_some() && snapshot.state.pid.is_none()
    });
    assert_eq!(clean.state.status, ProcessStatus::Stopped);
    assert_eq!(clean.state.restart_count, 0);

    let broken = harness.daemon.wait_for_status("broken", ProcessStatus::Failed);
    assert_eq!(broken.state.last_exit_code, Some(3));
    assert_eq!(broken.state.restart_count, 0);
}

#[test]
fn on_failure_leaves_clean_exits_stopped() {
    let harness = Harness::start();
    let mut spec = shell("oneshot", "exit 0");
    spec.restart_policy = RestartPolicy::OnFailure;
    harness.daemon.register(&spec);
    harness.daemon.command(CommandKind::Start, "oneshot").unwrap();

    let settled = harness.daemon.wait_for("oneshot", "exited", |snapshot| {
        snapshot.state.last_exit_code == Some(0) && snapshot.state.pid.is_none()
    });
    assert_eq!(settled.state.status, ProcessStatus::Stopped);

    thread::sleep(Duration::from_millis(500));
    assert_eq!(harness.daemon.status("oneshot").state.restart_count, 0);
}

#[test]
fn always_policy_restarts_clean_exits() {
    let harness = Harness::start();
    let marker = harness.dir.path().join("runs.txt");
    let mut spec = shell("ticker", &format!("echo run >> {}", marker.display()));
    spec.restart_policy = RestartPolicy::Always;
    spec.backoff.base = Duration::from_millis(50);
    spec.backoff.max = Duration::from_millis(50);
    harness.daemon.register(&spec);
    harness.daemon.command(CommandKind::Start, "ticker").unwrap();

    let runs = wait_for_lines(&marker, 3);
    assert!(runs.iter().all(|line| line == "run"));
    harness.daemon.command(CommandKind::Stop, "ticker").unwrap();
    assert_eq!(harness.daemon.status("ticker").state.status, ProcessStatus::Stopped);
}

#[test]
fn stop_during_backoff_cancels_the_restart() {
    let harness = Harness::start();
    let mut spec = shell("waiting", "exit 1");
    spec.backoff.base = Duration::from_secs(5);
    harness.daemon.register(&spec);
    harness.daemon.command(CommandKind::Start, "waiting").unwrap();
    harness.daemon.wait_for_status("waiting", ProcessStatus::Backoff);

    let begun = Instant::now();
    let stopped = harness.daemon.command(CommandKind::Stop, "waiting").unwrap();
    assert!(begun.elapsed() < Duration::from_secs(2));
    assert_eq!(stopped.state.status, ProcessStatus::Stopped);

    thread::sleep(Duration::from_millis(500));
    let later = harness.daemon.status("waiting");
    assert_eq!(later.state.status, ProcessStatus::Stopped);
    assert_eq!(later.state.restart_count, 1);
}

#[test]
fn stable_run_clears_the_restart_count() {
    let harness = Harness::with_config("stability_threshold: 500ms\n");
    let counter = harness.dir.path().join("attempts");
    let mut spec = shell(
        "flaky",
        &format!(
            "n=$(cat {0} 2>/dev/null || echo 0); n=$((n+1)); echo $n > {0}; \
             [ $n -le 2 ] && exit 1; exec sleep 30",
            counter.display()
        ),
    );
    spec.restart_policy = RestartPolicy::Always;
    spec.backoff.base = Duration::from_millis(50);
    spec.backoff.max = Duration::from_millis(50);
    harness.daemon.register(&spec);
    harness.daemon.command(CommandKind::Start, "flaky").unwrap();

    // A running child that last exited with 1 has been restarted; its count must not stick.
    let settled = harness.daemon.wait_for("flaky", "stable", |snapshot| {
        snapshot.state.status == ProcessStatus::Running
            && snapshot.state.restart_count == 0
            && snapshot.state.last_exit_code == Some(1)
    });
    assert!(settled.state.pid.is_some());
    assert_eq!(wait_for_lines(&counter, 1), vec!["3"]);

    harness.daemon.command(CommandKind::Stop, "flaky").unwrap();
    assert_eq!(harness.daemon.status("flaky").state.restart_count, 0);
}
