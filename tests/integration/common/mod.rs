#![allow(dead_code)]

use std::{
    fs,
    path::{Path, PathBuf},
    process::{Child, Command as StdCommand, Stdio},
    thread,
    time::{Duration, Instant},
};

use sysinfo::{Pid, ProcessesToUpdate, System};
use tempfile::TempDir;
use warden::{
    ipc::{Client, CommandKind, ControlError, Request},
    process::{ProcessSnapshot, ProcessSpec, ProcessStatus},
};

pub const WAIT: Duration = Duration::from_secs(10);

/// A `wardend` child rooted at a private directory.
pub struct TestDaemon {
    home: PathBuf,
    child: Option<Child>,
}

impl TestDaemon {
    /// Starts a daemon under `home` with any extra flags and waits for its socket.
    pub fn start_in(home: &Path, extra: &[&str]) -> Self {
        let child = StdCommand::new(assert_cmd::cargo::cargo_bin!("wardend"))
            .arg("--home")
            .arg(home)
            .args(extra)
            .env_remove("WARDEN_SOCKET")
            .env_remove("WARDEN_HOME")
            .env("RUST_LOG", "warn")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn wardend");

        let daemon = Self {
            home: home.to_path_buf(),
            child: Some(child),
        };
        daemon.wait_until_ready();
        daemon
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn socket(&self) -> PathBuf {
        self.home.join("warden.sock")
    }

    pub fn pid(&self) -> u32 {
        self.child.as_ref().map(Child::id).unwrap_or_default()
    }

    pub fn client(&self) -> Client {
        Client::new(self.socket(), Duration::from_secs(30))
    }

    /// The `warden` binary pointed at this daemon.
    pub fn warden(&self) -> assert_cmd::Command {
        let mut cmd = assert_cmd::Command::new(assert_cmd::cargo::cargo_bin!("warden"));
        cmd.arg("--socket")
            .arg(self.socket())
            .arg("--no-color")
            .env_remove("WARDEN_SOCKET");
        cmd
    }

    fn wait_until_ready(&self) {
        let deadline = Instant::now() + WAIT;
        let client = Client::new(self.socket(), Duration::from_secs(1));
        while Instant::now() < deadline {
            if client.call(&Request::new(CommandKind::List)).is_ok() {
                return;
            }
            thread::sleep(Duration::from_millis(50));
        }
        panic!("wardend did not come up at {:?}", self.socket());
    }

    pub fn register(&self, spec: &ProcessSpec) -> ProcessSnapshot {
        let request = Request::named(CommandKind::Register, spec.name.clone())
            .with_payload(spec)
            .expect("encode spec");
        self.client().call_as(&request).expect("register")
    }

    pub fn command(&self, kind: CommandKind, name: &str) -> Result<ProcessSnapshot, ControlError> {
        self.client().call_as(&Request::named(kind, name))
    }

    pub fn status(&self, name: &str) -> ProcessSnapshot {
        self.command(CommandKind::Status, name).expect("status")
    }

    /// Polls `status` until `check` holds, returning the matching snapshot.
    pub fn wait_for(
        &self,
        name: &str,
        what: &str,
        check: impl Fn(&ProcessSnapshot) -> bool,
    ) -> ProcessSnapshot {
        let deadline = Instant::now() + WAIT;
        loop {
            let snapshot = self.status(name);
            if check(&snapshot) {
                return snapshot;
            }
            if Instant::now() >= deadline {
                panic!("Timed out waiting for '{name}' to become {what}: {snapshot:?}");
            }
            thread::sleep(Duration::from_millis(25));
        }
    }

    pub fn wait_for_status(&self, name: &str, status: ProcessStatus) -> ProcessSnapshot {
        self.wait_for(name, status.as_ref(), |snapshot| snapshot.state.status == status)
    }

    /// Graceful shutdown through the command channel.
    pub fn shutdown(mut self) {
        self.stop_gracefully();
    }

    /// Kills the daemon without letting it clean up.
    pub fn crash(mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    fn stop_gracefully(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        let _ = self.client().call(&Request::new(CommandKind::Shutdown));

        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if let Ok(Some(_)) = child.try_wait() {
                return;
            }
            thread::sleep(Duration::from_millis(50));
        }
        let _ = child.kill();
        let _ = child.wait();
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        self.stop_gracefully();
    }
}

/// A daemon together with the temporary directory it owns.
pub struct Harness {
    pub daemon: TestDaemon,
    pub dir: TempDir,
}

impl Harness {
    pub fn start() -> Self {
        Self::start_with(&[])
    }

    pub fn start_with(extra: &[&str]) -> Self {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let daemon = TestDaemon::start_in(dir.path(), extra);
        Self { daemon, dir }
    }

    /// Starts a daemon whose `wardend.yaml` holds `config`.
    pub fn with_config(config: &str) -> Self {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        fs::write(dir.path().join("wardend.yaml"), config).expect("failed to write config");
        let daemon = TestDaemon::start_in(dir.path(), &[]);
        Self { daemon, dir }
    }
}

/// A spec for `sh -c <script>`.
pub fn shell(name: &str, script: &str) -> ProcessSpec {
    let mut spec = ProcessSpec::new(name, "sh");
    spec.args = vec!["-c".into(), script.into()];
    spec
}

pub fn wait_for_lines(path: &Path, expected: usize) -> Vec<String> {
    let deadline = Instant::now() + WAIT;
    loop {
        if let Ok(content) = fs::read_to_string(path) {
            let lines: Vec<_> = content.lines().map(|line| line.to_string()).collect();
            if lines.len() >= expected {
                return lines;
            }
        }

        if Instant::now() >= deadline {
            panic!("Timed out waiting for {expected} lines in {:?}", path);
        }

        thread::sleep(Duration::from_millis(50));
    }
}

pub fn is_process_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system
        .process(Pid::from_u32(pid))
        .is_some_and(|process| process.status() != sysinfo::ProcessStatus::Zombie)
}

pub fn wait_for_process_exit(pid: u32) {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if !is_process_alive(pid) {
            return;
        }
        thread::sleep(Duration::from_millis(50));
    }
    panic!("Timed out waiting for PID {pid} to exit");
}
