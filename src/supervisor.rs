//! Per-process supervisor loop: spawn, liveness watch and restart policy.
use std::{
    collections::VecDeque,
    io::{self, Write},
    os::unix::process::{CommandExt, ExitStatusExt},
    path::{Path, PathBuf},
    process::{Child, ChildStdin, Command, ExitStatus, Stdio},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, mpsc},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use chrono::Utc;
use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use tracing::{debug, error, info, warn};

use crate::{
    error::ProcessManagerError,
    logs,
    process::{
        ExitOutcome, ProcessSpec, ProcessState, ProcessStatus, RestartDecision,
        decide_restart, describe_outcome,
    },
    store::RecordStore,
};

/// Daemon-wide settings shared by every loop.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    /// Directory for logs of specs without an explicit `log_path`.
    pub log_dir: PathBuf,
    /// How long an explicit stop waits after SIGTERM before sending SIGKILL.
    pub stop_grace_period: Duration,
    /// A run that stays up this long resets `restart_count`.
    pub stability_threshold: Duration,
}

#[derive(Debug, Default)]
struct ControlState {
    /// Pid of the live child; cleared before the child is reaped.
    pid: Option<u32>,
    /// Set once the current run's child has exited.
    run_exited: bool,
    stop_requested: bool,
    finished: bool,
}

#[derive(Debug, Default)]
struct LoopControl {
    state: Mutex<ControlState>,
    changed: Condvar,
    /// Write end of the current child's stdin, for specs with `stdin: true`.
    stdin: Mutex<Option<ChildStdin>>,
}

impl LoopControl {
    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self) {
        let mut state = self.lock();
        state.pid = None;
        state.finished = true;
        self.changed.notify_all();
    }

    fn stdin(&self) -> MutexGuard<'_, Option<ChildStdin>> {
        self.stdin.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared handle on the stdin pipe of a supervised process.
///
/// Cloned out of the [`LoopHandle`] so a blocked write never holds the daemon's loop table.
#[derive(Debug, Clone)]
pub struct StdinPipe {
    name: String,
    control: Arc<LoopControl>,
}

impl StdinPipe {
    /// Writes `data` to the live child's stdin and returns the number of bytes written.
    pub fn write(&self, data: &[u8]) -> Result<usize, ProcessManagerError> {
        let mut stdin = self.control.stdin();
        let Some(pipe) = stdin.as_mut() else {
            return Err(ProcessManagerError::NotRunning(self.name.clone()));
        };

        if let Err(source) = pipe.write_all(data).and_then(|_| pipe.flush()) {
            // The child closed its end; later writes would fail the same way.
            *stdin = None;
            return Err(ProcessManagerError::WriteError {
                name: self.name.clone(),
                source,
            });
        }
        Ok(data.len())
    }
}

/// Handle the daemon keeps for a running loop.
#[derive(Debug)]
pub struct LoopHandle {
    name: String,
    control: Arc<LoopControl>,
    thread: Option<JoinHandle<()>>,
}

/// Starts a loop for `spec` and blocks until its first spawn has succeeded or failed.
///
/// A failed first spawn leaves the record `failed` and is returned as
/// [`ProcessManagerError::SpawnFailure`]; the loop thread has already exited.
pub fn launch(
    spec: ProcessSpec,
    store: Arc<RecordStore>,
    settings: LoopSettings,
) -> Result<LoopHandle, ProcessManagerError> {
    let name = spec.name.clone();
    let control = Arc::new(LoopControl::default());
    let (ready_tx, ready_rx) = mpsc::channel();

    let worker = Worker {
        spec,
        store,
        settings,
        control: Arc::clone(&control),
    };
    let thread = thread::Builder::new()
        .name(format!("warden-{name}"))
        .spawn(move || worker.run(ready_tx))
        .map_err(|source| ProcessManagerError::SpawnFailure {
            name: name.clone(),
            source,
        })?;

    let mut handle = LoopHandle {
        name: name.clone(),
        control,
        thread: Some(thread),
    };

    match ready_rx.recv() {
        Ok(Ok(pid)) => {
            info!("Process '{name}' started with PID {pid}");
            Ok(handle)
        }
        Ok(Err(err)) => {
            handle.join();
            Err(err)
        }
        Err(recv_err) => {
            handle.join();
            Err(ProcessManagerError::SpawnFailure {
                name,
                source: io::Error::new(
                    io::ErrorKind::Interrupted,
                    format!("supervisor loop failed to report launch status: {recv_err}"),
                ),
            })
        }
    }
}

impl LoopHandle {
    /// Pid of the child currently owned by the loop, if any.
    pub fn pid(&self) -> Option<u32> {
        self.control.lock().pid
    }

    /// True once the loop has settled its record and exited.
    pub fn is_finished(&self) -> bool {
        self.control.lock().finished
    }

    pub fn stdin(&self) -> StdinPipe {
        StdinPipe {
            name: self.name.clone(),
            control: Arc::clone(&self.control),
        }
    }

    /// Stops the loop: SIGTERM to the child's group, SIGKILL after `grace`.
    ///
    /// A pending backoff is cancelled. Returns once the record is settled and the
    /// loop thread has been joined.
    pub fn stop(&mut self, store: &RecordStore, grace: Duration) -> Result<(), ProcessManagerError> {
        {
            let mut control = self.control.lock();
            control.stop_requested = true;
            self.control.changed.notify_all();

            if let Some(pid) = control.pid {
                if let Err(err) = store.transition(&self.name, ProcessStatus::Stopping, |_| {}) {
                    warn!("Failed to record stopping state for '{}': {err}", self.name);
                }
                debug!("Stopping process '{}' (PID {pid})", self.name);
                signal_process_tree(pid, Signal::SIGTERM, &self.name)?;
            }
        }

        if !self.wait_finished(Some(grace)) {
            warn!(
                "Process '{}' did not exit within {:?} of SIGTERM; sending SIGKILL",
                self.name, grace
            );
            let control = self.control.lock();
            if let Some(pid) = control.pid {
                signal_process_tree(pid, Signal::SIGKILL, &self.name)?;
            }
            drop(control);
            self.wait_finished(None);
        }

        self.join();
        Ok(())
    }

    /// Waits for the loop to finish; `None` waits without a deadline.
    fn wait_finished(&self, timeout: Option<Duration>) -> bool {
        let control = self.control.lock();
        let control = match timeout {
            Some(timeout) => {
                self.control
                    .changed
                    .wait_timeout_while(control, timeout, |state| !state.finished)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            None => self
                .control
                .changed
                .wait_while(control, |state| !state.finished)
                .unwrap_or_else(PoisonError::into_inner),
        };
        control.finished
    }

    /// Joins the loop thread once it has finished.
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            error!("Supervisor loop for '{}' panicked", self.name);
        }
    }
}

struct Worker {
    spec: ProcessSpec,
    store: Arc<RecordStore>,
    settings: LoopSettings,
    control: Arc<LoopControl>,
}

type ReadySender = mpsc::Sender<Result<u32, ProcessManagerError>>;

impl Worker {
    fn run(self, ready: ReadySender) {
        let name = self.spec.name.clone();
        let mut ready = Some(ready);
        let mut restart_count: u32 = 0;
        let mut recent_restarts: VecDeque<Instant> = VecDeque::new();

        loop {
            let explicit_start = ready.is_some();
            self.record(&name, ProcessStatus::Starting, |state| {
                if explicit_start {
                    state.restart_count = 0;
                    state.last_error = None;
                }
                state.started_at = None;
            });

            let spawned = {
                let mut control = self.control.lock();
                if control.stop_requested {
                    drop(control);
                    self.record(&name, ProcessStatus::Stopped, |_| {});
                    break;
                }

                match spawn_child(&self.spec, &self.settings.log_dir) {
                    Ok(mut child) => {
                        let pid = child.id();
                        control.pid = Some(pid);
                        control.run_exited = false;
                        *self.control.stdin() = child.stdin.take();
                        self.record(&name, ProcessStatus::Running, |state| {
                            state.pid = Some(pid);
                            state.started_at = Some(Utc::now());
                        });
                        Ok(child)
                    }
                    Err(source) => Err(source),
                }
            };

            let outcome = match spawned {
                Ok(mut child) => {
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Ok(child.id()));
                    }
                    let run_started = Instant::now();
                    let outcome = thread::scope(|scope| {
                        let timer = thread::Builder::new()
                            .name(format!("warden-stable-{name}"))
                            .spawn_scoped(scope, || self.reset_when_stable());
                        if let Err(err) = timer {
                            warn!("No stability timer for '{name}'; counter resets on exit: {err}");
                        }
                        self.watch(&mut child)
                    });
                    *self.control.stdin() = None;
                    if run_started.elapsed() >= self.settings.stability_threshold {
                        restart_count = 0;
                    }
                    outcome
                }
                Err(source) => {
                    error!("Failed to spawn '{name}': {source}");
                    if let Some(ready) = ready.take() {
                        let reason = format!("spawn failed: {source}");
                        self.record(&name, ProcessStatus::Failed, |state| {
                            state.last_error = Some(reason);
                        });
                        let _ = ready.send(Err(ProcessManagerError::SpawnFailure {
                            name: name.clone(),
                            source,
                        }));
                        break;
                    }
                    ExitOutcome::SpawnError
                }
            };

            let (exit_code, exit_signal) = match outcome {
                ExitOutcome::Code(code) => (Some(code), None),
                ExitOutcome::Signal(signal) => (None, Some(signal)),
                ExitOutcome::SpawnError => (None, None),
            };
            let record_exit = |state: &mut ProcessState| {
                if outcome != ExitOutcome::SpawnError {
                    state.last_exit_code = exit_code;
                    state.last_signal = exit_signal;
                }
            };

            if self.control.lock().stop_requested {
                info!("Process '{name}' stopped ({})", describe_outcome(outcome));
                self.record(&name, ProcessStatus::Stopped, record_exit);
                break;
            }

            while recent_restarts
                .front()
                .is_some_and(|at| at.elapsed() > self.spec.restart_window)
            {
                recent_restarts.pop_front();
            }

            match decide_restart(&self.spec, outcome, restart_count, recent_restarts.len()) {
                RestartDecision::Restart { delay } => {
                    restart_count += 1;
                    recent_restarts.push_back(Instant::now());
                    warn!(
                        "Process '{name}' {}; restart #{restart_count} in {delay:?}",
                        describe_outcome(outcome)
                    );
                    self.record(&name, ProcessStatus::Backoff, |state| {
                        record_exit(state);
                        state.restart_count = restart_count;
                        state.last_error = Some(describe_outcome(outcome));
                    });

                    if self.sleep_unless_stopped(delay) {
                        debug!("Pending restart of '{name}' cancelled by stop");
                        self.record(&name, ProcessStatus::Stopped, |_| {});
                        break;
                    }
                }
                RestartDecision::Stop => {
                    info!("Process '{name}' exited cleanly");
                    self.record(&name, ProcessStatus::Stopped, record_exit);
                    break;
                }
                RestartDecision::Fail { reason } => {
                    warn!("Process '{name}' failed: {reason}");
                    self.record(&name, ProcessStatus::Failed, |state| {
                        record_exit(state);
                        state.last_error = Some(reason);
                    });
                    break;
                }
            }
        }

        self.control.finish();
        debug!("Supervisor loop for '{name}' exited");
    }

    /// Persists a transition. Failures are logged; the store keeps the change in memory.
    fn record(&self, name: &str, next: ProcessStatus, update: impl FnOnce(&mut ProcessState)) {
        if let Err(err) = self.store.transition(name, next, update) {
            error!("Failed to record {next} for '{name}': {err}");
        }
    }

    /// Blocks until the child exits, then reaps it.
    ///
    /// The pid is dropped from the control block before the child is reaped, so a
    /// concurrent stop never signals a recycled pid.
    fn watch(&self, child: &mut Child) -> ExitOutcome {
        let status = wait_for_exit(child, &self.control);
        match status {
            Ok(status) => exit_outcome(status),
            Err(err) => {
                error!("Failed to reap '{}': {err}", self.spec.name);
                ExitOutcome::Code(-1)
            }
        }
    }

    /// Clears the persisted restart counter once the current run has stayed up
    /// for the stability threshold. Returns early when the run ends first.
    fn reset_when_stable(&self) {
        let control = self.control.lock();
        let (control, wait) = self
            .control
            .changed
            .wait_timeout_while(control, self.settings.stability_threshold, |state| {
                !state.run_exited && !state.stop_requested
            })
            .unwrap_or_else(PoisonError::into_inner);
        if !wait.timed_out() || control.run_exited || control.stop_requested {
            return;
        }
        drop(control);

        let name = &self.spec.name;
        let reset = self.store.update_state(name, |state| {
            if state.status == ProcessStatus::Running && state.restart_count > 0 {
                Some(std::mem::take(&mut state.restart_count))
            } else {
                None
            }
        });
        match reset {
            Ok(Some(previous)) => info!(
                "Process '{name}' stable for {:?}; restart count {previous} reset",
                self.settings.stability_threshold
            ),
            Ok(None) => {}
            Err(err) => error!("Failed to reset restart count for '{name}': {err}"),
        }
    }

    /// Sleeps for `delay`; returns true when a stop arrived first.
    fn sleep_unless_stopped(&self, delay: Duration) -> bool {
        let control = self.control.lock();
        let (control, _) = self
            .control
            .changed
            .wait_timeout_while(control, delay, |state| !state.stop_requested)
            .unwrap_or_else(PoisonError::into_inner);
        control.stop_requested
    }
}

#[cfg(target_os = "linux")]
fn wait_for_exit(child: &mut Child, control: &LoopControl) -> io::Result<ExitStatus> {
    use nix::sys::wait::{Id, WaitPidFlag, waitid};

    let pid = Pid::from_raw(child.id() as i32);
    loop {
        match waitid(Id::Pid(pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
            Ok(_) => break,
            Err(Errno::EINTR) => continue,
            Err(err) => {
                debug!("waitid on PID {} failed: {err}; falling back to wait", child.id());
                break;
            }
        }
    }

    mark_exited(control);
    child.wait()
}

#[cfg(not(target_os = "linux"))]
fn wait_for_exit(child: &mut Child, control: &LoopControl) -> io::Result<ExitStatus> {
    let status = child.wait();
    mark_exited(control);
    status
}

fn mark_exited(control: &LoopControl) {
    let mut state = control.lock();
    state.pid = None;
    state.run_exited = true;
    control.changed.notify_all();
}

fn exit_outcome(status: ExitStatus) -> ExitOutcome {
    match (status.code(), status.signal()) {
        (Some(code), _) => ExitOutcome::Code(code),
        (None, Some(signal)) => ExitOutcome::Signal(signal),
        (None, None) => ExitOutcome::Code(-1),
    }
}

fn spawn_child(spec: &ProcessSpec, log_dir: &Path) -> io::Result<Child> {
    let log_path = logs::resolve_log_path(log_dir, spec);
    let stdout = logs::open_log_sink(&log_path).map_err(io::Error::other)?;
    let stderr = stdout.try_clone()?;

    debug!(
        "Launching '{}': {} {:?} (log {})",
        spec.name,
        spec.command,
        spec.args,
        log_path.display()
    );

    let mut cmd = Command::new(&spec.command);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .stdin(if spec.stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));
    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }

    unsafe {
        cmd.pre_exec(|| {
            // Own process group so a stop reaches the whole tree.
            if libc::setpgid(0, 0) < 0 {
                return Err(io::Error::last_os_error());
            }

            #[cfg(target_os = "linux")]
            {
                use libc::{PR_SET_PDEATHSIG, SIGTERM, prctl};
                if prctl(PR_SET_PDEATHSIG, SIGTERM, 0, 0, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
            }

            Ok(())
        });
    }

    cmd.spawn()
}

/// Sends `signal` to the child's process group and then to the child itself.
fn signal_process_tree(
    pid: u32,
    signal: Signal,
    name: &str,
) -> Result<(), ProcessManagerError> {
    fn stop_error(name: &str, err: Errno) -> ProcessManagerError {
        ProcessManagerError::StopError {
            name: name.to_string(),
            source: io::Error::from_raw_os_error(err as i32),
        }
    }

    let pid = Pid::from_raw(pid as i32);
    match signal::killpg(pid, signal) {
        Ok(()) => debug!("Sent {signal} to process group {pid} of '{name}'"),
        Err(Errno::ESRCH) => {
            debug!("Process group of '{name}' missing; falling back to direct signal")
        }
        Err(Errno::EPERM) => warn!(
            "Insufficient permissions to signal process group {pid} of '{name}'; falling back to direct signal"
        ),
        Err(err) => return Err(stop_error(name, err)),
    }

    match signal::kill(pid, signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(stop_error(name, err)),
    }
}
