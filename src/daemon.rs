//! Daemon core: owns the record store and the supervisor loops.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use nix::{sys::signal, unistd::Pid};
use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::{
    config::{DaemonConfig, RecoveryPolicy},
    error::{ProcessManagerError, StoreError},
    logs,
    process::{ProcessSnapshot, ProcessSpec, ProcessStatus},
    sequencer::NameSequencer,
    store::RecordStore,
    supervisor::{self, LoopHandle, LoopSettings},
};

/// Settings the daemon core needs from the daemon config.
#[derive(Debug, Clone)]
pub struct DaemonSettings {
    pub loops: LoopSettings,
    pub recovery: RecoveryPolicy,
}

impl From<&DaemonConfig> for DaemonSettings {
    fn from(config: &DaemonConfig) -> Self {
        Self {
            loops: LoopSettings {
                log_dir: config.log_dir.clone(),
                stop_grace_period: config.stop_grace_period,
                stability_threshold: config.stability_threshold,
            },
            recovery: config.recovery,
        }
    }
}

/// Result of startup recovery.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Records that were left active by the previous daemon and are now stopped.
    pub normalized: Vec<String>,
    /// Records brought back up by the `autostart` policy.
    pub started: Vec<String>,
}

/// Narrows `list` to matching records. The default matches everything.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pattern: Option<Regex>,
    status: Option<ProcessStatus>,
}

impl ListFilter {
    /// Builds a filter from a name regex and a status, either optional.
    pub fn new(pattern: Option<&str>, status: Option<ProcessStatus>) -> Result<Self, ProcessManagerError> {
        let pattern = pattern
            .map(Regex::new)
            .transpose()
            .map_err(|err| ProcessManagerError::BadRequest(format!("invalid name pattern: {err}")))?;
        Ok(Self { pattern, status })
    }

    pub fn matches(&self, snapshot: &ProcessSnapshot) -> bool {
        self.pattern
            .as_ref()
            .is_none_or(|pattern| pattern.is_match(&snapshot.spec.name))
            && self.status.is_none_or(|status| snapshot.state.status == status)
    }
}

/// Owns the store and the map of running supervisor loops.
///
/// Mutating commands take a per-name ticket so that commands on one name apply
/// in the order they were received, while different names proceed in parallel.
/// Queries read the store directly and never queue.
pub struct Daemon {
    store: Arc<RecordStore>,
    loops: Mutex<HashMap<String, LoopHandle>>,
    sequencer: NameSequencer,
    /// Held across the log path check and the write of a definition, so two
    /// names can never claim one log file.
    definitions: Mutex<()>,
    settings: DaemonSettings,
}

impl Daemon {
    pub fn new(store: Arc<RecordStore>, settings: DaemonSettings) -> Self {
        Self {
            store,
            loops: Mutex::new(HashMap::new()),
            sequencer: NameSequencer::new(),
            definitions: Mutex::new(()),
            settings,
        }
    }

    /// Opens the store under the configured state directory.
    pub fn from_config(config: &DaemonConfig) -> Result<Self, ProcessManagerError> {
        let store = RecordStore::open(&config.state_dir)?;
        Ok(Self::new(Arc::new(store), DaemonSettings::from(config)))
    }

    /// Refuses mutations while the store cannot be written.
    fn ensure_writable(&self) -> Result<(), ProcessManagerError> {
        if !self.store.is_degraded() {
            return Ok(());
        }
        self.store.flush().map_err(|err| {
            warn!("Refusing mutation; record store still degraded: {err}");
            ProcessManagerError::Unavailable(err.to_string())
        })
    }

    /// Removes the handle for `name` when its loop has already settled.
    fn take_finished(&self, name: &str) -> Result<(), ProcessManagerError> {
        let finished = {
            let mut loops = self.loops.lock()?;
            match loops.get(name) {
                Some(handle) if handle.is_finished() => loops.remove(name),
                _ => None,
            }
        };
        if let Some(mut handle) = finished {
            handle.join();
        }
        Ok(())
    }

    fn has_live_loop(&self, name: &str) -> Result<bool, ProcessManagerError> {
        self.take_finished(name)?;
        Ok(self.loops.lock()?.contains_key(name))
    }

    /// Refuses a definition whose log file another record already writes to.
    fn ensure_log_path_free(&self, spec: &ProcessSpec) -> Result<(), ProcessManagerError> {
        let log_dir = &self.settings.loops.log_dir;
        let wanted = logs::resolve_log_path(log_dir, spec);
        let owner = self
            .store
            .list()?
            .into_iter()
            .find(|other| {
                other.spec.name != spec.name
                    && logs::resolve_log_path(log_dir, &other.spec) == wanted
            });

        match owner {
            Some(owner) => Err(ProcessManagerError::Conflict {
                name: spec.name.clone(),
                reason: format!(
                    "log file {} is already used by '{}'",
                    wanted.display(),
                    owner.spec.name
                ),
            }),
            None => Ok(()),
        }
    }

    /// Registers a new process in `stopped`.
    pub fn register(&self, spec: ProcessSpec) -> Result<ProcessSnapshot, ProcessManagerError> {
        spec.validate()?;
        let _turn = self.sequencer.acquire(&spec.name);
        self.ensure_writable()?;

        let name = spec.name.clone();
        let _definitions = self.definitions.lock()?;
        if self.store.contains(&name)? {
            return Err(ProcessManagerError::Conflict {
                name,
                reason: "a process with this name is already registered".into(),
            });
        }
        self.ensure_log_path_free(&spec)?;
        let snapshot = self.store.insert(spec).map_err(|err| match err {
            StoreError::AlreadyExists(_) => ProcessManagerError::Conflict {
                name: name.clone(),
                reason: "a process with this name is already registered".into(),
            },
            other => other.into(),
        })?;
        info!("Registered process '{name}'");
        Ok(snapshot)
    }

    /// Replaces the spec of a settled process.
    pub fn update(&self, spec: ProcessSpec) -> Result<ProcessSnapshot, ProcessManagerError> {
        spec.validate()?;
        let name = spec.name.clone();
        let _turn = self.sequencer.acquire(&name);
        self.ensure_writable()?;

        if !self.store.contains(&name)? {
            return Err(ProcessManagerError::NotFound(name));
        }
        if self.has_live_loop(&name)? {
            return Err(ProcessManagerError::Conflict {
                name,
                reason: "stop the process before updating it".into(),
            });
        }

        let _definitions = self.definitions.lock()?;
        self.ensure_log_path_free(&spec)?;
        let snapshot = self.store.upsert(spec)?;
        info!("Updated process '{name}'");
        Ok(snapshot)
    }

    /// Starts a settled process and waits for its first spawn.
    pub fn start(&self, name: &str) -> Result<ProcessSnapshot, ProcessManagerError> {
        let _turn = self.sequencer.acquire(name);
        self.ensure_writable()?;
        self.start_locked(name)
    }

    fn start_locked(&self, name: &str) -> Result<ProcessSnapshot, ProcessManagerError> {
        let snapshot = self.get(name)?;
        if self.has_live_loop(name)? {
            return Err(ProcessManagerError::AlreadyRunning(name.to_string()));
        }

        let handle = supervisor::launch(
            snapshot.spec,
            Arc::clone(&self.store),
            self.settings.loops.clone(),
        )?;
        self.loops.lock()?.insert(name.to_string(), handle);
        self.get(name)
    }

    /// Stops a running process; never triggers its restart policy.
    pub fn stop(&self, name: &str) -> Result<ProcessSnapshot, ProcessManagerError> {
        let _turn = self.sequencer.acquire(name);
        self.ensure_writable()?;
        self.get(name)?;
        self.stop_locked(name)?;
        self.get(name)
    }

    fn stop_locked(&self, name: &str) -> Result<(), ProcessManagerError> {
        if !self.has_live_loop(name)? {
            return Err(ProcessManagerError::NotRunning(name.to_string()));
        }

        let Some(mut handle) = self.loops.lock()?.remove(name) else {
            return Err(ProcessManagerError::NotRunning(name.to_string()));
        };

        if let Err(err) = handle.stop(&self.store, self.settings.loops.stop_grace_period) {
            error!("Failed to stop '{name}': {err}");
            self.loops.lock()?.insert(name.to_string(), handle);
            return Err(err);
        }
        info!("Stopped process '{name}'");
        Ok(())
    }

    /// Stops the process if it is running, then starts it again.
    pub fn restart(&self, name: &str) -> Result<ProcessSnapshot, ProcessManagerError> {
        let _turn = self.sequencer.acquire(name);
        self.ensure_writable()?;
        self.get(name)?;

        if self.has_live_loop(name)? {
            self.stop_locked(name)?;
        }
        self.start_locked(name)
    }

    /// Deletes a settled record; `force` stops a running process first.
    pub fn remove(&self, name: &str, force: bool) -> Result<ProcessSnapshot, ProcessManagerError> {
        let _turn = self.sequencer.acquire(name);
        self.ensure_writable()?;
        self.get(name)?;

        if self.has_live_loop(name)? {
            if !force {
                return Err(ProcessManagerError::Conflict {
                    name: name.to_string(),
                    reason: "process is running; stop it first or pass --force".into(),
                });
            }
            self.stop_locked(name)?;
        }

        let removed = self.store.remove(name).map_err(|err| match err {
            StoreError::Active(_) => ProcessManagerError::Conflict {
                name: name.to_string(),
                reason: "process is still active".into(),
            },
            other => other.into(),
        })?;
        info!("Removed process '{name}'");
        Ok(removed)
    }

    /// Snapshot of one process.
    pub fn get(&self, name: &str) -> Result<ProcessSnapshot, ProcessManagerError> {
        self.store.get(name).map_err(|err| match err {
            StoreError::NotFound(_) => {
                ProcessManagerError::NotFound(name.to_string())
            }
            other => other.into(),
        })
    }

    /// Snapshots of every process, ordered by name.
    pub fn list(&self) -> Result<Vec<ProcessSnapshot>, ProcessManagerError> {
        Ok(self.store.list()?)
    }

    /// Snapshots of the processes `filter` accepts, ordered by name.
    pub fn list_matching(&self, filter: &ListFilter) -> Result<Vec<ProcessSnapshot>, ProcessManagerError> {
        let mut snapshots = self.store.list()?;
        snapshots.retain(|snapshot| filter.matches(snapshot));
        Ok(snapshots)
    }

    /// Sends `data` to the stdin of a running process registered with `stdin: true`.
    pub fn write(&self, name: &str, data: &[u8]) -> Result<usize, ProcessManagerError> {
        let pipe = {
            let _turn = self.sequencer.acquire(name);
            let snapshot = self.get(name)?;
            if !snapshot.spec.stdin {
                return Err(ProcessManagerError::Conflict {
                    name: name.to_string(),
                    reason: "stdin is not enabled for this process".into(),
                });
            }
            if !self.has_live_loop(name)? {
                return Err(ProcessManagerError::NotRunning(name.to_string()));
            }
            self.loops
                .lock()?
                .get(name)
                .map(LoopHandle::stdin)
                .ok_or_else(|| ProcessManagerError::NotRunning(name.to_string()))?
        };

        let written = pipe.write(data)?;
        debug!("Wrote {written} byte(s) to stdin of '{name}'");
        Ok(written)
    }

    /// The last `lines` lines captured from a process.
    pub fn tail(&self, name: &str, lines: usize) -> Result<Vec<String>, ProcessManagerError> {
        let snapshot = self.get(name)?;
        let path = logs::resolve_log_path(&self.settings.loops.log_dir, &snapshot.spec);
        Ok(logs::tail_lines(&path, lines)?)
    }

    /// Normalizes records a previous daemon left active, then applies the recovery policy.
    pub fn recover(&self) -> Result<RecoveryReport, ProcessManagerError> {
        let recovered = self.store.recover()?;
        let mut report = RecoveryReport::default();

        for record in recovered {
            if let Some(pid) = record.stale_pid
                && pid_is_alive(pid)
            {
                warn!(
                    "Process '{}' left PID {pid} alive from a previous daemon; it is no longer supervised",
                    record.name
                );
            }

            if record.previous.is_active() {
                debug!(
                    "Recovered '{}' from {} to stopped",
                    record.name, record.previous
                );
                report.normalized.push(record.name.clone());
            }

            if self.settings.recovery == RecoveryPolicy::Autostart && record.wanted_running() {
                match self.start(&record.name) {
                    Ok(_) => report.started.push(record.name),
                    Err(err) => error!("Failed to autostart '{}': {err}", record.name),
                }
            }
        }

        if !report.normalized.is_empty() {
            info!(
                "Recovered {} process record(s) left active by a previous daemon",
                report.normalized.len()
            );
        }
        Ok(report)
    }

    /// Stops every running loop, flagging each record for resumption.
    ///
    /// Returns the names that were stopped.
    pub fn shutdown(&self) -> Result<Vec<String>, ProcessManagerError> {
        let names: Vec<String> = self.loops.lock()?.keys().cloned().collect();
        let mut stopped = Vec::new();

        for name in names {
            let _turn = self.sequencer.acquire(&name);
            if !self.has_live_loop(&name)? {
                continue;
            }
            if let Err(err) = self.store.set_resume(&name, true) {
                warn!("Failed to flag '{name}' for resumption: {err}");
            }
            match self.stop_locked(&name) {
                Ok(()) => stopped.push(name),
                Err(err) => error!("Failed to stop '{name}' during shutdown: {err}"),
            }
        }

        info!("Stopped {} process(es) for shutdown", stopped.len());
        Ok(stopped)
    }
}

fn pid_is_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    signal::kill(Pid::from_raw(raw), None).is_ok()
}
