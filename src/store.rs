//! Durable table of managed process definitions and their last-known state.
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
};
use tracing::{debug, warn};

use crate::constants::{STATE_FILE_NAME, STATE_LOCK_FILE_NAME};
use crate::error::StoreError;
use crate::process::{ProcessSnapshot, ProcessSpec, ProcessState, ProcessStatus};

const STATE_FILE_VERSION: u32 = 1;

/// One row of the table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub spec: ProcessSpec,
    #[serde(default)]
    pub state: ProcessState,
    /// Set when a graceful daemon shutdown stopped this process while it was active.
    #[serde(default)]
    pub resume: bool,
}

impl ProcessRecord {
    fn snapshot(&self) -> ProcessSnapshot {
        ProcessSnapshot {
            spec: self.spec.clone(),
            state: self.state.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    #[serde(default)]
    records: BTreeMap<String, ProcessRecord>,
}

/// A record found active by [`RecordStore::recover`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredRecord {
    pub name: String,
    /// Status the previous daemon last persisted.
    pub previous: ProcessStatus,
    /// PID the previous daemon recorded, no longer owned by anyone.
    pub stale_pid: Option<u32>,
    /// Whether the record was flagged for resumption at shutdown.
    pub resume: bool,
}

impl RecoveredRecord {
    /// Whether the previous daemon meant this process to be up.
    pub fn wanted_running(&self) -> bool {
        self.resume
            || matches!(
                self.previous,
                ProcessStatus::Running | ProcessStatus::Starting | ProcessStatus::Backoff
            )
    }
}

/// Process Record Store.
///
/// Every mutation is written through to `state.json` before the call returns.
/// A failed write is returned to the caller and flips the store into a degraded
/// mode that lasts until a later write succeeds.
#[derive(Debug)]
pub struct RecordStore {
    path: PathBuf,
    records: Mutex<BTreeMap<String, ProcessRecord>>,
    degraded: AtomicBool,
    _lock: File,
}

impl RecordStore {
    /// Opens (or creates) the store under `state_dir`, taking the directory lock.
    pub fn open(state_dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(state_dir)?;

        let lock_path = state_dir.join(STATE_LOCK_FILE_NAME);
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        lock.try_lock_exclusive()
            .map_err(|_| StoreError::Locked(state_dir.display().to_string()))?;

        let path = state_dir.join(STATE_FILE_NAME);
        let records = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            if contents.trim().is_empty() {
                BTreeMap::new()
            } else {
                let file: StateFile = serde_json::from_str(&contents)?;
                if file.version != STATE_FILE_VERSION {
                    warn!(
                        "State file {} has version {}, expected {}; loading anyway",
                        path.display(),
                        file.version,
                        STATE_FILE_VERSION
                    );
                }
                file.records
            }
        } else {
            BTreeMap::new()
        };

        debug!("Loaded {} process record(s) from {}", records.len(), path.display());

        Ok(Self {
            path,
            records: Mutex::new(records),
            degraded: AtomicBool::new(false),
            _lock: lock,
        })
    }

    /// Path of the backing JSON file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True while the last write to disk failed.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    fn persist(&self, records: &BTreeMap<String, ProcessRecord>) -> Result<(), StoreError> {
        let result = write_state_file(&self.path, records);
        match &result {
            Ok(()) => {
                if self.degraded.swap(false, Ordering::SeqCst) {
                    warn!("State file {} is writable again", self.path.display());
                }
            }
            Err(err) => {
                self.degraded.store(true, Ordering::SeqCst);
                warn!("Failed to persist {}: {err}", self.path.display());
            }
        }
        result
    }

    /// Rewrites the state file from memory; clears the degraded flag on success.
    pub fn flush(&self) -> Result<(), StoreError> {
        let records = self.records.lock()?;
        self.persist(&records)
    }

    /// Registers a new record in `stopped`; fails if the name is taken.
    pub fn insert(&self, spec: ProcessSpec) -> Result<ProcessSnapshot, StoreError> {
        let mut records = self.records.lock()?;
        if records.contains_key(&spec.name) {
            return Err(StoreError::AlreadyExists(spec.name));
        }

        let name = spec.name.clone();
        let record = ProcessRecord {
            spec,
            state: ProcessState::default(),
            resume: false,
        };
        let snapshot = record.snapshot();
        records.insert(name.clone(), record);

        if let Err(err) = self.persist(&records) {
            records.remove(&name);
            return Err(err);
        }
        Ok(snapshot)
    }

    /// Inserts `spec`, or replaces the spec of an existing record while keeping its state.
    pub fn upsert(&self, spec: ProcessSpec) -> Result<ProcessSnapshot, StoreError> {
        let mut records = self.records.lock()?;
        let name = spec.name.clone();
        let previous = records.get(&name).cloned();

        let record = records.entry(name.clone()).or_insert_with(|| ProcessRecord {
            spec: spec.clone(),
            state: ProcessState::default(),
            resume: false,
        });
        record.spec = spec;
        let snapshot = record.snapshot();

        if let Err(err) = self.persist(&records) {
            match previous {
                Some(previous) => {
                    records.insert(name, previous);
                }
                None => {
                    records.remove(&name);
                }
            }
            return Err(err);
        }
        Ok(snapshot)
    }

    /// Snapshot of one record.
    pub fn get(&self, name: &str) -> Result<ProcessSnapshot, StoreError> {
        let records = self.records.lock()?;
        records
            .get(name)
            .map(ProcessRecord::snapshot)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    /// Whether a record named `name` exists.
    pub fn contains(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.records.lock()?.contains_key(name))
    }

    /// Snapshots of every record, ordered by name.
    pub fn list(&self) -> Result<Vec<ProcessSnapshot>, StoreError> {
        let records = self.records.lock()?;
        Ok(records.values().map(ProcessRecord::snapshot).collect())
    }

    /// Deletes a settled record. Active records are refused.
    pub fn remove(&self, name: &str) -> Result<ProcessSnapshot, StoreError> {
        let mut records = self.records.lock()?;
        let record = records
            .get(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        if record.state.status.is_active() {
            return Err(StoreError::Active(name.to_string()));
        }

        let removed = records
            .remove(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        if let Err(err) = self.persist(&records) {
            records.insert(name.to_string(), removed);
            return Err(err);
        }
        Ok(removed.snapshot())
    }

    /// Atomic read-modify-write of one record's state.
    ///
    /// The change stays in memory even when the write-through fails, so queries
    /// keep reporting what the supervisor actually did; the failure is returned.
    pub fn update_state<R>(
        &self,
        name: &str,
        update: impl FnOnce(&mut ProcessState) -> R,
    ) -> Result<R, StoreError> {
        let mut records = self.records.lock()?;
        let record = records
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        let result = update(&mut record.state);
        self.persist(&records)?;
        Ok(result)
    }

    /// Moves a record to `next` through the state machine, then applies `update`.
    pub fn transition(
        &self,
        name: &str,
        next: ProcessStatus,
        update: impl FnOnce(&mut ProcessState),
    ) -> Result<(), StoreError> {
        let mut records = self.records.lock()?;
        let record = records
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;

        let current = record.state.status;
        if !current.can_transition_to(next) {
            return Err(StoreError::IllegalTransition {
                name: name.to_string(),
                from: current.to_string(),
                to: next.to_string(),
            });
        }

        record.state.enter(next);
        update(&mut record.state);
        self.persist(&records)
    }

    /// Sets or clears the resume-on-recovery flag.
    pub fn set_resume(&self, name: &str, resume: bool) -> Result<(), StoreError> {
        let mut records = self.records.lock()?;
        let record = records
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        if record.resume == resume {
            return Ok(());
        }
        record.resume = resume;
        self.persist(&records)
    }

    /// Normalizes records a previous daemon left active.
    ///
    /// No OS handle survives a daemon restart, so every active record becomes
    /// `stopped` with no pid. Resume flags are consumed. Returns what was changed.
    pub fn recover(&self) -> Result<Vec<RecoveredRecord>, StoreError> {
        let mut records = self.records.lock()?;
        let mut recovered = Vec::new();

        for (name, record) in records.iter_mut() {
            let previous = record.state.status;
            if !previous.is_active() && !record.resume {
                continue;
            }

            recovered.push(RecoveredRecord {
                name: name.clone(),
                previous,
                stale_pid: record.state.pid,
                resume: record.resume,
            });

            if previous.is_active() {
                record.state.enter(ProcessStatus::Stopped);
            }
            record.state.pid = None;
            record.resume = false;
        }

        if !recovered.is_empty() {
            self.persist(&records)?;
        }
        Ok(recovered)
    }
}

fn write_state_file(
    path: &Path,
    records: &BTreeMap<String, ProcessRecord>,
) -> Result<(), StoreError> {
    #[derive(Serialize)]
    struct StateFileRef<'a> {
        version: u32,
        records: &'a BTreeMap<String, ProcessRecord>,
    }

    let payload = serde_json::to_string_pretty(&StateFileRef {
        version: STATE_FILE_VERSION,
        records,
    })
    .map_err(|err| StoreError::Persist(err.to_string()))?;

    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, payload)
        .and_then(|_| fs::rename(&tmp_path, path))
        .map_err(|err| {
            let _ = fs::remove_file(&tmp_path);
            StoreError::Persist(format!("{}: {err}", path.display()))
        })
}
