//! Managed process definitions, runtime state and the restart state machine.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::PathBuf, time::Duration};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::config::duration_serde;
use crate::constants::{
    DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX, DEFAULT_BACKOFF_MULTIPLIER,
    DEFAULT_RESTART_WINDOW,
};
use crate::error::ProcessManagerError;

/// When a process that exited on its own should be brought back.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    AsRefStr,
    Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RestartPolicy {
    /// Never restart; a clean exit settles in `stopped`, anything else in `failed`.
    Never,
    /// Restart on nonzero exit codes and signals only.
    #[default]
    OnFailure,
    /// Restart on every exit, including code 0.
    Always,
}

/// Exponential spacing between restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first restart.
    #[serde(with = "duration_serde", default = "default_backoff_base")]
    pub base: Duration,
    /// Ceiling on any single delay.
    #[serde(with = "duration_serde", default = "default_backoff_max")]
    pub max: Duration,
    /// Growth factor per consecutive restart.
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
}

fn default_backoff_base() -> Duration {
    DEFAULT_BACKOFF_BASE
}

fn default_backoff_max() -> Duration {
    DEFAULT_BACKOFF_MAX
}

fn default_backoff_multiplier() -> f64 {
    DEFAULT_BACKOFF_MULTIPLIER
}

fn default_restart_window() -> Duration {
    DEFAULT_RESTART_WINDOW
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            max: DEFAULT_BACKOFF_MAX,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl BackoffConfig {
    /// Delay before the restart that follows `restart_count` earlier restarts:
    /// `min(base * multiplier^restart_count, max)`.
    pub fn delay(&self, restart_count: u32) -> Duration {
        let exponent = i32::try_from(restart_count).unwrap_or(i32::MAX);
        let scaled = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(scaled).min(self.max)
    }
}

/// Immutable definition of a managed process. Replaced wholesale on update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Unique key.
    pub name: String,
    /// Executable to run, resolved through `PATH` when not absolute.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// Variables layered over the daemon's own environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Cap on restarts within `restart_window`; `None` or `0` means unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_restarts: Option<u32>,
    #[serde(with = "duration_serde", default = "default_restart_window")]
    pub restart_window: Duration,
    /// Where stdout and stderr are appended; defaults to `<log_dir>/<name>.log`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
    /// Connect the child's stdin to a pipe the `write` command feeds instead of `/dev/null`.
    #[serde(default)]
    pub stdin: bool,
}

impl ProcessSpec {
    /// Builds a spec with default policy and backoff.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            restart_policy: RestartPolicy::default(),
            backoff: BackoffConfig::default(),
            max_restarts: None,
            restart_window: DEFAULT_RESTART_WINDOW,
            log_path: None,
            stdin: false,
        }
    }

    /// Rejects definitions the supervisor could never run sensibly.
    pub fn validate(&self) -> Result<(), ProcessManagerError> {
        let name = self.name.as_str();
        if name.is_empty() {
            return Err(ProcessManagerError::BadRequest(
                "process name cannot be empty".into(),
            ));
        }
        if name.chars().any(|c| c == '/' || c.is_whitespace() || c.is_control()) {
            return Err(ProcessManagerError::BadRequest(format!(
                "process name '{name}' may not contain '/' or whitespace"
            )));
        }
        if self.command.trim().is_empty() {
            return Err(ProcessManagerError::BadRequest(format!(
                "process '{name}' has an empty command"
            )));
        }
        if !(self.backoff.multiplier.is_finite() && self.backoff.multiplier >= 1.0) {
            return Err(ProcessManagerError::BadRequest(format!(
                "process '{name}' backoff multiplier must be >= 1"
            )));
        }
        if self.backoff.base > self.backoff.max {
            return Err(ProcessManagerError::BadRequest(format!(
                "process '{name}' backoff base exceeds backoff max"
            )));
        }
        Ok(())
    }

    /// Restart cap, with `0` folded into "unlimited".
    pub fn restart_limit(&self) -> Option<u32> {
        self.max_restarts.filter(|max| *max > 0)
    }
}

/// Lifecycle status of a managed process.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    AsRefStr,
    Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProcessStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Backoff,
    Failed,
    Stopping,
}

impl ProcessStatus {
    /// Transition table of the supervisor state machine.
    pub fn can_transition_to(self, next: ProcessStatus) -> bool {
        use ProcessStatus::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Failed, Starting)
                | (Starting, Running)
                | (Starting, Backoff)
                | (Starting, Failed)
                | (Starting, Stopped)
                | (Running, Stopping)
                | (Running, Backoff)
                | (Running, Failed)
                | (Running, Stopped)
                | (Backoff, Starting)
                | (Backoff, Failed)
                | (Backoff, Stopped)
                | (Stopping, Stopped)
        )
    }

    /// Statuses that imply a supervisor loop is attached to the record.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ProcessStatus::Starting
                | ProcessStatus::Running
                | ProcessStatus::Backoff
                | ProcessStatus::Stopping
        )
    }

    /// Statuses during which a live OS process may exist.
    pub fn may_have_pid(self) -> bool {
        matches!(
            self,
            ProcessStatus::Starting | ProcessStatus::Running | ProcessStatus::Stopping
        )
    }
}

/// Mutable runtime state, written only by the owning loop or an explicit command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessState {
    pub status: ProcessStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_signal: Option<i32>,
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ProcessState {
    /// Moves to `next`, clearing the pid whenever the new status cannot own one.
    pub fn enter(&mut self, next: ProcessStatus) {
        self.status = next;
        if !next.may_have_pid() {
            self.pid = None;
        }
        self.updated_at = Some(Utc::now());
    }
}

/// Read-only copy of a record handed out to queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub spec: ProcessSpec,
    pub state: ProcessState,
}

/// How a run of the child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// The child exited with a status code.
    Code(i32),
    /// The child was killed by a signal.
    Signal(i32),
    /// A respawn after backoff could not create the child.
    SpawnError,
}

impl ExitOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, ExitOutcome::Code(0))
    }
}

/// What the supervisor loop does after an unexpected exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartDecision {
    /// Enter `backoff`, then `starting` after `delay`.
    Restart { delay: Duration },
    /// Settle in `stopped` without restarting.
    Stop,
    /// Settle in `failed`, recording `reason` as the last error.
    Fail { reason: String },
}

/// Applies `spec`'s restart policy to an exit.
///
/// `restart_count` is the count after any stability reset, and `recent_restarts`
/// the number of restarts already performed inside the current window.
pub fn decide_restart(
    spec: &ProcessSpec,
    outcome: ExitOutcome,
    restart_count: u32,
    recent_restarts: usize,
) -> RestartDecision {
    let wants_restart = match spec.restart_policy {
        RestartPolicy::Never => false,
        RestartPolicy::OnFailure => !outcome.is_success(),
        RestartPolicy::Always => true,
    };

    if !wants_restart {
        return if outcome.is_success() {
            RestartDecision::Stop
        } else {
            RestartDecision::Fail {
                reason: describe_outcome(outcome),
            }
        };
    }

    if let Some(limit) = spec.restart_limit()
        && recent_restarts >= limit as usize
    {
        return RestartDecision::Fail {
            reason: format!(
                "restart limit reached: {limit} restarts within {}s ({})",
                spec.restart_window.as_secs(),
                describe_outcome(outcome)
            ),
        };
    }

    RestartDecision::Restart {
        delay: spec.backoff.delay(restart_count),
    }
}

/// Human readable description of an exit, used for `last_error`.
pub fn describe_outcome(outcome: ExitOutcome) -> String {
    match outcome {
        ExitOutcome::Code(code) => format!("exited with code {code}"),
        ExitOutcome::Signal(signal) => format!("terminated by signal {signal}"),
        ExitOutcome::SpawnError => "could not be spawned".to_string(),
    }
}
