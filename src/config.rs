//! Configuration management for the warden daemon.
use regex::Regex;
use serde::Deserialize;
use std::{
    collections::HashMap,
    env, fs, io,
    path::{Path, PathBuf},
    time::Duration,
};
use strum_macros::{AsRefStr, EnumString};

use crate::constants::{
    DAEMON_PID_FILE_NAME, DEFAULT_IO_TIMEOUT, DEFAULT_STABILITY_THRESHOLD,
    DEFAULT_STOP_GRACE_PERIOD,
};
use crate::error::ProcessManagerError;
use crate::process::ProcessSpec;
use crate::runtime::{self, RuntimePaths};

/// What the daemon does with processes that were active when it last went away.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RecoveryPolicy {
    /// Report them `stopped` and wait for an explicit start.
    #[default]
    LeaveStopped,
    /// Report them `stopped`, then start them again.
    Autostart,
}

/// Raw shape of `wardend.yaml`. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    state_dir: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    socket: Option<PathBuf>,
    recovery: Option<RecoveryPolicy>,
    stop_grace_period: Option<HumanDuration>,
    stability_threshold: Option<HumanDuration>,
    io_timeout: Option<HumanDuration>,
}

/// A duration written as `"750ms"`, `"5s"` or a bare number of seconds.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(transparent)]
struct HumanDuration(#[serde(with = "duration_serde")] Duration);

/// Resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Holds `state.json`, the lock file and (by default) the socket.
    pub state_dir: PathBuf,
    /// Default location for captured process output.
    pub log_dir: PathBuf,
    /// Control socket the server binds.
    pub socket_path: PathBuf,
    pub recovery: RecoveryPolicy,
    /// SIGTERM to SIGKILL escalation delay.
    pub stop_grace_period: Duration,
    /// Runs at least this long reset the restart counter.
    pub stability_threshold: Duration,
    /// Read/write timeout on control connections.
    pub io_timeout: Duration,
}

impl DaemonConfig {
    /// Defaults rooted at `paths`.
    pub fn with_paths(paths: &RuntimePaths) -> Self {
        Self {
            state_dir: paths.state_dir.clone(),
            log_dir: paths.log_dir.clone(),
            socket_path: paths.default_socket(),
            recovery: RecoveryPolicy::default(),
            stop_grace_period: DEFAULT_STOP_GRACE_PERIOD,
            stability_threshold: DEFAULT_STABILITY_THRESHOLD,
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }

    /// Defaults with every directory under `root`; handy for tests and `--home`.
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        Self::with_paths(&RuntimePaths::rooted_at(root.into()))
    }

    /// File the daemon records its own PID in.
    pub fn pid_file(&self) -> PathBuf {
        self.state_dir.join(DAEMON_PID_FILE_NAME)
    }

    fn apply(mut self, raw: RawConfig, base: &Path) -> Self {
        let resolve = |path: PathBuf| {
            if path.is_absolute() {
                path
            } else {
                base.join(path)
            }
        };

        if let Some(dir) = raw.state_dir {
            let dir = resolve(dir);
            self.socket_path = RuntimePaths::rooted_at(dir.clone()).default_socket();
            self.log_dir = RuntimePaths::rooted_at(dir.clone()).log_dir;
            self.state_dir = dir;
        }
        if let Some(dir) = raw.log_dir {
            self.log_dir = resolve(dir);
        }
        if let Some(socket) = raw.socket {
            self.socket_path = resolve(socket);
        }
        if let Some(recovery) = raw.recovery {
            self.recovery = recovery;
        }
        if let Some(HumanDuration(value)) = raw.stop_grace_period {
            self.stop_grace_period = value;
        }
        if let Some(HumanDuration(value)) = raw.stability_threshold {
            self.stability_threshold = value;
        }
        if let Some(HumanDuration(value)) = raw.io_timeout {
            self.io_timeout = value;
        }
        self
    }
}

/// Expands `$VAR` and `${VAR}` references, failing on unset variables.
fn expand_env_vars(input: &str) -> Result<String, ProcessManagerError> {
    let re = Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?")
        .map_err(|err| ProcessManagerError::ConfigInvalid(err.to_string()))?;

    let mut missing = None;
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| var_name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(var_name) => Err(ProcessManagerError::ConfigInvalid(format!(
            "missing environment variable: {var_name}"
        ))),
        None => Ok(result.to_string()),
    }
}

/// Loads the daemon configuration.
///
/// An explicitly named file must exist; the default location is optional and
/// falls back to built-in defaults. `WARDEN_SOCKET` overrides the socket path
/// either way.
pub fn load_config(
    config_path: Option<&Path>,
    paths: &RuntimePaths,
) -> Result<DaemonConfig, ProcessManagerError> {
    let defaults = DaemonConfig::with_paths(paths);

    let (path, required) = match config_path {
        Some(path) => (path.to_path_buf(), true),
        None => (paths.config_file(), false),
    };

    let mut config = if path.exists() || required {
        let content = fs::read_to_string(&path).map_err(|e| {
            ProcessManagerError::ConfigReadError(std::io::Error::new(
                e.kind(),
                format!("{} ({})", e, path.display()),
            ))
        })?;
        let expanded = expand_env_vars(&content)?;
        let raw: RawConfig = if expanded.trim().is_empty() {
            RawConfig::default()
        } else {
            serde_yaml::from_str(&expanded).map_err(ProcessManagerError::ConfigParseError)?
        };
        let base = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        defaults.apply(raw, &base)
    } else {
        defaults
    };

    if let Some(socket) = runtime::socket_from_env() {
        config.socket_path = socket;
    }

    Ok(config)
}

fn read_error(path: &Path, err: io::Error) -> ProcessManagerError {
    ProcessManagerError::ConfigReadError(io::Error::new(
        err.kind(),
        format!("{} ({})", err, path.display()),
    ))
}

/// Loads process definitions for `warden register --file`.
///
/// `path` is either a YAML file holding one definition or a list of them, or a
/// directory searched recursively for `.yaml`/`.yml` files in path order. Names
/// must be unique across everything loaded.
pub fn load_process_specs(path: &Path) -> Result<Vec<ProcessSpec>, ProcessManagerError> {
    let files = if path.is_dir() {
        let mut files = Vec::new();
        collect_spec_files(path, &mut files).map_err(|err| read_error(path, err))?;
        files.sort();
        if files.is_empty() {
            return Err(ProcessManagerError::ConfigInvalid(format!(
                "no .yaml or .yml files found under {}",
                path.display()
            )));
        }
        files
    } else {
        vec![path.to_path_buf()]
    };

    let mut specs = Vec::new();
    let mut origins: HashMap<String, PathBuf> = HashMap::new();
    for file in files {
        for spec in load_spec_file(&file)? {
            if let Some(first) = origins.insert(spec.name.clone(), file.clone()) {
                return Err(ProcessManagerError::ConfigInvalid(format!(
                    "process '{}' is defined in both {} and {}",
                    spec.name,
                    first.display(),
                    file.display()
                )));
            }
            specs.push(spec);
        }
    }
    Ok(specs)
}

fn collect_spec_files(dir: &Path, files: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_spec_files(&path, files)?;
        } else if path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml")
        {
            files.push(path);
        }
    }
    Ok(())
}

fn load_spec_file(path: &Path) -> Result<Vec<ProcessSpec>, ProcessManagerError> {
    let content = fs::read_to_string(path).map_err(|err| read_error(path, err))?;
    let expanded = expand_env_vars(&content)?;
    let document: serde_yaml::Value =
        serde_yaml::from_str(&expanded).map_err(ProcessManagerError::ConfigParseError)?;

    let specs: Vec<ProcessSpec> = match document {
        serde_yaml::Value::Sequence(_) => serde_yaml::from_value(document),
        other => serde_yaml::from_value(other).map(|spec| vec![spec]),
    }
    .map_err(ProcessManagerError::ConfigParseError)?;

    if specs.is_empty() {
        return Err(ProcessManagerError::ConfigInvalid(format!(
            "{} holds no process definitions",
            path.display()
        )));
    }
    for spec in &specs {
        spec.validate()?;
    }
    Ok(specs)
}

/// Parses a user-facing duration string in the format `<number>[ms|s|m|h]`.
pub fn parse_duration(raw: &str) -> Result<Duration, ProcessManagerError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(ProcessManagerError::ConfigInvalid(
            "duration value cannot be empty".into(),
        ));
    }

    let invalid = || ProcessManagerError::ConfigInvalid(format!("invalid duration value: '{raw}'"));

    if let Some(stripped) = value.strip_suffix("ms") {
        let amount: u64 = stripped.trim().parse().map_err(|_| invalid())?;
        return Ok(Duration::from_millis(amount));
    }

    let (amount_str, multiplier) = if let Some(stripped) = value.strip_suffix('s') {
        (stripped.trim(), 1)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped.trim(), 60)
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped.trim(), 3600)
    } else {
        (value, 1)
    };

    let amount: u64 = amount_str.parse().map_err(|_| invalid())?;
    Ok(Duration::from_secs(amount.saturating_mul(multiplier)))
}

/// Formats a duration the way [`parse_duration`] reads it back.
pub fn format_duration(duration: Duration) -> String {
    if duration.subsec_millis() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

/// Serde adapter storing durations as `"1500ms"` / `"30s"` strings; plain integers read as seconds.
pub mod duration_serde {
    use super::{format_duration, parse_duration};
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => parse_duration(&text).map_err(D::Error::custom),
        }
    }
}
