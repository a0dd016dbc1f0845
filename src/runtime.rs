//! Runtime paths and directory modes.
use std::{env, path::PathBuf};

use crate::constants::{CONFIG_FILE_NAME, HOME_ENV, LOG_DIR_NAME, SOCKET_ENV, SOCKET_FILE_NAME};

/// Where to store state/logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RuntimeMode {
    /// User home dir (~/.local/share/warden).
    #[default]
    User,
    /// System dirs (/var/lib/warden).
    System,
}

/// Directories the daemon and client agree on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    pub state_dir: PathBuf,
    pub log_dir: PathBuf,
    pub config_dir: PathBuf,
}

impl RuntimePaths {
    /// Resolves the directories for `mode`, honouring `WARDEN_HOME` in user mode.
    pub fn resolve(mode: RuntimeMode) -> Self {
        match mode {
            RuntimeMode::User => match env::var_os(HOME_ENV) {
                Some(dir) if !dir.is_empty() => Self::rooted_at(PathBuf::from(dir)),
                _ => Self::user_directories(),
            },
            RuntimeMode::System => Self::system_directories(),
        }
    }

    /// Lays every directory out beneath a single root.
    pub fn rooted_at(root: PathBuf) -> Self {
        Self {
            log_dir: root.join(LOG_DIR_NAME),
            config_dir: root.clone(),
            state_dir: root,
        }
    }

    fn user_directories() -> Self {
        let home = env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/"));
        let state_dir = home.join(".local/share/warden");
        Self {
            log_dir: state_dir.join(LOG_DIR_NAME),
            config_dir: home.join(".config/warden"),
            state_dir,
        }
    }

    fn system_directories() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/warden"),
            log_dir: PathBuf::from("/var/log/warden"),
            config_dir: PathBuf::from("/etc/warden"),
        }
    }

    /// Default daemon config location.
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE_NAME)
    }

    /// Socket path used when neither the config nor the environment names one.
    pub fn default_socket(&self) -> PathBuf {
        self.state_dir.join(SOCKET_FILE_NAME)
    }
}

/// Socket path named by `WARDEN_SOCKET`, if set.
pub fn socket_from_env() -> Option<PathBuf> {
    env::var_os(SOCKET_ENV)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

/// Resolves the socket a client should dial: explicit flag, then environment, then default.
pub fn client_socket_path(explicit: Option<PathBuf>, mode: RuntimeMode) -> PathBuf {
    explicit
        .or_else(socket_from_env)
        .unwrap_or_else(|| RuntimePaths::resolve(mode).default_socket())
}
