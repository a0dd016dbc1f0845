//! Locates the client or daemon executable and forwards an invocation to it.
use std::{
    env,
    ffi::OsString,
    io,
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::Command,
    sync::{
        Once,
        atomic::{AtomicBool, Ordering},
    },
};

use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;
use tracing::{debug, warn};

use crate::constants::{BIN_DIR_ENV, INTERRUPTED_EXIT_CODE};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);
static HANDLER: Once = Once::new();

/// Which executable an invocation is forwarded to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Role {
    Client,
    Daemon,
}

impl Role {
    /// Platform file name of the executable.
    pub fn binary_name(self) -> String {
        let base = match self {
            Role::Client => "warden",
            Role::Daemon => "wardend",
        };
        format!("{base}{}", env::consts::EXE_SUFFIX)
    }
}

/// Errors raised while locating or running the forwarded binary.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("{name} binary not found (searched: {searched})")]
    NotFound { name: String, searched: String },
    #[error("failed to run {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Directories searched for binaries: `$WARDEN_BIN_DIR`, then the launcher's own directory.
pub fn search_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(dir) = env::var_os(BIN_DIR_ENV).filter(|dir| !dir.is_empty()) {
        dirs.push(PathBuf::from(dir));
    }
    if let Some(dir) = env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        dirs.push(dir);
    }
    dirs
}

/// Finds the executable for `role` in the default search directories.
pub fn locate(role: Role) -> Result<PathBuf, LaunchError> {
    locate_in(role, &search_dirs())
}

/// Finds the executable for `role` in `dirs`, first match wins.
pub fn locate_in(role: Role, dirs: &[PathBuf]) -> Result<PathBuf, LaunchError> {
    let name = role.binary_name();
    for dir in dirs {
        let candidate = dir.join(&name);
        if candidate.is_file() {
            debug!("Located {role} binary at {}", candidate.display());
            return Ok(candidate);
        }
    }

    Err(LaunchError::NotFound {
        name,
        searched: dirs
            .iter()
            .map(|dir| dir.display().to_string())
            .collect::<Vec<_>>()
            .join(", "),
    })
}

fn install_interrupt_handler() {
    HANDLER.call_once(|| {
        if let Err(err) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::SeqCst)) {
            warn!("Failed to install interrupt handler: {err}");
        }
    });
}

/// Runs `path` with `args` unmodified and returns the exit code to propagate.
///
/// An interrupt while the child runs is reported and mapped to exit code 130.
pub fn forward(path: &Path, args: &[OsString]) -> Result<i32, LaunchError> {
    install_interrupt_handler();
    INTERRUPTED.store(false, Ordering::SeqCst);

    let status = Command::new(path)
        .args(args)
        .status()
        .map_err(|source| LaunchError::Spawn {
            path: path.to_path_buf(),
            source,
        })?;

    if INTERRUPTED.load(Ordering::SeqCst) || status.signal() == Some(libc::SIGINT) {
        eprintln!("Interrupted");
        return Ok(INTERRUPTED_EXIT_CODE);
    }

    Ok(status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(1))
}
