//! Error handling for warden.
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

/// Wire-level classification of a failed command, shared by the daemon and the client.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    AlreadyRunning,
    NotRunning,
    SpawnFailure,
    BadRequest,
    Unavailable,
    Internal,
}

/// Defines all possible errors that can occur in the process manager.
#[derive(Debug, Error)]
pub enum ProcessManagerError {
    /// No record is registered under the given name.
    #[error("process '{0}' is not registered")]
    NotFound(String),

    /// The command is incompatible with the record's current state.
    #[error("conflict on '{name}': {reason}")]
    Conflict {
        /// The process the command targeted.
        name: String,
        /// Why the command was rejected.
        reason: String,
    },

    /// Start was requested for a process that already has a live loop.
    #[error("process '{0}' is already running")]
    AlreadyRunning(String),

    /// Stop was requested for a process with no live loop.
    #[error("process '{0}' is not running")]
    NotRunning(String),

    /// The OS refused to create the child process.
    #[error("failed to spawn '{name}': {source}")]
    SpawnFailure {
        /// The process that failed to spawn.
        name: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// A request or process definition failed validation.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The record store cannot be written; mutating commands are refused.
    #[error("record store unavailable: {0}")]
    Unavailable(String),

    /// Error stopping a process.
    #[error("failed to stop '{name}': {source}")]
    StopError {
        /// The process that failed to stop.
        name: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Writing to a process's stdin failed.
    #[error("failed to write to stdin of '{name}': {source}")]
    WriteError {
        /// The process whose stdin was written.
        name: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error reading or accessing a configuration file.
    #[error("failed to read config file: {0}")]
    ConfigReadError(#[from] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("invalid YAML format: {0}")]
    ConfigParseError(#[from] serde_yaml::Error),

    /// Configuration referenced something that could not be resolved.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Error raised by the process record store.
    #[error("record store error: {0}")]
    Store(#[from] StoreError),

    /// Error reading or opening a process log.
    #[error(transparent)]
    Logs(#[from] LogsManagerError),

    /// Error for poisoned mutex.
    #[error("mutex is poisoned: {0}")]
    MutexPoisonError(String),

    /// Error from a raw system call.
    #[error("system call failed: {0}")]
    ErrNo(#[from] nix::errno::Errno),
}

impl ProcessManagerError {
    /// Maps the error onto the kind reported to clients.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::AlreadyRunning(_) => ErrorKind::AlreadyRunning,
            Self::NotRunning(_) => ErrorKind::NotRunning,
            Self::SpawnFailure { .. } => ErrorKind::SpawnFailure,
            Self::BadRequest(_) => ErrorKind::BadRequest,
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::Store(StoreError::NotFound(_)) => ErrorKind::NotFound,
            Self::Store(StoreError::AlreadyExists(_)) => ErrorKind::Conflict,
            Self::Store(StoreError::Active(_)) => ErrorKind::Conflict,
            Self::Store(StoreError::Persist(_)) => ErrorKind::Unavailable,
            _ => ErrorKind::Internal,
        }
    }
}

/// Implement the `From` trait to convert a `std::sync::PoisonError` into a `ProcessManagerError`.
impl<T> From<std::sync::PoisonError<T>> for ProcessManagerError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ProcessManagerError::MutexPoisonError(err.to_string())
    }
}

/// Error type for process record store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Error reading the state file from disk.
    #[error("failed to read state file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Error parsing JSON contents of the state file.
    #[error("failed to parse state file: {0}")]
    ParseError(#[from] serde_json::Error),

    /// Writing the state file failed; the in-memory table still holds the change.
    #[error("failed to persist state file: {0}")]
    Persist(String),

    /// Another daemon holds the state directory lock.
    #[error("state directory {0} is locked by another daemon")]
    Locked(String),

    /// No record with that name exists.
    #[error("process '{0}' not found in state file")]
    NotFound(String),

    /// A record with that name already exists.
    #[error("process '{0}' is already registered")]
    AlreadyExists(String),

    /// The record still has a live process attached.
    #[error("process '{0}' is still active")]
    Active(String),

    /// A state change the supervisor state machine does not allow.
    #[error("process '{name}' cannot move from {from} to {to}")]
    IllegalTransition {
        /// The process whose transition was refused.
        name: String,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// Error for poisoned mutex.
    #[error("mutex is poisoned: {0}")]
    MutexPoisonError(String),
}

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        StoreError::MutexPoisonError(err.to_string())
    }
}

/// Error type for reading captured process output.
#[derive(Debug, Error)]
pub enum LogsManagerError {
    /// The log file exists but could not be read.
    #[error("log read failed for {path}: {source}")]
    ReadError {
        /// Path of the log file.
        path: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// The log file could not be opened for appending.
    #[error("log file {path} unavailable: {source}")]
    OpenError {
        /// Path of the log file.
        path: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },
}
