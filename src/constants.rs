//! Constants and default values shared by the daemon, the client and the launcher.
//!
//! File names, environment variable names and timing defaults live here so the
//! daemon and the client agree on them without importing each other.

use std::time::Duration;

// ============================================================================
// File System Constants
// ============================================================================

/// Name of the process record table stored in the state directory.
pub const STATE_FILE_NAME: &str = "state.json";

/// Advisory lock guarding exclusive ownership of the state directory.
pub const STATE_LOCK_FILE_NAME: &str = "state.lock";

/// Default name of the control socket inside the state directory.
pub const SOCKET_FILE_NAME: &str = "warden.sock";

/// File the daemon records its own PID in.
pub const DAEMON_PID_FILE_NAME: &str = "wardend.pid";

/// Sub-directory of the state directory holding captured process output.
pub const LOG_DIR_NAME: &str = "logs";

/// Log file the daemon writes its own tracing output to when daemonized.
pub const DAEMON_LOG_FILE_NAME: &str = "wardend.log";

/// Default daemon configuration file name, looked up in the config directory.
pub const CONFIG_FILE_NAME: &str = "wardend.yaml";

// ============================================================================
// Environment Variables
// ============================================================================

/// Overrides the state directory (`~/.local/share/warden` by default).
pub const HOME_ENV: &str = "WARDEN_HOME";

/// Overrides the control socket path for both the daemon and the client.
pub const SOCKET_ENV: &str = "WARDEN_SOCKET";

/// Directory the launcher searches first for the client and daemon binaries.
pub const BIN_DIR_ENV: &str = "WARDEN_BIN_DIR";

// ============================================================================
// Supervision Timing
// ============================================================================

/// Grace period between SIGTERM and SIGKILL on explicit stop.
pub const DEFAULT_STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// A run lasting at least this long resets the restart counter.
pub const DEFAULT_STABILITY_THRESHOLD: Duration = Duration::from_secs(10);

/// Default base delay before the first restart.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Upper bound on the restart delay.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Growth factor applied per consecutive restart.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Rolling window `max_restarts` is counted over.
pub const DEFAULT_RESTART_WINDOW: Duration = Duration::from_secs(60);

// ============================================================================
// Command Channel
// ============================================================================

/// Read/write timeout applied to every control connection.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest request line the server will buffer.
pub const MAX_REQUEST_BYTES: u64 = 1024 * 1024;

/// Lines returned by `tail` when the client does not ask for a count.
pub const DEFAULT_TAIL_LINES: usize = 50;

/// Exit code reported by the launcher when the forwarded call was interrupted.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// How long the client waits for the daemon to answer one command.
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(30);
