//! Warden is a single-host process supervisor. A resident daemon (`wardend`) owns a
//! table of named process records, keeps each registered process alive according to
//! its restart policy, and answers commands from the `warden` client over a local
//! unix socket.

/// CLI interface for the client and the daemon.
pub mod cli;

/// Configuration management.
pub mod config;

/// Shared file names, environment variables and defaults.
pub mod constants;

/// The daemon core: lifecycle operations over the record store and supervisor loops.
pub mod daemon;

/// Error handling.
pub mod error;

/// Wire protocol and client for the command channel.
pub mod ipc;

/// Locates and forwards to the client or daemon binaries.
pub mod launcher;

/// Captured process output.
pub mod logs;

/// Process specifications and runtime state.
pub mod process;

/// Runtime directory layout.
pub mod runtime;

/// Per-name ordering of mutating operations.
pub mod sequencer;

/// Control socket server run by the daemon.
pub mod server;

/// Status manager.
pub mod status;

/// Durable process record table.
pub mod store;

/// Per-process supervisor loops.
pub mod supervisor;

#[cfg(test)]
mod test_utils;
