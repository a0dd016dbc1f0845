//! Human-readable rendering of process snapshots for the client.
use chrono::{DateTime, Utc};
use std::fmt::Write as _;

use crate::config::format_duration;
use crate::process::{ProcessSnapshot, ProcessStatus, RestartPolicy};

const GREEN_BOLD: &str = "\x1b[1;32m"; // Bright Green
const RED_BOLD: &str = "\x1b[1;31m"; // Bright Red
const MAGENTA_BOLD: &str = "\x1b[1;35m"; // Magenta
const YELLOW_BOLD: &str = "\x1b[1;33m"; // Yellow/Gold
const RESET: &str = "\x1b[0m"; // Reset color

/// Whether rendered output may contain ANSI colors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMode {
    Always,
    Never,
}

impl ColorMode {
    fn paint(self, color: &str, text: &str) -> String {
        match self {
            ColorMode::Always => format!("{color}{text}{RESET}"),
            ColorMode::Never => text.to_string(),
        }
    }
}

fn status_color(status: ProcessStatus) -> &'static str {
    match status {
        ProcessStatus::Running => GREEN_BOLD,
        ProcessStatus::Failed => RED_BOLD,
        ProcessStatus::Starting | ProcessStatus::Backoff | ProcessStatus::Stopping => {
            YELLOW_BOLD
        }
        ProcessStatus::Stopped => "",
    }
}

/// Formats an elapsed number of seconds, e.g. `3 mins ago`.
pub fn format_elapsed(total_seconds: u64) -> String {
    match total_seconds {
        0..=59 => format!("{} secs ago", total_seconds),
        60..=3_599 => format!("{} mins ago", total_seconds / 60),
        3_600..=86_399 => format!("{} hours ago", total_seconds / 3_600),
        86_400..=604_799 => format!("{} days ago", total_seconds / 86_400),
        _ => format!("{} weeks ago", total_seconds / 604_800),
    }
}

fn since(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let seconds = now
        .signed_duration_since(timestamp)
        .to_std()
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    format!(
        "{}; {}",
        timestamp.format("%a %Y-%m-%d %H:%M:%S UTC"),
        format_elapsed(seconds)
    )
}

fn last_exit(snapshot: &ProcessSnapshot) -> Option<String> {
    match (snapshot.state.last_exit_code, snapshot.state.last_signal) {
        (Some(code), _) => Some(format!("exit code {code}")),
        (None, Some(signal)) => Some(format!("signal {signal}")),
        _ => None,
    }
}

fn command_line(snapshot: &ProcessSnapshot) -> String {
    std::iter::once(snapshot.spec.command.as_str())
        .chain(snapshot.spec.args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

fn restart_summary(snapshot: &ProcessSnapshot) -> String {
    let spec = &snapshot.spec;
    let limit = match spec.restart_limit() {
        Some(max) => format!("max {max} per {}", format_duration(spec.restart_window)),
        None => "unlimited".to_string(),
    };
    let backoff = format!(
        "backoff {}..{} x{}",
        format_duration(spec.backoff.base),
        format_duration(spec.backoff.max),
        spec.backoff.multiplier
    );
    match spec.restart_policy {
        RestartPolicy::Never => "never".to_string(),
        policy => format!("{policy} ({limit}, {backoff})"),
    }
}

/// Detailed multi-line view of one process.
pub fn render_status(snapshot: &ProcessSnapshot, now: DateTime<Utc>, color: ColorMode) -> String {
    let state = &snapshot.state;
    let mut out = String::new();

    let headline = color.paint(status_color(state.status), state.status.as_ref());
    let _ = writeln!(out, "● {} - {}", snapshot.spec.name, headline);

    match (state.status, state.started_at) {
        (ProcessStatus::Running, Some(started_at)) => {
            let _ = writeln!(
                out,
                "   Active: {} since {}",
                color.paint(GREEN_BOLD, "active (running)"),
                since(started_at, now)
            );
        }
        _ => {
            if let Some(updated_at) = state.updated_at {
                let _ = writeln!(out, "    Since: {}", since(updated_at, now));
            }
        }
    }

    if let Some(pid) = state.pid {
        let _ = writeln!(out, " Main PID: {pid}");
    }
    let _ = writeln!(out, "  Command: {}", command_line(snapshot));
    if let Some(dir) = &snapshot.spec.working_dir {
        let _ = writeln!(out, "  WorkDir: {}", dir.display());
    }
    let _ = writeln!(out, "  Restart: {}", restart_summary(snapshot));
    let _ = writeln!(
        out,
        "{}",
        color.paint(MAGENTA_BOLD, &format!(" Restarts: {}", state.restart_count))
    );
    if let Some(exit) = last_exit(snapshot) {
        let _ = writeln!(out, "Last exit: {exit}");
    }
    if let Some(error) = &state.last_error {
        let _ = writeln!(out, "    Error: {}", color.paint(RED_BOLD, error));
    }

    out
}

/// One row per process: name, status, pid, restarts, last exit.
pub fn render_list(snapshots: &[ProcessSnapshot], color: ColorMode) -> String {
    if snapshots.is_empty() {
        return "No processes registered\n".to_string();
    }

    let name_width = snapshots
        .iter()
        .map(|snapshot| snapshot.spec.name.len())
        .max()
        .unwrap_or(0)
        .max("NAME".len());

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<name_width$}  {:<8}  {:>8}  {:>8}  LAST EXIT",
        "NAME", "STATUS", "PID", "RESTARTS"
    );

    for snapshot in snapshots {
        let state = &snapshot.state;
        // Pad before painting so escape codes do not skew the columns.
        let status = format!("{:<8}", state.status.as_ref());
        let pid = state
            .pid
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "-".into());
        let _ = writeln!(
            out,
            "{:<name_width$}  {}  {:>8}  {:>8}  {}",
            snapshot.spec.name,
            color.paint(status_color(state.status), &status),
            pid,
            state.restart_count,
            last_exit(snapshot).unwrap_or_else(|| "-".into())
        );
    }

    out
}
