//! Captured output of managed processes.
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::{Path, PathBuf};

use crate::error::LogsManagerError;
use crate::process::ProcessSpec;

/// Log file for `spec`: its own `log_path`, else `<log_dir>/<name>.log`.
pub fn resolve_log_path(log_dir: &Path, spec: &ProcessSpec) -> PathBuf {
    spec.log_path
        .clone()
        .unwrap_or_else(|| log_dir.join(format!("{}.log", spec.name)))
}

/// Opens the append-only sink a child's stdout and stderr are redirected into.
pub fn open_log_sink(path: &Path) -> Result<File, LogsManagerError> {
    let open_error = |source| LogsManagerError::OpenError {
        path: path.display().to_string(),
        source,
    };

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(open_error)?;
    }

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(open_error)
}

/// Returns the last `lines` lines of the log at `path`.
///
/// A log that has not been created yet reads as empty. Invalid UTF-8 is replaced
/// rather than rejected, since children write arbitrary bytes.
pub fn tail_lines(path: &Path, lines: usize) -> Result<Vec<String>, LogsManagerError> {
    let read_error = |source| LogsManagerError::ReadError {
        path: path.display().to_string(),
        source,
    };

    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(read_error(err)),
    };

    if lines == 0 {
        return Ok(Vec::new());
    }

    let mut reader = BufReader::new(file);
    let mut window: VecDeque<String> = VecDeque::with_capacity(lines.min(4096));
    let mut buffer = Vec::new();

    loop {
        buffer.clear();
        let read = reader.read_until(b'\n', &mut buffer).map_err(read_error)?;
        if read == 0 {
            break;
        }
        while matches!(buffer.last(), Some(b'\n') | Some(b'\r')) {
            buffer.pop();
        }
        if window.len() == lines {
            window.pop_front();
        }
        window.push_back(String::from_utf8_lossy(&buffer).into_owned());
    }

    Ok(window.into())
}
