//! Wire protocol of the command channel and the client side of it.
//!
//! Each connection carries exactly one newline-terminated JSON request and one
//! newline-terminated JSON response.
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::{
    io::{self, BufRead, BufReader, Read, Write},
    os::unix::net::UnixStream,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

use crate::constants::{DEFAULT_TAIL_LINES, MAX_REQUEST_BYTES};
use crate::error::{ErrorKind, ProcessManagerError};
use crate::process::ProcessStatus;

/// Commands understood by the daemon.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CommandKind {
    Register,
    Update,
    Start,
    Stop,
    Restart,
    Remove,
    Status,
    List,
    Tail,
    Write,
    Shutdown,
}

impl CommandKind {
    /// Commands addressed to a single process by name.
    pub fn requires_name(self) -> bool {
        matches!(
            self,
            CommandKind::Start
                | CommandKind::Stop
                | CommandKind::Restart
                | CommandKind::Remove
                | CommandKind::Status
                | CommandKind::Tail
                | CommandKind::Write
        )
    }
}

/// One client request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub command: CommandKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Request {
    pub fn new(command: CommandKind) -> Self {
        Self {
            command,
            name: None,
            payload: None,
        }
    }

    pub fn named(command: CommandKind, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::new(command)
        }
    }

    /// Attaches a serialized payload.
    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Result<Self, ControlError> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    /// Decodes the payload, falling back to `T::default()` when none was sent.
    pub fn payload_or_default<T: DeserializeOwned + Default>(
        &self,
    ) -> Result<T, ProcessManagerError> {
        match &self.payload {
            None | Some(Value::Null) => Ok(T::default()),
            Some(value) => self.decode(value),
        }
    }

    /// Decodes a payload the command cannot do without.
    pub fn required_payload<T: DeserializeOwned>(&self) -> Result<T, ProcessManagerError> {
        match &self.payload {
            None | Some(Value::Null) => Err(ProcessManagerError::BadRequest(format!(
                "command '{}' requires a payload",
                self.command
            ))),
            Some(value) => self.decode(value),
        }
    }

    fn decode<T: DeserializeOwned>(&self, value: &Value) -> Result<T, ProcessManagerError> {
        T::deserialize(value).map_err(|err| {
            ProcessManagerError::BadRequest(format!(
                "invalid payload for '{}': {err}",
                self.command
            ))
        })
    }

    /// The target name of a per-process command.
    pub fn required_name(&self) -> Result<&str, ProcessManagerError> {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => Ok(name),
            _ => Err(ProcessManagerError::BadRequest(format!(
                "command '{}' requires a process name",
                self.command
            ))),
        }
    }
}

/// Payload of `tail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TailArgs {
    #[serde(default = "default_tail_lines")]
    pub lines: usize,
}

fn default_tail_lines() -> usize {
    DEFAULT_TAIL_LINES
}

impl Default for TailArgs {
    fn default() -> Self {
        Self {
            lines: DEFAULT_TAIL_LINES,
        }
    }
}

/// Payload of `remove`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveArgs {
    #[serde(default)]
    pub force: bool,
}

/// Payload of `list`; every field narrows the result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListArgs {
    /// Regular expression matched against process names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ProcessStatus>,
}

/// Payload of `write`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteArgs {
    pub data: String,
}

/// Data returned by `write`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOutput {
    pub name: String,
    pub bytes: usize,
}

/// Data returned by `tail`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TailOutput {
    pub name: String,
    pub lines: Vec<String>,
}

/// Data returned by `shutdown`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownOutput {
    pub stopped: Vec<String>,
}

/// Failure detail carried by an unsuccessful response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

/// The daemon's answer to one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Response {
    pub fn success(data: Option<Value>) -> Self {
        Self {
            ok: true,
            error: None,
            data,
        }
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(ErrorBody {
                kind,
                message: message.into(),
            }),
            data: None,
        }
    }

    /// Serializes `data` into a successful response.
    pub fn with_data<T: Serialize>(data: &T) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => Self::success(Some(value)),
            Err(err) => Self::failure(ErrorKind::Internal, err.to_string()),
        }
    }

    /// Unwraps a successful response into its data, or the error it carried.
    pub fn into_result(self) -> Result<Option<Value>, ControlError> {
        if self.ok {
            return Ok(self.data);
        }
        let body = self.error.unwrap_or_else(|| ErrorBody {
            kind: ErrorKind::Internal,
            message: "daemon reported failure without detail".into(),
        });
        Err(ControlError::Command {
            kind: body.kind,
            message: body.message,
        })
    }
}

impl From<&ProcessManagerError> for Response {
    fn from(err: &ProcessManagerError) -> Self {
        Response::failure(err.kind(), err.to_string())
    }
}

/// Errors raised by the command channel helpers.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control socket I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("failed to serialise control message: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("daemon is not reachable at {}: {source}", path.display())]
    ChannelUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("timed out waiting for the daemon")]
    Timeout,
    #[error("request exceeds the 1 MiB limit")]
    RequestTooLarge,
    #[error("connection closed before a complete message was received")]
    EmptyMessage,
    #[error("{kind}: {message}")]
    Command { kind: ErrorKind, message: String },
}

impl ControlError {
    /// Client exit code: `2` for errors the daemon reported, `1` for everything
    /// that kept the command from reaching or leaving the daemon.
    pub fn exit_code(&self) -> i32 {
        match self {
            ControlError::Command { .. } => 2,
            _ => 1,
        }
    }

    fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ControlError::Timeout,
            _ => ControlError::Io(err),
        }
    }
}

/// A connection whose reads and writes share one deadline.
///
/// Socket timeouts apply per syscall; re-arming them with the time that is
/// left keeps a peer trickling bytes from holding the connection open.
struct Bounded<'a> {
    stream: &'a UnixStream,
    deadline: Instant,
}

impl<'a> Bounded<'a> {
    fn new(stream: &'a UnixStream, budget: Duration) -> Self {
        Self {
            stream,
            deadline: Instant::now() + budget,
        }
    }

    fn remaining(&self) -> io::Result<Duration> {
        let left = self.deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "connection deadline passed"));
        }
        Ok(left)
    }
}

impl Read for Bounded<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut stream = self.stream;
        stream.set_read_timeout(Some(self.remaining()?))?;
        stream.read(buf)
    }
}

impl Write for Bounded<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut stream = self.stream;
        stream.set_write_timeout(Some(self.remaining()?))?;
        stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut stream = self.stream;
        stream.flush()
    }
}

/// Reads one newline-delimited JSON message, refusing anything over the size cap.
fn read_message<T: DeserializeOwned>(stream: impl Read) -> Result<T, ControlError> {
    let mut reader = BufReader::new(stream.take(MAX_REQUEST_BYTES + 1));
    let mut line = Vec::new();
    reader
        .read_until(b'\n', &mut line)
        .map_err(ControlError::from_io)?;

    if line.len() as u64 > MAX_REQUEST_BYTES {
        return Err(ControlError::RequestTooLarge);
    }
    if line.iter().all(u8::is_ascii_whitespace) {
        return Err(ControlError::EmptyMessage);
    }

    Ok(serde_json::from_slice(&line)?)
}

fn write_message<T: Serialize>(mut stream: impl Write, message: &T) -> Result<(), ControlError> {
    let mut payload = serde_json::to_vec(message)?;
    payload.push(b'\n');
    stream.write_all(&payload).map_err(ControlError::from_io)?;
    stream.flush().map_err(ControlError::from_io)?;
    Ok(())
}

/// Reads a request, giving the client `budget` in total to send it.
pub fn read_request(stream: &UnixStream, budget: Duration) -> Result<Request, ControlError> {
    read_message(Bounded::new(stream, budget))
}

/// Writes a response to the connected client within `budget`.
pub fn write_response(
    stream: &UnixStream,
    response: &Response,
    budget: Duration,
) -> Result<(), ControlError> {
    write_message(Bounded::new(stream, budget), response)
}

/// Client connection to the daemon.
#[derive(Debug, Clone)]
pub struct Client {
    socket: PathBuf,
    timeout: Duration,
}

impl Client {
    pub fn new(socket: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            socket: socket.into(),
            timeout,
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Sends one request and returns the raw response; the whole exchange shares the timeout.
    pub fn send(&self, request: &Request) -> Result<Response, ControlError> {
        let stream =
            UnixStream::connect(&self.socket).map_err(|source| ControlError::ChannelUnavailable {
                path: self.socket.clone(),
                source,
            })?;

        let mut exchange = Bounded::new(&stream, self.timeout);
        write_message(&mut exchange, request)?;
        read_message(exchange)
    }

    /// Sends one request and unwraps the response.
    pub fn call(&self, request: &Request) -> Result<Option<Value>, ControlError> {
        self.send(request)?.into_result()
    }

    /// Like [`Client::call`], decoding the returned data.
    pub fn call_as<T: DeserializeOwned>(&self, request: &Request) -> Result<T, ControlError> {
        let data = self.call(request)?.unwrap_or(Value::Null);
        Ok(serde_json::from_value(data)?)
    }
}
