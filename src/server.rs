//! Command channel server: accepts client connections and dispatches them to the daemon.
use std::{
    fs, io,
    os::unix::{
        fs::PermissionsExt,
        net::{UnixListener, UnixStream},
    },
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    daemon::{Daemon, ListFilter},
    error::{ErrorKind, ProcessManagerError},
    ipc::{
        self, CommandKind, ControlError, ListArgs, RemoveArgs, Request, Response,
        ShutdownOutput, TailArgs, TailOutput, WriteArgs, WriteOutput,
    },
    process::ProcessSpec,
};

/// Errors emitted by the server runtime.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Process(#[from] ProcessManagerError),
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("another daemon is already listening on {}", .0.display())]
    AlreadyListening(PathBuf),
}

/// Cloneable trigger that stops the accept loop.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    requested: Arc<AtomicBool>,
    socket_path: PathBuf,
}

impl ShutdownSignal {
    /// Requests shutdown and wakes the accept loop with a throwaway connection.
    pub fn trigger(&self) {
        if !self.requested.swap(true, Ordering::SeqCst) {
            let _ = UnixStream::connect(&self.socket_path);
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Listens on the control socket and serves one request per connection.
pub struct Server {
    daemon: Arc<Daemon>,
    socket_path: PathBuf,
    pid_path: PathBuf,
    io_timeout: Duration,
    shutdown: ShutdownSignal,
}

impl Server {
    pub fn new(
        daemon: Arc<Daemon>,
        socket_path: PathBuf,
        pid_path: PathBuf,
        io_timeout: Duration,
    ) -> Self {
        let shutdown = ShutdownSignal {
            requested: Arc::new(AtomicBool::new(false)),
            socket_path: socket_path.clone(),
        };
        Self {
            daemon,
            socket_path,
            pid_path,
            io_timeout,
            shutdown,
        }
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Binds the socket and serves until shutdown is requested.
    ///
    /// On exit every supervisor loop is stopped and the socket and pid files are removed.
    pub fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind()?;
        fs::write(&self.pid_path, std::process::id().to_string())?;
        info!("wardend listening on {}", self.socket_path.display());

        for stream in listener.incoming() {
            if self.shutdown.is_requested() {
                break;
            }
            match stream {
                Ok(stream) => {
                    let daemon = Arc::clone(&self.daemon);
                    let shutdown = self.shutdown.clone();
                    let io_timeout = self.io_timeout;
                    let spawned = thread::Builder::new()
                        .name("warden-conn".into())
                        .spawn(move || handle_connection(&daemon, stream, io_timeout, &shutdown));
                    if let Err(err) = spawned {
                        error!("Failed to spawn connection thread: {err}");
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("Control listener error: {err}");
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }

        info!("Shutting down");
        let result = self.daemon.shutdown();
        self.cleanup();
        result?;
        Ok(())
    }

    fn bind(&self) -> Result<UnixListener, ServerError> {
        if let Some(parent) = self.socket_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        if self.socket_path.exists() {
            if UnixStream::connect(&self.socket_path).is_ok() {
                return Err(ServerError::AlreadyListening(self.socket_path.clone()));
            }
            debug!("Removing stale socket {}", self.socket_path.display());
            fs::remove_file(&self.socket_path)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        fs::set_permissions(&self.socket_path, fs::Permissions::from_mode(0o600))?;
        Ok(listener)
    }

    fn cleanup(&self) {
        for path in [&self.socket_path, &self.pid_path] {
            if let Err(err) = fs::remove_file(path)
                && err.kind() != io::ErrorKind::NotFound
            {
                warn!("Failed to remove {}: {err}", path.display());
            }
        }
    }
}

/// Serves one exchange. Receiving the request and sending the response each get
/// `io_timeout` in total, however the peer paces its bytes.
fn handle_connection(
    daemon: &Daemon,
    stream: UnixStream,
    io_timeout: Duration,
    shutdown: &ShutdownSignal,
) {
    let (response, stop_server) = match ipc::read_request(&stream, io_timeout) {
        Ok(request) => {
            debug!("Received command: {:?}", request);
            let response = dispatch(daemon, &request);
            let stop_server = request.command == CommandKind::Shutdown && response.ok;
            (response, stop_server)
        }
        Err(ControlError::Timeout) => {
            warn!("Dropped a connection that sent no complete request within {io_timeout:?}");
            let message = format!("request not received within {io_timeout:?}");
            (Response::failure(ErrorKind::BadRequest, message), false)
        }
        Err(err) => {
            warn!("Rejected malformed request: {err}");
            (Response::failure(ErrorKind::BadRequest, err.to_string()), false)
        }
    };

    if let Err(err) = ipc::write_response(&stream, &response, io_timeout) {
        debug!("Failed to write response: {err}");
    }

    if stop_server {
        shutdown.trigger();
    }
}

/// Executes one request against the daemon.
pub fn dispatch(daemon: &Daemon, request: &Request) -> Response {
    match execute(daemon, request) {
        Ok(response) => response,
        Err(err) => {
            match err.kind() {
                ErrorKind::Internal | ErrorKind::Unavailable => {
                    error!("Command '{}' failed: {err}", request.command)
                }
                _ => debug!("Command '{}' rejected: {err}", request.command),
            }
            Response::from(&err)
        }
    }
}

fn execute(daemon: &Daemon, request: &Request) -> Result<Response, ProcessManagerError> {
    let response = match request.command {
        CommandKind::Register | CommandKind::Update => {
            let spec: ProcessSpec = request.required_payload()?;
            if let Some(name) = request.name.as_deref()
                && name != spec.name
            {
                return Err(ProcessManagerError::BadRequest(format!(
                    "request names '{name}' but the spec is for '{}'",
                    spec.name
                )));
            }
            let snapshot = if request.command == CommandKind::Register {
                daemon.register(spec)?
            } else {
                daemon.update(spec)?
            };
            Response::with_data(&snapshot)
        }
        CommandKind::Start => Response::with_data(&daemon.start(request.required_name()?)?),
        CommandKind::Stop => Response::with_data(&daemon.stop(request.required_name()?)?),
        CommandKind::Restart => {
            Response::with_data(&daemon.restart(request.required_name()?)?)
        }
        CommandKind::Remove => {
            let name = request.required_name()?;
            let args: RemoveArgs = request.payload_or_default()?;
            Response::with_data(&daemon.remove(name, args.force)?)
        }
        CommandKind::Status => Response::with_data(&daemon.get(request.required_name()?)?),
        CommandKind::List => {
            let args: ListArgs = request.payload_or_default()?;
            let filter = ListFilter::new(args.pattern.as_deref(), args.status)?;
            Response::with_data(&daemon.list_matching(&filter)?)
        }
        CommandKind::Tail => {
            let name = request.required_name()?;
            let args: TailArgs = request.payload_or_default()?;
            Response::with_data(&TailOutput {
                name: name.to_string(),
                lines: daemon.tail(name, args.lines)?,
            })
        }
        CommandKind::Write => {
            let name = request.required_name()?;
            let args: WriteArgs = request.required_payload()?;
            Response::with_data(&WriteOutput {
                name: name.to_string(),
                bytes: daemon.write(name, args.data.as_bytes())?,
            })
        }
        CommandKind::Shutdown => Response::with_data(&ShutdownOutput {
            stopped: daemon.shutdown()?,
        }),
    };
    Ok(response)
}
